// src/transport/conn.rs
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::{Protocol, TlsClientConfig};

/// Connection establishment timeout, shared by all dial paths.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Protocol floor for the UDP receive buffer.
pub const MIN_MSG_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connect {proto}//{addr} timed out")]
    Timeout { proto: Protocol, addr: SocketAddr },

    #[error("connect {proto}//{addr}: {source}")]
    Connect {
        proto: Protocol,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("tls handshake with {addr}: {source}")]
    Handshake { addr: SocketAddr, source: io::Error },

    #[error("dialing {addr} over tls without a tls config")]
    MissingTlsConfig { addr: SocketAddr },
}

/// A dialed upstream connection. Dropping it closes the socket, which is the
/// release contract `Exchange` relies on for every exit path.
#[derive(Debug)]
pub enum Conn {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Dials `addr` over `proto` within `DIAL_TIMEOUT`. TLS dialing requires the
/// shared client config to be present.
pub async fn connect(
    proto: Protocol,
    addr: SocketAddr,
    tls: Option<&TlsClientConfig>,
) -> Result<Conn, DialError> {
    match proto {
        Protocol::Udp => {
            let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr)
                .await
                .map_err(|source| DialError::Connect { proto, addr, source })?;
            socket
                .connect(addr)
                .await
                .map_err(|source| DialError::Connect { proto, addr, source })?;
            Ok(Conn::Udp(socket))
        }
        Protocol::Tcp => Ok(Conn::Tcp(dial_tcp(proto, addr).await?)),
        Protocol::Tls => {
            let tls = tls.ok_or(DialError::MissingTlsConfig { addr })?;
            let stream = dial_tcp(proto, addr).await?;
            let connector = TlsConnector::from(tls.config.clone());
            let stream = timeout(
                DIAL_TIMEOUT,
                connector.connect(tls.server_name.clone(), stream),
            )
            .await
            .map_err(|_| DialError::Timeout { proto, addr })?
            .map_err(|source| DialError::Handshake { addr, source })?;
            Ok(Conn::Tls(Box::new(stream)))
        }
    }
}

async fn dial_tcp(proto: Protocol, addr: SocketAddr) -> Result<TcpStream, DialError> {
    match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Connect { proto, addr, source }),
        Err(_) => Err(DialError::Timeout { proto, addr }),
    }
}

impl Conn {
    pub fn proto(&self) -> Protocol {
        match self {
            Conn::Udp(_) => Protocol::Udp,
            Conn::Tcp(_) => Protocol::Tcp,
            Conn::Tls(_) => Protocol::Tls,
        }
    }

    /// Writes one DNS message under `deadline`. Stream transports carry the
    /// RFC 1035 two-byte length prefix.
    pub async fn send(&mut self, msg: &[u8], deadline: Duration) -> io::Result<()> {
        timeout(deadline, self.send_inner(msg))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded"))?
    }

    async fn send_inner(&mut self, msg: &[u8]) -> io::Result<()> {
        match self {
            Conn::Udp(socket) => {
                socket.send(msg).await?;
                Ok(())
            }
            Conn::Tcp(stream) => write_framed(stream, msg).await,
            Conn::Tls(stream) => write_framed(stream.as_mut(), msg).await,
        }
    }

    /// Reads one DNS message under `deadline`. `udp_size` sizes the datagram
    /// buffer and is floored at `MIN_MSG_SIZE`.
    pub async fn recv(&mut self, deadline: Duration, udp_size: usize) -> io::Result<Vec<u8>> {
        timeout(deadline, self.recv_inner(udp_size))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))?
    }

    async fn recv_inner(&mut self, udp_size: usize) -> io::Result<Vec<u8>> {
        match self {
            Conn::Udp(socket) => {
                let mut buf = vec![0u8; udp_size.max(MIN_MSG_SIZE)];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                Ok(buf)
            }
            Conn::Tcp(stream) => read_framed(stream).await,
            Conn::Tls(stream) => read_framed(stream.as_mut()).await,
        }
    }
}

async fn write_framed<S>(stream: &mut S, msg: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(msg.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "message too large for stream framing",
        )
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(msg).await?;
    stream.flush().await
}

async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn framing_round_trip() {
        let (mut a, mut b) = duplex(1024);
        write_framed(&mut a, b"\x12\x34hello").await.unwrap();
        let got = read_framed(&mut b).await.unwrap();
        assert_eq!(got, b"\x12\x34hello");
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let (mut a, _b) = duplex(1024);
        let huge = vec![0u8; usize::from(u16::MAX) + 1];
        let err = write_framed(&mut a, &huge).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn tcp_dial_to_dead_port_fails_within_timeout() {
        // Bind then drop a listener to get a port with nothing behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let started = std::time::Instant::now();
        let err = connect(Protocol::Tcp, addr, None).await.unwrap_err();
        assert!(matches!(
            err,
            DialError::Connect { .. } | DialError::Timeout { .. }
        ));
        assert!(started.elapsed() < DIAL_TIMEOUT + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn tls_dial_without_config_is_rejected() {
        let addr: SocketAddr = "127.0.0.1:853".parse().unwrap();
        let err = connect(Protocol::Tls, addr, None).await.unwrap_err();
        assert!(matches!(err, DialError::MissingTlsConfig { .. }));
    }
}
