// src/upstream/host.rs
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::{self, Conn, DialError, Protocol, TlsClientConfig, Transport, MIN_MSG_SIZE};

/// Fixed write/read deadline for traffic exchanges.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-probe write/read deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("i/o with {addr}: {source}")]
    Io {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("codec: {0}")]
    Proto(#[from] ProtoError),

    #[error("reply id {got} does not match query id {sent}")]
    IdMismatch {
        sent: u16,
        got: u16,
        reply: Box<Message>,
    },
}

impl ExchangeError {
    /// The reply that accompanied the error, when one was decodable. Probe
    /// classification uses this to tell a dead upstream from a live one that
    /// answered with something off.
    pub fn reply(&self) -> Option<&Message> {
        match self {
            ExchangeError::IdMismatch { reply, .. } => Some(reply),
            _ => None,
        }
    }
}

/// Custom down-classification. Must be side-effect free.
pub type DownFunc = Arc<dyn Fn(&UpstreamHost) -> bool + Send + Sync>;

/// Probe-issuing client handle. Mode fields are interior-mutable because
/// installing a TLS config rewires the client of an already shared host.
struct ProbeClient {
    net: RwLock<Protocol>,
    tls: RwLock<Option<TlsClientConfig>>,
    timeout: Duration,
}

/// One backend resolution server.
pub struct UpstreamHost {
    addr: SocketAddr,
    fails: AtomicU32,
    down_func: Option<DownFunc>,
    client: ProbeClient,
    transport: Arc<Transport>,
    last_probe: RwLock<Option<DateTime<Utc>>>,
}

impl UpstreamHost {
    pub fn new(addr: SocketAddr, transport: Arc<Transport>) -> Self {
        Self {
            addr,
            fails: AtomicU32::new(0),
            down_func: None,
            client: ProbeClient {
                net: RwLock::new(Protocol::Udp),
                tls: RwLock::new(None),
                timeout: PROBE_TIMEOUT,
            },
            transport,
            last_probe: RwLock::new(None),
        }
    }

    pub fn with_down_func<F>(mut self, down_func: F) -> Self
    where
        F: Fn(&UpstreamHost) -> bool + Send + Sync + 'static,
    {
        self.down_func = Some(Arc::new(down_func));
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Probe failures observed since the last successful probe.
    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        *self.last_probe.read()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Switches this host's probe client to TLS and installs `config` on the
    /// shared transport. Every host sharing that transport dials TLS from
    /// here on; that broadcast is the contract, not an accident.
    pub fn set_tls_config(&self, config: TlsClientConfig) {
        *self.client.net.write() = Protocol::Tls;
        *self.client.tls.write() = Some(config.clone());
        self.transport.set_tls(config);
    }

    /// Dials with the transport's negotiated protocol, falling back to the
    /// caller-supplied default when nothing else is configured.
    pub async fn dial(&self, default_proto: Protocol) -> Result<Conn, DialError> {
        let proto = self.transport.effective_proto(default_proto);
        let tls = self.transport.tls();
        transport::connect(proto, self.addr, tls.as_ref()).await
    }

    /// Forwards one query on behalf of real traffic. The read buffer follows
    /// the request's advertised EDNS size, floored at the protocol minimum.
    /// The connection is dropped on every exit path. Never touches the
    /// failure counter; only the periodic probe does health accounting.
    pub async fn exchange(
        &self,
        request: &Message,
        proto: Protocol,
    ) -> Result<Message, ExchangeError> {
        let mut conn = self.dial(proto).await?;

        let udp_size = advertised_size(request);
        let bytes = request.to_vec()?;
        conn.send(&bytes, DEFAULT_TIMEOUT)
            .await
            .map_err(|source| ExchangeError::Io {
                addr: self.addr,
                source,
            })?;

        let buf = conn
            .recv(DEFAULT_TIMEOUT, udp_size)
            .await
            .map_err(|source| ExchangeError::Io {
                addr: self.addr,
                source,
            })?;
        Ok(Message::from_vec(&buf)?)
    }

    /// Sends the liveness probe (`. IN NS`, recursion-desired cleared) and
    /// updates the failure counter. Dial timeouts and empty replies count as
    /// failures; a decodable reply that still looks like a response from a
    /// live server does not.
    pub async fn check(&self) -> Result<(), ExchangeError> {
        let proto = *self.client.net.read();
        *self.last_probe.write() = Some(Utc::now());

        match self.send_probe().await {
            Ok(_) => {
                self.fails.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                if let Some(reply) = err.reply() {
                    if looks_like_reply(reply) {
                        warn!(addr = %self.addr, proto = %proto, %err,
                            "malformed response from a live upstream");
                        self.fails.store(0, Ordering::Relaxed);
                        return Ok(());
                    }
                }
                self.fails.fetch_add(1, Ordering::Relaxed);
                warn!(addr = %self.addr, proto = %proto, %err, "upstream probe failed, host dead?");
                Err(err)
            }
        }
    }

    async fn send_probe(&self) -> Result<Message, ExchangeError> {
        let ping = probe_message();
        let proto = *self.client.net.read();
        let tls = self.client.tls.read().clone();

        let mut conn = transport::connect(proto, self.addr, tls.as_ref()).await?;
        let bytes = ping.to_vec()?;
        conn.send(&bytes, self.client.timeout)
            .await
            .map_err(|source| ExchangeError::Io {
                addr: self.addr,
                source,
            })?;

        let buf = conn
            .recv(self.client.timeout, MIN_MSG_SIZE)
            .await
            .map_err(|source| ExchangeError::Io {
                addr: self.addr,
                source,
            })?;
        let reply = Message::from_vec(&buf)?;

        if reply.id() != ping.id() {
            return Err(ExchangeError::IdMismatch {
                sent: ping.id(),
                got: reply.id(),
                reply: Box::new(reply),
            });
        }
        Ok(reply)
    }

    /// Whether the host is currently unavailable for selection. Dispatches to
    /// the injected predicate when one is installed; the default marks a host
    /// down on the first observed probe failure.
    pub fn down(&self) -> bool {
        let down = match &self.down_func {
            Some(down_func) => down_func(self),
            None => self.fails.load(Ordering::Relaxed) > 0,
        };
        if down {
            debug!(addr = %self.addr, "upstream marked down");
        }
        down
    }
}

fn probe_message() -> Message {
    let mut ping = Message::new();
    ping.set_id(rand::random());
    ping.set_recursion_desired(false);
    ping.add_query(Query::query(Name::root(), RecordType::NS));
    ping
}

/// Something sane came back: the message is flagged as a response, or its
/// opcode is a normal query.
fn looks_like_reply(msg: &Message) -> bool {
    msg.message_type() == MessageType::Response || msg.op_code() == OpCode::Query
}

fn advertised_size(request: &Message) -> usize {
    request
        .extensions()
        .as_ref()
        .map(|edns| usize::from(edns.max_payload()))
        .unwrap_or(MIN_MSG_SIZE)
        .max(MIN_MSG_SIZE)
}
