// src/server/mod.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::health::HealthCheck;
use crate::metrics::MetricsCollector;
use crate::transport::Protocol;

pub async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("failed to bind udp listener on {addr}"))
}

/// Minimal UDP front end: decode the query, `select` a destination,
/// `exchange`, write the reply back. Routing and rewriting live elsewhere.
pub struct Forwarder {
    health_check: Arc<HealthCheck>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Forwarder {
    pub fn new(health_check: Arc<HealthCheck>) -> Self {
        Self {
            health_check,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Serves until the socket errors. One spawned task per packet.
    pub async fn run(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        info!(addr = %socket.local_addr()?, "dns forwarder listening");

        loop {
            let mut buf = vec![0u8; 4096];
            let (len, peer) = socket
                .recv_from(&mut buf)
                .await
                .context("udp receive failed")?;
            buf.truncate(len);

            let forwarder = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                forwarder.handle_packet(socket, peer, buf).await;
            });
        }
    }

    async fn handle_packet(&self, socket: Arc<UdpSocket>, peer: SocketAddr, packet: Vec<u8>) {
        let request = match Message::from_vec(&packet) {
            Ok(request) => request,
            Err(err) => {
                debug!(%peer, %err, "dropping undecodable packet");
                self.record("bad_packet");
                return;
            }
        };

        let Some(host) = self.health_check.select() else {
            warn!(%peer, "no upstream candidate, answering servfail");
            self.record("no_upstream");
            self.reply_failure(&socket, peer, &request).await;
            return;
        };

        let started = Instant::now();
        match host.exchange(&request, Protocol::Udp).await {
            Ok(reply) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_exchange(
                        &host.addr().to_string(),
                        started.elapsed().as_secs_f64(),
                    );
                }
                self.record("forwarded");
                match reply.to_vec() {
                    Ok(bytes) => {
                        if let Err(err) = socket.send_to(&bytes, peer).await {
                            debug!(%peer, %err, "failed to write reply");
                        }
                    }
                    Err(err) => warn!(%peer, %err, "failed to encode upstream reply"),
                }
            }
            Err(err) => {
                warn!(%peer, upstream = %host.addr(), %err, "exchange failed");
                self.record("upstream_error");
                self.reply_failure(&socket, peer, &request).await;
            }
        }
    }

    async fn reply_failure(&self, socket: &UdpSocket, peer: SocketAddr, request: &Message) {
        let failure = Message::error_msg(request.id(), request.op_code(), ResponseCode::ServFail);
        match failure.to_vec() {
            Ok(bytes) => {
                if let Err(err) = socket.send_to(&bytes, peer).await {
                    debug!(%peer, %err, "failed to write servfail");
                }
            }
            Err(err) => warn!(%peer, %err, "failed to encode servfail"),
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_query(outcome);
        }
    }
}
