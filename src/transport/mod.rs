// src/transport/mod.rs
mod conn;

pub use conn::{connect, Conn, DialError, DIAL_TIMEOUT, MIN_MSG_SIZE};

use anyhow::Context;
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Wire protocol used to reach an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tcp-tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side TLS material for DNS-over-TLS dialing.
#[derive(Clone)]
pub struct TlsClientConfig {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl TlsClientConfig {
    /// Builds a verifier from the webpki root set, or from a CA bundle file
    /// when one is configured.
    pub fn new(server_name: &str, ca_file: Option<&Path>) -> anyhow::Result<Self> {
        let roots = match ca_file {
            Some(path) => {
                let pem = std::fs::read(path)
                    .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
                let certs = rustls_pemfile::certs(&mut pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("failed to parse CA bundle {}", path.display()))?;
                let mut roots = rustls::RootCertStore::empty();
                let (added, _) = roots.add_parsable_certificates(certs);
                anyhow::ensure!(added > 0, "no usable certificates in {}", path.display());
                roots
            }
            None => rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ),
        };

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string())
            .with_context(|| format!("invalid tls server name {server_name}"))?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }
}

impl fmt::Debug for TlsClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Connection-negotiation defaults shared by every upstream host of one
/// health-check instance. Held behind a single `Arc`, so a TLS config
/// installed through one host changes dialing for all of them.
pub struct Transport {
    force_tcp: bool, // force_tcp takes precedence over prefer_udp
    prefer_udp: bool,
    expire: Duration, // idle-connection expiry; no connection cache exists yet, only carried
    tls: RwLock<Option<TlsClientConfig>>,
}

impl Transport {
    pub fn new(force_tcp: bool, prefer_udp: bool, expire: Duration) -> Self {
        Self {
            force_tcp,
            prefer_udp,
            expire,
            tls: RwLock::new(None),
        }
    }

    /// Resolves the protocol to dial with. Precedence is strict:
    /// TLS configured > forced TCP > preferred UDP > caller default.
    pub fn effective_proto(&self, default: Protocol) -> Protocol {
        if self.tls.read().is_some() {
            Protocol::Tls
        } else if self.force_tcp {
            Protocol::Tcp
        } else if self.prefer_udp {
            Protocol::Udp
        } else {
            default
        }
    }

    pub fn tls(&self) -> Option<TlsClientConfig> {
        self.tls.read().clone()
    }

    pub fn set_tls(&self, config: TlsClientConfig) {
        *self.tls.write() = Some(config);
    }

    pub fn expire(&self) -> Duration {
        self.expire
    }
}
