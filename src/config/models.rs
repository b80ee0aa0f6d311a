// src/config/models.rs
use anyhow::{bail, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Upstream resolvers, in order. Order matters only for the
    /// single-upstream selection special case.
    pub upstreams: Vec<SocketAddr>,

    /// Primary selection policy; absent means the built-in random default.
    #[serde(default)]
    pub policy: Option<PolicyKind>,

    /// Enable the health-agnostic last-resort fallback.
    #[serde(default)]
    pub spray: bool,

    /// Carried for custom down predicates; the default predicate marks a
    /// host down on the first failure regardless.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Probe interval in milliseconds; 0 disables probing entirely.
    #[serde(default = "default_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub force_tcp: bool,

    #[serde(default)]
    pub prefer_udp: bool,

    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,

    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            force_tcp: false,
            prefer_udp: false,
            expire_secs: default_expire_secs(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub server_name: String,

    /// Optional CA bundle overriding the built-in webpki roots.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            bail!("at least one upstream is required");
        }
        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            bail!("metrics path must start with '/'");
        }
        if let Some(tls) = &self.transport.tls {
            if tls.server_name.is_empty() {
                bail!("tls server_name must not be empty");
            }
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl TransportConfig {
    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:1053".parse().expect("static default")
}

fn default_max_fails() -> u32 {
    3
}

fn default_check_interval_ms() -> u64 {
    5_000
}

fn default_expire_secs() -> u64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
