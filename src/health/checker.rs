// src/health/checker.rs
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::MetricsCollector;
use crate::policy::{Policy, Random};
use crate::transport::Transport;
use crate::upstream::{UpstreamHost, UpstreamHostPool};

/// Owns the upstream pool and the background prober, and answers the
/// per-request `select` call. Lifecycle: stopped → running → stopped.
pub struct HealthCheck {
    hosts: UpstreamHostPool,
    policy: Option<Box<dyn Policy>>,
    spray: Option<Box<dyn Policy>>,
    max_fails: u32,
    check_interval: Duration,
    transport: Arc<Transport>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthCheck {
    pub fn new(
        hosts: UpstreamHostPool,
        check_interval: Duration,
        transport: Arc<Transport>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            hosts,
            policy: None,
            spray: None,
            max_fails: 0,
            check_interval,
            transport,
            metrics: None,
            shutdown_tx,
            shutdown_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_spray(mut self, spray: Box<dyn Policy>) -> Self {
        self.spray = Some(spray);
        self
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn hosts(&self) -> &UpstreamHostPool {
        &self.hosts
    }

    /// Configured fail ceiling. Available to custom down predicates; the
    /// default predicate marks a host down on the first failure and does not
    /// consult this.
    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Arms the stop signal, then spawns the single probe worker when
    /// probing is enabled. Restarting an already running instance is the
    /// caller's responsibility to avoid.
    pub fn start(&self) {
        self.shutdown_tx.send_replace(false);
        if self.check_interval.is_zero() {
            return;
        }

        let hosts = self.hosts.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.check_interval;

        let handle = tokio::spawn(async move {
            info!(?interval, "health check worker started");
            // The first tick completes immediately, so the initial probe
            // cycle runs with no delay.
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => probe_cycle(&hosts, metrics.as_ref()),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("health check worker stopped");
                            return;
                        }
                    }
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    /// Signals shutdown and waits for the worker to exit. Also fine when no
    /// worker was ever spawned (interval of zero): returns immediately.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Picks a destination for one request. Synchronous: reads cached health
    /// state only, never the network. `None` is the "no candidate" outcome
    /// the caller must handle.
    pub fn select(&self) -> Option<Arc<UpstreamHost>> {
        let pool = &self.hosts;

        if pool.len() == 1 {
            // Spray is not consulted here even when configured; the single
            // host is returned as-is unless it is down with no spray at all.
            if pool[0].down() && self.spray.is_none() {
                return None;
            }
            return Some(Arc::clone(&pool[0]));
        }

        if pool.iter().all(|host| host.down()) {
            return self.spray.as_ref()?.select(pool);
        }

        let picked = match &self.policy {
            Some(policy) => policy.select(pool),
            None => Random.select(pool),
        };
        if picked.is_some() {
            return picked;
        }
        self.spray.as_ref()?.select(pool)
    }
}

/// Dispatches one fire-and-forget probe per host. Never waits for probe
/// completion: a straggler must not delay the next tick, and in-flight
/// probes may outlive `stop` (bounded by the per-probe timeouts).
fn probe_cycle(hosts: &UpstreamHostPool, metrics: Option<&Arc<MetricsCollector>>) {
    for host in hosts {
        let host = Arc::clone(host);
        tokio::spawn(async move {
            let _ = host.check().await;
        });
    }

    if let Some(metrics) = metrics {
        metrics.observe_pool(hosts);
    }
}
