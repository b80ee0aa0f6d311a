// src/metrics/collector.rs
use std::sync::Arc;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::upstream::UpstreamHost;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(%err, "failed to encode metrics");
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Pool health
    pub healthy_upstreams: IntGauge,
    pub total_upstreams: IntGauge,
    pub upstream_up: IntGaugeVec,
    pub upstream_fails: IntGaugeVec,
    pub probe_cycles_total: IntCounter,

    // Forwarding path
    pub queries_total: IntCounterVec,
    pub exchange_duration_seconds: HistogramVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let healthy_upstreams = IntGauge::new(
            "dnsf_healthy_upstreams",
            "Upstreams currently considered healthy",
        )?;
        registry.register(Box::new(healthy_upstreams.clone()))?;

        let total_upstreams = IntGauge::new("dnsf_total_upstreams", "Configured upstreams")?;
        registry.register(Box::new(total_upstreams.clone()))?;

        let upstream_up = IntGaugeVec::new(
            Opts::new("dnsf_upstream_up", "Per-upstream health (1=up, 0=down)"),
            &["upstream"],
        )?;
        registry.register(Box::new(upstream_up.clone()))?;

        let upstream_fails = IntGaugeVec::new(
            Opts::new(
                "dnsf_upstream_fails",
                "Probe failures since the last successful probe",
            ),
            &["upstream"],
        )?;
        registry.register(Box::new(upstream_fails.clone()))?;

        let probe_cycles_total =
            IntCounter::new("dnsf_probe_cycles_total", "Probe cycles dispatched")?;
        registry.register(Box::new(probe_cycles_total.clone()))?;

        let queries_total = IntCounterVec::new(
            Opts::new("dnsf_queries_total", "Forwarded queries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(queries_total.clone()))?;

        let exchange_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dnsf_exchange_duration_seconds",
                "Upstream exchange duration in seconds",
            ),
            &["upstream"],
        )?;
        registry.register(Box::new(exchange_duration_seconds.clone()))?;

        Ok(Self {
            healthy_upstreams,
            total_upstreams,
            upstream_up,
            upstream_fails,
            probe_cycles_total,
            queries_total,
            exchange_duration_seconds,
        })
    }

    /// Snapshot of the pool's cached health state, taken once per probe
    /// cycle.
    pub fn observe_pool(&self, hosts: &[Arc<UpstreamHost>]) {
        self.probe_cycles_total.inc();

        let mut healthy = 0i64;
        for host in hosts {
            let addr = host.addr().to_string();
            let up = !host.down();
            if up {
                healthy += 1;
            }
            self.upstream_up.with_label_values(&[&addr]).set(up as i64);
            self.upstream_fails
                .with_label_values(&[&addr])
                .set(i64::from(host.fails()));
        }
        self.healthy_upstreams.set(healthy);
        self.total_upstreams.set(hosts.len() as i64);
    }

    pub fn record_query(&self, outcome: &str) {
        self.queries_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_exchange(&self, upstream: &str, seconds: f64) {
        self.exchange_duration_seconds
            .with_label_values(&[upstream])
            .observe(seconds);
    }
}
