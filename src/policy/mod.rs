// src/policy/mod.rs
mod random;

pub use random::{Random, Spray};

use std::sync::Arc;

use crate::config::PolicyKind;
use crate::upstream::UpstreamHost;

/// Selection strategy over the upstream pool. `select` runs synchronously on
/// the request path and must not block or touch the network; it only reads
/// already-materialized health state. External implementations are welcome.
pub trait Policy: Send + Sync {
    fn select(&self, pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>>;

    fn name(&self) -> &'static str;
}

pub fn create_policy(kind: PolicyKind) -> Box<dyn Policy> {
    match kind {
        PolicyKind::Random => Box::new(Random),
    }
}
