// src/upstream/pool.rs
use std::net::SocketAddr;
use std::sync::Arc;

use super::host::UpstreamHost;
use crate::transport::Transport;

/// Ordered pool of upstream hosts. Insertion order is kept; the selection
/// cascade special-cases the single-element pool.
pub type UpstreamHostPool = Vec<Arc<UpstreamHost>>;

/// Builds the pool from resolved addresses, wiring every host to the same
/// shared transport.
pub fn build_pool(addrs: &[SocketAddr], transport: &Arc<Transport>) -> UpstreamHostPool {
    addrs
        .iter()
        .map(|addr| Arc::new(UpstreamHost::new(*addr, Arc::clone(transport))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_preserves_insertion_order_and_shares_one_transport() {
        let transport = Arc::new(Transport::new(false, false, Duration::from_secs(10)));
        let addrs: Vec<SocketAddr> = vec![
            "10.0.0.1:53".parse().unwrap(),
            "10.0.0.2:53".parse().unwrap(),
            "10.0.0.3:53".parse().unwrap(),
        ];

        let pool = build_pool(&addrs, &transport);
        assert_eq!(pool.len(), 3);
        for (host, addr) in pool.iter().zip(&addrs) {
            assert_eq!(host.addr(), *addr);
            assert!(Arc::ptr_eq(host.transport(), &transport));
        }
    }
}
