// src/policy/random.rs
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::warn;

use super::Policy;
use crate::upstream::UpstreamHost;

/// Default policy: a uniformly random pick among the hosts that are not
/// currently down.
pub struct Random;

impl Policy for Random {
    fn select(&self, pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>> {
        let candidates: Vec<&Arc<UpstreamHost>> =
            pool.iter().filter(|host| !host.down()).collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|host| Arc::clone(*host))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Last-resort policy: picks uniformly over the full pool, down hosts
/// included. Trades correctness (the pick may be unreachable) for having a
/// destination at all during a total outage.
pub struct Spray;

impl Policy for Spray {
    fn select(&self, pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>> {
        let pick = pool.choose(&mut rand::thread_rng()).map(Arc::clone);
        if let Some(host) = &pick {
            warn!(addr = %host.addr(), "no healthy upstream, spraying across the full pool");
        }
        pick
    }

    fn name(&self) -> &'static str {
        "spray"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn host(port: u16, down: bool) -> Arc<UpstreamHost> {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let transport = Arc::new(Transport::new(false, false, Duration::from_secs(10)));
        Arc::new(UpstreamHost::new(addr, transport).with_down_func(move |_| down))
    }

    #[test]
    fn random_skips_down_hosts() {
        let pool = vec![host(1, true), host(2, false), host(3, true)];
        for _ in 0..32 {
            let picked = Random.select(&pool).expect("one host is up");
            assert_eq!(picked.addr().port(), 2);
        }
    }

    #[test]
    fn random_yields_nothing_when_everything_is_down() {
        let pool = vec![host(1, true), host(2, true)];
        assert!(Random.select(&pool).is_none());
    }

    #[test]
    fn random_on_empty_pool_is_none() {
        assert!(Random.select(&[]).is_none());
    }

    #[test]
    fn spray_ignores_down_state() {
        let pool = vec![host(1, true), host(2, true)];
        let picked = Spray.select(&pool).expect("spray always finds a host");
        assert!(pool.iter().any(|h| Arc::ptr_eq(h, &picked)));
    }

    #[test]
    fn spray_on_empty_pool_is_none() {
        assert!(Spray.select(&[]).is_none());
    }
}
