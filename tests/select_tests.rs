// tests/select_tests.rs
//
// The selection cascade, exercised through the public API. Down state is
// injected with custom down predicates so no probing is involved.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use dns_forwarder::health::HealthCheck;
use dns_forwarder::policy::{Policy, Spray};
use dns_forwarder::transport::Transport;
use dns_forwarder::upstream::{UpstreamHost, UpstreamHostPool};

fn transport() -> Arc<Transport> {
    Arc::new(Transport::new(false, false, Duration::from_secs(10)))
}

fn host(port: u16, down: bool) -> Arc<UpstreamHost> {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    Arc::new(UpstreamHost::new(addr, transport()).with_down_func(move |_| down))
}

fn health_check(pool: UpstreamHostPool) -> HealthCheck {
    HealthCheck::new(pool, Duration::ZERO, transport())
}

/// Spray wrapper that counts how often it is consulted.
struct CountingSpray {
    calls: Arc<AtomicUsize>,
}

impl Policy for CountingSpray {
    fn select(&self, pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Spray.select(pool)
    }

    fn name(&self) -> &'static str {
        "counting-spray"
    }
}

/// A primary policy that never yields a candidate.
struct NeverPolicy;

impl Policy for NeverPolicy {
    fn select(&self, _pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>> {
        None
    }

    fn name(&self) -> &'static str {
        "never"
    }
}

/// A primary policy that always picks the last host, down or not.
struct LastPolicy;

impl Policy for LastPolicy {
    fn select(&self, pool: &[Arc<UpstreamHost>]) -> Option<Arc<UpstreamHost>> {
        pool.last().map(Arc::clone)
    }

    fn name(&self) -> &'static str {
        "last"
    }
}

#[test]
fn single_host_down_without_spray_is_no_candidate() {
    let hc = health_check(vec![host(1, true)]);
    assert!(hc.select().is_none());
}

#[test]
fn single_host_down_with_spray_returns_the_host_without_asking_spray() {
    let calls = Arc::new(AtomicUsize::new(0));
    let hc = health_check(vec![host(1, true)]).with_spray(Box::new(CountingSpray {
        calls: Arc::clone(&calls),
    }));

    let picked = hc.select().expect("the single host is returned as-is");
    assert_eq!(picked.addr().port(), 1);
    assert!(picked.down());
    // Spray must not have been consulted in the single-host case.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn single_host_up_is_returned() {
    let hc = health_check(vec![host(1, false)]);
    assert_eq!(hc.select().unwrap().addr().port(), 1);
}

#[test]
fn all_down_with_spray_returns_sprays_pick() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pool = vec![host(1, true), host(2, true), host(3, true)];
    let hc = health_check(pool.clone()).with_spray(Box::new(CountingSpray {
        calls: Arc::clone(&calls),
    }));

    let picked = hc.select().expect("spray guarantees a destination");
    assert!(pool.iter().any(|h| Arc::ptr_eq(h, &picked)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn all_down_without_spray_is_no_candidate() {
    let hc = health_check(vec![host(1, true), host(2, true)]);
    assert!(hc.select().is_none());
}

#[test]
fn default_policy_picks_only_healthy_hosts() {
    let hc = health_check(vec![host(1, true), host(2, false), host(3, true)]);
    for _ in 0..32 {
        assert_eq!(hc.select().unwrap().addr().port(), 2);
    }
}

#[test]
fn custom_policy_is_honored() {
    let hc = health_check(vec![host(1, false), host(2, false), host(3, false)])
        .with_policy(Box::new(LastPolicy));
    assert_eq!(hc.select().unwrap().addr().port(), 3);
}

#[test]
fn empty_primary_pick_falls_back_to_spray() {
    let calls = Arc::new(AtomicUsize::new(0));
    let hc = health_check(vec![host(1, false), host(2, false)])
        .with_policy(Box::new(NeverPolicy))
        .with_spray(Box::new(CountingSpray {
            calls: Arc::clone(&calls),
        }));

    assert!(hc.select().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_primary_pick_without_spray_is_no_candidate() {
    let hc = health_check(vec![host(1, false), host(2, false)])
        .with_policy(Box::new(NeverPolicy));
    assert!(hc.select().is_none());
}

proptest! {
    #[test]
    fn default_policy_never_returns_a_down_host(pattern in proptest::collection::vec(any::<bool>(), 2..6)) {
        prop_assume!(pattern.iter().any(|up| *up));

        let pool: UpstreamHostPool = pattern
            .iter()
            .enumerate()
            .map(|(i, up)| host(1000 + i as u16, !up))
            .collect();
        let hc = health_check(pool);

        let picked = hc.select();
        prop_assert!(picked.is_some());
        prop_assert!(!picked.unwrap().down());
    }

    #[test]
    fn all_down_multi_host_pools_yield_no_candidate(len in 2usize..6) {
        let pool: UpstreamHostPool = (0..len).map(|i| host(1000 + i as u16, true)).collect();
        let hc = health_check(pool);
        prop_assert!(hc.select().is_none());
    }
}
