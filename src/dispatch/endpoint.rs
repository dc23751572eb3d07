// Per-endpoint health and load tracking.
//
// Health fields are atomics: the selection path, the prober and in-flight
// calls all update them without coordination.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;

use super::url::EndpointAddr;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// One proxy server as the dispatcher sees it.
pub struct Endpoint {
    addr: EndpointAddr,
    healthy: AtomicBool,
    /// Millis since process start; 0 = never failed.
    last_failure: AtomicU64,
    active_conns: AtomicUsize,
    target_pool_size: AtomicUsize,
}

impl Endpoint {
    pub fn new(addr: EndpointAddr) -> Self {
        Self {
            addr,
            healthy: AtomicBool::new(false),
            last_failure: AtomicU64::new(0),
            active_conns: AtomicUsize::new(0),
            target_pool_size: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.last_failure.store(now_millis(), Ordering::SeqCst);
    }

    /// Time since the most recent failure, None if it never failed.
    pub fn since_last_failure(&self) -> Option<Duration> {
        match self.last_failure.load(Ordering::SeqCst) {
            0 => None,
            at => Some(Duration::from_millis(now_millis().saturating_sub(at))),
        }
    }

    pub fn active_conns(&self) -> usize {
        self.active_conns.load(Ordering::SeqCst)
    }

    pub fn conn_opened(&self) {
        self.active_conns.fetch_add(1, Ordering::SeqCst);
    }

    pub fn conn_closed(&self) {
        let _ = self
            .active_conns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn target_pool_size(&self) -> usize {
        self.target_pool_size.load(Ordering::SeqCst)
    }

    pub fn set_target_pool_size(&self, size: usize) {
        self.target_pool_size.store(size, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            addr: self.addr.to_string(),
            healthy: self.is_healthy(),
            active_conns: self.active_conns(),
            target_pool_size: self.target_pool_size(),
            last_failure_age_ms: self.since_last_failure().map(|d| d.as_millis() as u64),
        }
    }
}

/// Point-in-time endpoint view for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub addr: String,
    pub healthy: bool,
    pub active_conns: usize,
    pub target_pool_size: usize,
    pub last_failure_age_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let endpoint = Endpoint::new(EndpointAddr::new("a", 1059));
        assert!(!endpoint.is_healthy());
        assert!(endpoint.since_last_failure().is_none());

        endpoint.mark_healthy();
        assert!(endpoint.is_healthy());

        endpoint.mark_unhealthy();
        assert!(!endpoint.is_healthy());
        assert!(endpoint.since_last_failure().is_some());
    }

    #[test]
    fn test_conn_counter_never_underflows() {
        let endpoint = Endpoint::new(EndpointAddr::new("a", 1059));
        endpoint.conn_closed();
        assert_eq!(endpoint.active_conns(), 0);

        endpoint.conn_opened();
        endpoint.conn_opened();
        endpoint.conn_closed();
        assert_eq!(endpoint.active_conns(), 1);
    }
}
