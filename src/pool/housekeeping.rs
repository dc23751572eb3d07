// Pool housekeeping worker.
//
// One daemon task per pool instance, shared between leak detection, the
// idle validation sweep and opt-in diagnostics logging. When leak detection
// is disabled (zero interval) and diagnostics are off, no task is spawned.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DiagnosticsConfig, LeakDetectionConfig};

use super::core::BorrowInfo;
use super::PoolStatistics;

/// The view of a pool the housekeeping worker needs.
#[async_trait]
pub trait Housekept: Send + Sync + 'static {
    fn pool_name(&self) -> String;

    fn statistics(&self) -> PoolStatistics;

    fn leaked(&self, threshold: Duration) -> Vec<(u64, BorrowInfo)>;

    async fn sweep(&self);
}

#[async_trait]
impl<F: super::PoolableFactory> Housekept for super::ObjectPool<F> {
    fn pool_name(&self) -> String {
        self.name().to_string()
    }

    fn statistics(&self) -> PoolStatistics {
        super::ObjectPool::statistics(self)
    }

    fn leaked(&self, threshold: Duration) -> Vec<(u64, BorrowInfo)> {
        super::ObjectPool::leaked(self, threshold)
    }

    async fn sweep(&self) {
        super::ObjectPool::sweep(self).await
    }
}

/// Handle on a pool's housekeeping task.
pub struct Housekeeper {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Housekeeper {
    /// Spawns the worker, or returns an inert handle when both features
    /// are off. The worker holds only a weak reference and exits when the
    /// pool is dropped.
    pub fn start(
        pool: Weak<dyn Housekept>,
        leak: LeakDetectionConfig,
        diagnostics: DiagnosticsConfig,
    ) -> Self {
        let leak_enabled = !leak.interval.is_zero();
        if !leak_enabled && !diagnostics.enabled {
            return Self {
                handle: Mutex::new(None),
            };
        }

        let handle = tokio::spawn(async move {
            let leak_period = if leak_enabled {
                leak.interval
            } else {
                // Effectively never fires; diagnostics drive the loop.
                Duration::from_secs(3600 * 24)
            };
            let mut leak_tick = tokio::time::interval(leak_period);
            leak_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut diag_tick = tokio::time::interval(if diagnostics.enabled {
                diagnostics.interval
            } else {
                Duration::from_secs(3600 * 24)
            });
            diag_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            // Both intervals fire immediately on first tick; consume those
            // so housekeeping starts one period after pool creation.
            leak_tick.tick().await;
            diag_tick.tick().await;

            loop {
                tokio::select! {
                    _ = leak_tick.tick(), if leak_enabled => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.sweep().await;
                        for (id, borrow) in pool.leaked(leak.timeout) {
                            warn!(
                                pool = %pool.pool_name(),
                                entry = id,
                                held_for = ?borrow.borrowed_at.elapsed(),
                                task = %borrow.task,
                                backtrace = borrow.backtrace.as_deref().unwrap_or("<disabled>"),
                                "possible connection leak"
                            );
                        }
                    }
                    _ = diag_tick.tick(), if diagnostics.enabled => {
                        let Some(pool) = pool.upgrade() else { break };
                        let stats = pool.statistics();
                        match serde_json::to_string(&stats) {
                            Ok(snapshot) => {
                                info!(pool = %pool.pool_name(), %snapshot, "pool diagnostics")
                            }
                            Err(e) => warn!(error = %e, "cannot serialize pool statistics"),
                        }
                    }
                }
            }
        });

        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn inert() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stops the worker immediately.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Instant;

    struct FakePool {
        sweeps: AtomicU64,
        leak_age: Duration,
    }

    #[async_trait]
    impl Housekept for FakePool {
        fn pool_name(&self) -> String {
            "fake".into()
        }

        fn statistics(&self) -> PoolStatistics {
            PoolStatistics::default()
        }

        fn leaked(&self, threshold: Duration) -> Vec<(u64, BorrowInfo)> {
            if self.leak_age > threshold {
                vec![(
                    7,
                    BorrowInfo {
                        borrowed_at: Instant::now() - self.leak_age,
                        task: "test".into(),
                        backtrace: None,
                    },
                )]
            } else {
                vec![]
            }
        }

        async fn sweep(&self) {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_disabled_spawns_nothing() {
        let pool: Arc<dyn Housekept> = Arc::new(FakePool {
            sweeps: AtomicU64::new(0),
            leak_age: Duration::ZERO,
        });
        let leak = LeakDetectionConfig {
            interval: Duration::ZERO,
            timeout: Duration::from_secs(300),
            enhanced: false,
        };
        let diag = DiagnosticsConfig {
            enabled: false,
            interval: Duration::from_secs(60),
        };
        let keeper = Housekeeper::start(Arc::downgrade(&pool), leak, diag);
        assert!(!keeper.is_running());
    }

    #[tokio::test]
    async fn test_worker_sweeps_on_interval() {
        let pool = Arc::new(FakePool {
            sweeps: AtomicU64::new(0),
            leak_age: Duration::ZERO,
        });
        let dyn_pool: Arc<dyn Housekept> = pool.clone();
        let leak = LeakDetectionConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(300),
            enhanced: false,
        };
        let diag = DiagnosticsConfig {
            enabled: false,
            interval: Duration::from_secs(60),
        };
        let keeper = Housekeeper::start(Arc::downgrade(&dyn_pool), leak, diag);
        assert!(keeper.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pool.sweeps.load(Ordering::SeqCst) >= 2);
        keeper.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!keeper.is_running());
    }

    #[tokio::test]
    async fn test_worker_exits_when_pool_dropped() {
        let pool: Arc<dyn Housekept> = Arc::new(FakePool {
            sweeps: AtomicU64::new(0),
            leak_age: Duration::ZERO,
        });
        let weak = Arc::downgrade(&pool);
        let leak = LeakDetectionConfig {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(300),
            enhanced: false,
        };
        let diag = DiagnosticsConfig {
            enabled: false,
            interval: Duration::from_secs(60),
        };
        let keeper = Housekeeper::start(weak, leak, diag);
        drop(pool);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!keeper.is_running());
    }
}
