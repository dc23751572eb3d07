// Slow-query segregation.
//
// Execution slots in front of a pool are partitioned into a slow and a
// fast set so a flood of slow statements cannot starve fast ones. An
// operation is admitted into the queue for its learned class; when its own
// class has no free slot it may borrow one from the other class before it
// starts waiting. Measured latencies feed the per-operation averages that
// drive classification.

pub mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SlowQueryConfig;
use crate::error::{OjpError, Result};

pub use stats::{operation_hash, OperationStats, StatsRegistry};

/// Admission ticket for one statement execution.
///
/// Holds the slot permit for the duration of the execution; handing it to
/// [`SlowQueryScheduler::complete`] releases the slot and records the
/// sample.
#[derive(Debug)]
pub struct AdmissionTicket {
    op_hash: u64,
    class: &'static str,
    started: Instant,
    _permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionTicket {
    pub fn class(&self) -> &'static str {
        self.class
    }
}

/// Per-pool admission controller.
pub struct SlowQueryScheduler {
    config: SlowQueryConfig,
    stats: Arc<StatsRegistry>,
    fast: Arc<Semaphore>,
    slow: Arc<Semaphore>,
    averager: Mutex<Option<JoinHandle<()>>>,
}

impl SlowQueryScheduler {
    /// Builds a scheduler partitioning `total_slots` and, when enabled,
    /// spawns the global averager task.
    pub fn new(total_slots: usize, config: SlowQueryConfig) -> Arc<Self> {
        let total_slots = total_slots.max(1);
        let slow_slots = if config.enabled {
            ((total_slots as u64 * config.slow_slot_percentage as u64) / 100).max(1) as usize
        } else {
            1
        };
        let fast_slots = (total_slots - slow_slots.min(total_slots)).max(1);

        let stats = Arc::new(StatsRegistry::new());
        let scheduler = Arc::new(Self {
            config: config.clone(),
            stats: Arc::clone(&stats),
            fast: Arc::new(Semaphore::new(fast_slots)),
            slow: Arc::new(Semaphore::new(slow_slots)),
            averager: Mutex::new(None),
        });

        if config.enabled {
            let weak_stats = Arc::downgrade(&stats);
            let interval = config.update_global_avg_interval;
            let idle_timeout = config.idle_timeout;
            let handle = tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    let Some(stats) = weak_stats.upgrade() else { break };
                    stats.refresh_overall(idle_timeout);
                }
            });
            *scheduler.averager.lock() = Some(handle);
        }
        scheduler
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    /// Admits one operation, blocking up to the class slot timeout.
    pub async fn admit(&self, op_hash: u64) -> Result<AdmissionTicket> {
        if !self.config.enabled {
            return Ok(AdmissionTicket {
                op_hash,
                class: "unsegregated",
                started: Instant::now(),
                _permit: None,
            });
        }

        let slow = self.stats.is_slow(op_hash);
        let (preferred, other, class, timeout) = if slow {
            (&self.slow, &self.fast, "slow", self.config.slow_slot_timeout)
        } else {
            (&self.fast, &self.slow, "fast", self.config.fast_slot_timeout)
        };

        // Free slot in our own class, else borrow from the other class,
        // else queue on our own class until the slot timeout.
        let permit = match Arc::clone(preferred).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match Arc::clone(other).try_acquire_owned() {
                Ok(permit) => {
                    debug!(class, "borrowed slot from other class");
                    permit
                }
                Err(_) => {
                    match tokio::time::timeout(timeout, Arc::clone(preferred).acquire_owned())
                        .await
                    {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) | Err(_) => {
                            return Err(OjpError::SlotTimeout {
                                class,
                                waited: timeout,
                            })
                        }
                    }
                }
            },
        };

        Ok(AdmissionTicket {
            op_hash,
            class,
            started: Instant::now(),
            _permit: Some(permit),
        })
    }

    /// Releases the slot and feeds the measured latency back into the
    /// per-operation average.
    pub fn complete(&self, ticket: AdmissionTicket) {
        self.stats.record(ticket.op_hash, ticket.started.elapsed());
        // Permit drops with the ticket.
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.averager.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SlowQueryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(slow_pct: u32, fast_timeout_ms: u64, slow_timeout_ms: u64) -> SlowQueryConfig {
        SlowQueryConfig {
            enabled: true,
            slow_slot_percentage: slow_pct,
            idle_timeout: Duration::from_secs(600),
            slow_slot_timeout: Duration::from_millis(slow_timeout_ms),
            fast_slot_timeout: Duration::from_millis(fast_timeout_ms),
            update_global_avg_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_admission_records_on_complete() {
        let scheduler = SlowQueryScheduler::new(10, config(20, 100, 100));
        let op = operation_hash("SELECT 1");

        let ticket = scheduler.admit(op).await.unwrap();
        assert_eq!(ticket.class(), "fast");
        scheduler.complete(ticket);
        assert!(scheduler.stats().average_nanos(op).is_some());
    }

    #[tokio::test]
    async fn test_fast_flood_times_out_without_starving_forever() {
        // 4 slots total: 1 slow + 3 fast.
        let scheduler = SlowQueryScheduler::new(4, config(25, 20, 20));
        let op = operation_hash("op");

        // Take all four slots (3 fast + 1 borrowed slow).
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(scheduler.admit(op).await.unwrap());
        }
        let err = scheduler.admit(op).await.unwrap_err();
        assert!(matches!(err, OjpError::SlotTimeout { class: "fast", .. }));

        // Releasing one frees admission again.
        scheduler.complete(held.pop().unwrap());
        let ticket = scheduler.admit(op).await.unwrap();
        scheduler.complete(ticket);
    }

    #[tokio::test]
    async fn test_slow_operation_borrows_fast_slot() {
        let scheduler = SlowQueryScheduler::new(4, config(25, 20, 20));

        // Teach the scheduler that `slow_op` is slow.
        let slow_op = operation_hash("slow");
        let fast_op = operation_hash("fast");
        for _ in 0..3 {
            scheduler
                .stats()
                .record(slow_op, Duration::from_millis(400));
            scheduler.stats().record(fast_op, Duration::from_millis(2));
        }
        scheduler.stats().refresh_overall(Duration::from_secs(600));
        assert!(scheduler.stats().is_slow(slow_op));

        // Occupy the single slow slot; the next slow admission borrows
        // from the fast set instead of timing out.
        let first = scheduler.admit(slow_op).await.unwrap();
        assert_eq!(first.class(), "slow");
        let second = scheduler.admit(slow_op).await.unwrap();
        assert_eq!(second.class(), "slow");
        scheduler.complete(first);
        scheduler.complete(second);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_admits_everything() {
        let mut cfg = config(20, 1, 1);
        cfg.enabled = false;
        let scheduler = SlowQueryScheduler::new(1, cfg);

        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(scheduler.admit(operation_hash("op")).await.unwrap());
        }
        assert!(held.iter().all(|t| t.class() == "unsegregated"));
    }
}
