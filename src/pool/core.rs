// Generic object pool.
//
// Both provider families are built on this core: a bounded pool of shared
// entries with validation on borrow, reset on return, passive max-lifetime
// recycling, eager min-idle maintenance and runtime resizing. Entries are
// `Arc`-shared because borrowers (sessions, the transaction registry) hold
// them across many calls rather than inside one scope.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{OjpError, Result};

use super::{PoolSettings, PoolStatistics};

/// How a pool creates, checks and disposes of its resources.
#[async_trait]
pub trait PoolableFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Resource>;

    /// Liveness check on borrow and during idle sweeps.
    async fn validate(&self, resource: &Self::Resource) -> bool;

    /// State reset before the resource re-enters the idle set. An error
    /// destroys the resource instead of reusing it.
    async fn passivate(&self, resource: &Self::Resource) -> Result<()>;

    async fn destroy(&self, resource: &Self::Resource);

    /// Pinned resources are exempt from recycling, eviction and reset.
    fn is_pinned(&self, _resource: &Self::Resource) -> bool {
        false
    }
}

/// Per-borrow tracking record for leak detection.
#[derive(Debug, Clone)]
pub struct BorrowInfo {
    pub borrowed_at: Instant,
    pub task: String,
    /// Captured only in enhanced mode.
    pub backtrace: Option<String>,
}

/// One pooled resource plus its lifecycle metadata.
#[derive(Debug)]
pub struct PoolEntry<T> {
    id: u64,
    resource: T,
    created_at: Instant,
    last_return: Mutex<Instant>,
}

impl<T> PoolEntry<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_return.lock().elapsed()
    }
}

struct PoolInner<T> {
    idle: VecDeque<Arc<PoolEntry<T>>>,
    total: usize,
    max_size: usize,
    min_idle: usize,
}

/// Bounded pool of `Arc<PoolEntry<F::Resource>>`.
pub struct ObjectPool<F: PoolableFactory> {
    name: String,
    factory: F,
    settings: PoolSettings,
    inner: Mutex<PoolInner<F::Resource>>,
    capacity: Semaphore,
    /// Permits owed back to the semaphore after a shrink caught resources
    /// mid-borrow.
    permit_debt: Mutex<usize>,
    borrowed: DashMap<u64, (Arc<PoolEntry<F::Resource>>, BorrowInfo)>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    enhanced_leak_tracking: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    borrows: AtomicU64,
    returns: AtomicU64,
}

impl<F: PoolableFactory> ObjectPool<F> {
    pub fn new(name: impl Into<String>, factory: F, settings: PoolSettings) -> Self {
        let max = settings.max_pool_size;
        Self {
            name: name.into(),
            factory,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                total: 0,
                max_size: max,
                min_idle: settings.min_idle,
            }),
            capacity: Semaphore::new(max),
            permit_debt: Mutex::new(0),
            borrowed: DashMap::new(),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            enhanced_leak_tracking: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            borrows: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn set_enhanced_leak_tracking(&self, enabled: bool) {
        self.enhanced_leak_tracking.store(enabled, Ordering::SeqCst);
    }

    /// Borrows an entry, blocking up to the configured connection timeout.
    pub async fn borrow(&self) -> Result<Arc<PoolEntry<F::Resource>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OjpError::Unavailable(format!("pool {} is closed", self.name)));
        }

        let timeout = self.settings.connection_timeout;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::time::timeout(timeout, self.capacity.acquire()).await;
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) | Err(_) => {
                let stats = self.statistics();
                return Err(OjpError::PoolExhausted {
                    waited: timeout,
                    active: stats.active,
                    max: stats.max,
                });
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            self.release_permit();
            return Err(OjpError::Unavailable(format!("pool {} is closed", self.name)));
        }

        let mut create_retried = false;
        loop {
            let candidate = self.inner.lock().idle.pop_front();
            match candidate {
                Some(entry) => {
                    if self.expired(&entry) || !self.factory.validate(entry.resource()).await {
                        self.destroy_entry(&entry).await;
                        continue;
                    }
                    return Ok(self.hand_out(entry));
                }
                None => match self.factory.create().await {
                    Ok(resource) => {
                        let entry = self.wrap(resource);
                        self.created.fetch_add(1, Ordering::SeqCst);
                        self.inner.lock().total += 1;
                        return Ok(self.hand_out(entry));
                    }
                    Err(e) if e.is_transient() && !create_retried => {
                        debug!(pool = %self.name, error = %e, "transient create failure, retrying once");
                        create_retried = true;
                    }
                    Err(e) => {
                        self.release_permit();
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Returns an entry to the idle set after passivation.
    ///
    /// A pinned entry is left exactly as it is: still borrowed, not reset.
    pub async fn give_back(&self, entry: Arc<PoolEntry<F::Resource>>) {
        if self.factory.is_pinned(entry.resource()) {
            warn!(pool = %self.name, entry = entry.id(), "refusing to passivate pinned entry");
            return;
        }

        self.borrowed.remove(&entry.id());
        self.returns.fetch_add(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) {
            self.destroy_entry(&entry).await;
            self.release_permit();
            return;
        }

        match self.factory.passivate(entry.resource()).await {
            Ok(()) => {
                *entry.last_return.lock() = Instant::now();
                self.inner.lock().idle.push_back(entry);
            }
            Err(e) => {
                warn!(pool = %self.name, entry = entry.id(), error = %e, "reset failed, destroying entry");
                self.destroy_entry(&entry).await;
            }
        }
        self.release_permit();
    }

    /// Destroys an entry unconditionally; the pool may create a fresh one
    /// on the next borrow.
    pub async fn invalidate(&self, entry: Arc<PoolEntry<F::Resource>>) {
        self.borrowed.remove(&entry.id());
        self.destroy_entry(&entry).await;
        self.release_permit();
    }

    /// Idle sweep: drops expired and invalid entries, then restores
    /// min-idle. Called by the housekeeping worker.
    pub async fn sweep(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let sweep_candidates: Vec<Arc<PoolEntry<F::Resource>>> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.idle).into()
        };

        for entry in sweep_candidates {
            if self.factory.is_pinned(entry.resource()) {
                self.inner.lock().idle.push_back(entry);
                continue;
            }
            let idle_expired = entry.idle_for() > self.settings.idle_timeout;
            if idle_expired || self.expired(&entry) || !self.factory.validate(entry.resource()).await
            {
                self.destroy_entry(&entry).await;
            } else {
                self.inner.lock().idle.push_back(entry);
            }
        }

        if let Err(e) = self.ensure_min_idle().await {
            warn!(pool = %self.name, error = %e, "min-idle maintenance failed");
        }
    }

    /// Changes the pool bounds at runtime.
    ///
    /// Raising `min_idle` eagerly pre-creates the missing idle entries; if
    /// they cannot be created the resize fails loudly.
    pub async fn resize(&self, max_size: usize, min_idle: usize) -> Result<()> {
        if max_size == 0 || min_idle > max_size {
            return Err(OjpError::PoolResizeFailed(format!(
                "invalid bounds: max={max_size} min_idle={min_idle}"
            )));
        }

        let old_max = {
            let mut inner = self.inner.lock();
            let old = inner.max_size;
            inner.max_size = max_size;
            inner.min_idle = min_idle;
            old
        };

        if max_size > old_max {
            let mut grow = max_size - old_max;
            let mut debt = self.permit_debt.lock();
            let pay = grow.min(*debt);
            *debt -= pay;
            grow -= pay;
            drop(debt);
            if grow > 0 {
                self.capacity.add_permits(grow);
            }
        } else if max_size < old_max {
            let shrink = old_max - max_size;
            let forgotten = self.capacity.forget_permits(shrink);
            *self.permit_debt.lock() += shrink - forgotten;
        }

        self.ensure_min_idle().await
    }

    /// Pre-creates idle entries until `min_idle` is satisfied or capacity
    /// is reached.
    pub async fn ensure_min_idle(&self) -> Result<()> {
        loop {
            let need = {
                let inner = self.inner.lock();
                inner.idle.len() < inner.min_idle && inner.total < inner.max_size
            };
            if !need {
                return Ok(());
            }
            match self.factory.create().await {
                Ok(resource) => {
                    let entry = self.wrap(resource);
                    self.created.fetch_add(1, Ordering::SeqCst);
                    let mut inner = self.inner.lock();
                    inner.total += 1;
                    inner.idle.push_back(entry);
                }
                Err(e) => {
                    return Err(OjpError::PoolResizeFailed(format!(
                        "pool {}: cannot pre-create idle entry: {e}",
                        self.name
                    )));
                }
            }
        }
    }

    /// Borrowed entries held longer than `threshold`.
    pub fn leaked(&self, threshold: Duration) -> Vec<(u64, BorrowInfo)> {
        self.borrowed
            .iter()
            .filter(|r| r.value().1.borrowed_at.elapsed() > threshold)
            .map(|r| (*r.key(), r.value().1.clone()))
            .collect()
    }

    pub fn statistics(&self) -> PoolStatistics {
        let (idle, max) = {
            let inner = self.inner.lock();
            (inner.idle.len(), inner.max_size)
        };
        PoolStatistics {
            active: self.borrowed.len(),
            idle,
            waiters: self.waiters.load(Ordering::SeqCst),
            max,
            created: self.created.load(Ordering::SeqCst),
            destroyed: self.destroyed.load(Ordering::SeqCst),
            borrowed: self.borrows.load(Ordering::SeqCst),
            returned: self.returns.load(Ordering::SeqCst),
        }
    }

    /// Closes the pool: destroys every idle and borrowed entry. Borrowers
    /// still holding an entry see it closed underneath them.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let idle: Vec<Arc<PoolEntry<F::Resource>>> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.idle).into()
        };
        for entry in idle {
            self.destroy_entry(&entry).await;
        }

        let borrowed: Vec<Arc<PoolEntry<F::Resource>>> = self
            .borrowed
            .iter()
            .map(|r| Arc::clone(&r.value().0))
            .collect();
        self.borrowed.clear();
        for entry in borrowed {
            self.destroy_entry(&entry).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn expired(&self, entry: &PoolEntry<F::Resource>) -> bool {
        entry.age() > self.settings.max_lifetime
            && entry.idle_for() > self.settings.idle_before_recycle
            && !self.factory.is_pinned(entry.resource())
    }

    fn wrap(&self, resource: F::Resource) -> Arc<PoolEntry<F::Resource>> {
        let now = Instant::now();
        Arc::new(PoolEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            resource,
            created_at: now,
            last_return: Mutex::new(now),
        })
    }

    fn hand_out(&self, entry: Arc<PoolEntry<F::Resource>>) -> Arc<PoolEntry<F::Resource>> {
        let info = BorrowInfo {
            borrowed_at: Instant::now(),
            task: current_task_label(),
            backtrace: if self.enhanced_leak_tracking.load(Ordering::SeqCst) {
                Some(std::backtrace::Backtrace::force_capture().to_string())
            } else {
                None
            },
        };
        self.borrows.fetch_add(1, Ordering::SeqCst);
        self.borrowed.insert(entry.id(), (Arc::clone(&entry), info));
        entry
    }

    /// Destroys without adjusting borrow permits (callers release permits
    /// only for borrowed-side destruction).
    async fn destroy_entry(&self, entry: &Arc<PoolEntry<F::Resource>>) {
        self.factory.destroy(entry.resource()).await;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.total = inner.total.saturating_sub(1);
    }

    fn release_permit(&self) {
        let mut debt = self.permit_debt.lock();
        if *debt > 0 {
            *debt -= 1;
        } else {
            self.capacity.add_permits(1);
        }
    }
}

fn current_task_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}
