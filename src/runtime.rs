//! Per-process bus runtime.
//!
//! A [`BusRuntime`] is created once per process and owns everything the
//! process contributes to the shared store: its identity, the session epoch,
//! the pending outbound queue, the subscriber registry and the flush worker.
//! [`Bus`] and [`Cache`](crate::Cache) instances hold a handle to it.
//!
//! # Flush cycle
//!
//! ```text
//! trigger ──► slot (debounce) ──► flush()
//!                                   │ busy guard
//!                                   │ ensure store exists
//!                                   │ probe + try_acquire lock ── held ──► Locked (skip)
//!                                   │ read ─► reconcile ─► write if changed
//!                                   │ release lock
//!                                   └─► deliver new notifications to subscribers
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use log::{debug, error, warn};

use crate::bus::{Bus, Notification};
use crate::cache::CacheSnapshot;
use crate::clock::{duration_ms, Clock, SystemClock};
use crate::config::BusConfig;
use crate::identity::ProcessId;
use crate::merge::{reconcile, MergeContext};
use crate::scheduler::{FlushScheduler, SchedulerConfig};
use crate::store::{Record, SharedStore};
use crate::store_lock::{FlockLock, StoreLock};
use crate::watcher::StoreWatcher;
use crate::{Error, Result};

pub type SubscriberId = u64;

pub(crate) type Listener = Arc<dyn Fn(&Notification) + Send + Sync + 'static>;

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another process holds the store lock; nothing was done.
    Locked,
    /// The store already had the merged content.
    Unchanged,
    /// The merged content was written back.
    Written,
}

struct RuntimeShared {
    config: BusConfig,
    identity: ProcessId,
    clock: Arc<dyn Clock>,
    store: SharedStore,
    // Doubles as the busy flag: whoever holds it is running a cycle.
    lock: Mutex<Box<dyn StoreLock>>,
    epoch: AtomicU64,
    pending: Mutex<Vec<Record>>,
    registry: Mutex<BTreeMap<SubscriberId, Listener>>,
    next_subscriber: AtomicU64,
    scheduler: OnceLock<FlushScheduler>,
    watcher: OnceLock<StoreWatcher>,
    turns: DeliveryTurns,
    cache_entries: OnceLock<Arc<Mutex<CacheSnapshot>>>,
}

thread_local! {
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

/// Hands out delivery turns in cycle order so that batches from concurrent
/// cycles reach subscribers in the order the cycles ran.
#[derive(Default)]
struct DeliveryTurns {
    issued: AtomicU64,
    serving: Mutex<u64>,
    advanced: Condvar,
}

impl DeliveryTurns {
    /// Must be called while the cycle lock is still held.
    fn take(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::AcqRel)
    }

    fn wait_for(&self, ticket: u64) {
        let Ok(mut serving) = self.serving.lock() else {
            return;
        };
        while *serving < ticket {
            serving = match self.advanced.wait(serving) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    fn finish(&self, ticket: u64) {
        if let Ok(mut serving) = self.serving.lock() {
            *serving = ticket + 1;
        }
        self.advanced.notify_all();
    }
}

#[derive(Clone)]
pub struct BusRuntime {
    shared: Arc<RuntimeShared>,
}

impl BusRuntime {
    /// Opens the runtime for this process with its discovered identity and the
    /// system clock.
    pub fn open(config: BusConfig) -> Result<Self> {
        let identity = ProcessId::discover(config.role)?;
        Self::with_clock(config, identity, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BusConfig, identity: ProcessId, clock: Arc<dyn Clock>) -> Result<Self> {
        let lock = Box::new(FlockLock::for_store(&config.path));
        Self::with_lock(config, identity, clock, lock)
    }

    /// Fully explicit constructor; `lock` replaces the default `flock` lock.
    pub fn with_lock(
        config: BusConfig,
        identity: ProcessId,
        clock: Arc<dyn Clock>,
        lock: Box<dyn StoreLock>,
    ) -> Result<Self> {
        let store = SharedStore::new(config.path.clone(), config.fold_width);
        store.ensure_exists()?;
        let epoch = clock.now_ms();
        let shared = Arc::new(RuntimeShared {
            config,
            identity,
            clock,
            store,
            lock: Mutex::new(lock),
            epoch: AtomicU64::new(epoch),
            pending: Mutex::new(Vec::new()),
            registry: Mutex::new(BTreeMap::new()),
            next_subscriber: AtomicU64::new(1),
            scheduler: OnceLock::new(),
            watcher: OnceLock::new(),
            turns: DeliveryTurns::default(),
            cache_entries: OnceLock::new(),
        });
        let runtime = Self { shared };
        runtime.start_background()?;
        Ok(runtime)
    }

    fn start_background(&self) -> Result<()> {
        let config = &self.shared.config;
        if !config.background_flush {
            return Ok(());
        }
        let weak: Weak<RuntimeShared> = Arc::downgrade(&self.shared);
        let scheduler = FlushScheduler::start(
            SchedulerConfig {
                debounce: config.debounce,
                retry_min: config.retry_min,
                retry_max: config.retry_max,
                poll_interval: config.poll_interval,
            },
            move || match weak.upgrade() {
                Some(shared) => BusRuntime { shared }.flush().map(|_| ()),
                None => Ok(()),
            },
        )?;
        let handle = scheduler.handle().clone();
        scheduler.trigger();
        let _ = self.shared.scheduler.set(scheduler);

        if config.watch_changes {
            match StoreWatcher::watch(&config.path, Arc::new(move || handle.trigger())) {
                Ok(watcher) => {
                    let _ = self.shared.watcher.set(watcher);
                }
                Err(err) => warn!("store change hints unavailable, relying on polling: {err}"),
            }
        }
        Ok(())
    }

    pub fn identity(&self) -> &ProcessId {
        &self.shared.identity
    }

    /// The session epoch this process currently belongs to.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn store_path(&self) -> &Path {
        self.shared.store.path()
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    /// The process-wide cache map shared by every [`Cache`](crate::Cache)
    /// built on this runtime.
    pub(crate) fn cache_entries(&self) -> Arc<Mutex<CacheSnapshot>> {
        Arc::clone(self.shared.cache_entries.get_or_init(Default::default))
    }

    pub fn pending_len(&self) -> usize {
        self.shared
            .pending
            .lock()
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    /// Creates a new bus instance (one more subscriber) on this runtime.
    pub fn bus(&self) -> Bus {
        Bus::attach(self.clone())
    }

    /// Runs one flush cycle on the calling thread.
    ///
    /// Waits only for an in-process cycle already running; a store lock held
    /// by another process yields [`FlushOutcome::Locked`] immediately.
    pub fn flush(&self) -> Result<FlushOutcome> {
        let shared = &self.shared;
        let mut lock = shared
            .lock
            .lock()
            .map_err(|_| Error::Corrupt("flush lock poisoned"))?;

        let (outcome, deliveries) = match self.locked_cycle(&mut **lock) {
            Ok(Some(done)) => done,
            Ok(None) => return Ok(FlushOutcome::Locked),
            Err(err) => {
                if lock.is_held() {
                    if let Err(release_err) = lock.release() {
                        error!("failed to release store lock after error: {release_err}");
                    }
                }
                return Err(err);
            }
        };
        let released = lock.release();
        // A flush started from inside a handler delivers inline; it cannot
        // wait for the turn its caller is still holding.
        let nested = DELIVERING.with(Cell::get);
        let ticket = (!deliveries.is_empty() && !nested).then(|| shared.turns.take());
        drop(lock);

        match ticket {
            Some(ticket) => {
                shared.turns.wait_for(ticket);
                DELIVERING.with(|flag| flag.set(true));
                for notification in &deliveries {
                    self.deliver(notification);
                }
                DELIVERING.with(|flag| flag.set(false));
                shared.turns.finish(ticket);
            }
            None => {
                for notification in &deliveries {
                    self.deliver(notification);
                }
            }
        }
        released?;
        Ok(outcome)
    }

    fn locked_cycle(
        &self,
        lock: &mut dyn StoreLock,
    ) -> Result<Option<(FlushOutcome, Vec<Notification>)>> {
        let shared = &self.shared;
        shared.store.ensure_exists()?;
        if lock.probe()? || !lock.try_acquire()? {
            debug!("store lock busy; skipping cycle");
            return Ok(None);
        }

        let (raw, snapshot) = shared.store.read()?;
        let pending = self.take_pending()?;
        let mut epoch = self.epoch();
        let ctx = MergeContext {
            identity: &shared.identity,
            now_ms: self.now_ms(),
            stale_after_ms: duration_ms(shared.config.stale_after),
            stability_horizon_ms: duration_ms(shared.config.stability_horizon),
            stability_windows: shared.config.stability_windows,
        };
        let merged = reconcile(snapshot, &mut epoch, pending.clone(), &ctx);

        let written = match shared.store.write_if_changed(&raw, &merged.snapshot) {
            Ok(written) => written,
            Err(err) => {
                self.restore_pending(pending);
                return Err(err);
            }
        };
        shared.epoch.store(epoch, Ordering::Release);

        debug!(
            "flush: delivered={} pruned={} appended={} malformed={} in_process={} written={written}",
            merged.deliveries.len(),
            merged.pruned,
            merged.appended,
            merged.malformed,
            merged.in_process,
        );
        let outcome = if written {
            FlushOutcome::Written
        } else {
            FlushOutcome::Unchanged
        };
        Ok(Some((outcome, merged.deliveries)))
    }

    fn take_pending(&self) -> Result<Vec<Record>> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .map_err(|_| Error::Corrupt("pending queue lock poisoned"))?;
        Ok(mem::take(&mut *pending))
    }

    fn restore_pending(&self, mut records: Vec<Record>) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            records.append(&mut pending);
            *pending = records;
        }
    }

    pub(crate) fn enqueue(&self, record: Record) -> Result<()> {
        let mut pending = self
            .shared
            .pending
            .lock()
            .map_err(|_| Error::Corrupt("pending queue lock poisoned"))?;
        pending.push(record);
        Ok(())
    }

    pub(crate) fn trigger(&self) {
        if let Some(scheduler) = self.shared.scheduler.get() {
            scheduler.trigger();
        }
    }

    pub(crate) fn register(&self, listener: Listener) -> SubscriberId {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut registry) = self.shared.registry.lock() {
            registry.insert(id, listener);
        }
        id
    }

    pub(crate) fn unregister(&self, id: SubscriberId) {
        if let Ok(mut registry) = self.shared.registry.lock() {
            registry.remove(&id);
        }
    }

    fn listeners(&self) -> Vec<Listener> {
        match self.shared.registry.lock() {
            Ok(registry) => registry.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Hands a locally originated notification to every subscriber. A
    /// panicking handler propagates to the caller.
    pub(crate) fn dispatch(&self, notification: &Notification) {
        for listener in self.listeners() {
            listener(notification);
        }
    }

    /// Delivery path for notifications read from the store. A panicking
    /// handler is logged and does not stop delivery to the others.
    fn deliver(&self, notification: &Notification) {
        for listener in self.listeners() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(notification)));
            if outcome.is_err() {
                error!("subscriber panicked handling {}", notification.event);
            }
        }
    }
}

impl Drop for RuntimeShared {
    fn drop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        let left = self.pending.get_mut().map(|pending| pending.len()).unwrap_or(0);
        if left > 0 {
            warn!("bus runtime dropped with {left} unflushed notifications");
        }
    }
}
