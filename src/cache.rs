//! Replicated, expiring key/value cache on top of the bus.
//!
//! All caches built on one [`BusRuntime`] share the process's map; each keeps
//! its own [`Bus`] subscriber and configuration. Local mutations are broadcast to peer processes (`cache:update`,
//! `cache:delete`), which apply them without re-broadcasting. Shortly after
//! construction a cache gossips its whole map (`cache:sync-request`); every
//! peer merges it and answers with its merged map (`cache:sync-response`),
//! which everyone else merges in turn. Updates and merges keep, per key, the
//! entry with the greater `added` timestamp (see [`supersedes`]).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{Bus, Delivery, Notifier};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::runtime::BusRuntime;
use crate::scheduler::retry_delay;
use crate::{Error, Result};

pub const EVENT_UPDATE: &str = "cache:update";
pub const EVENT_DELETE: &str = "cache:delete";
pub const EVENT_SYNC_REQUEST: &str = "cache:sync-request";
pub const EVENT_SYNC_RESPONSE: &str = "cache:sync-response";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub added: u64,
    pub accessed: u64,
    /// `None` never expires.
    pub expires: Option<u64>,
    /// Lifetime granted on insert and on every read; 0 means unbounded.
    #[serde(default)]
    pub ttl_secs: u64,
}

impl CacheEntry {
    fn new(value: Value, now_ms: u64, ttl_secs: u64) -> Self {
        Self {
            value,
            added: now_ms,
            accessed: now_ms,
            expires: expiry(now_ms, ttl_secs),
            ttl_secs,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires, Some(at) if at <= now_ms)
    }

    fn touch(&mut self, now_ms: u64) {
        self.accessed = now_ms;
        self.expires = expiry(now_ms, self.ttl_secs);
    }
}

fn expiry(now_ms: u64, ttl_secs: u64) -> Option<u64> {
    if ttl_secs == 0 {
        return None;
    }
    Some(now_ms.saturating_add(ttl_secs.saturating_mul(1_000)))
}

pub type CacheSnapshot = HashMap<String, CacheEntry>;

/// A write as the sender stored it, so that peers order it by the sender's
/// insertion time rather than by arrival.
#[derive(Debug, Serialize, Deserialize)]
struct UpdateMessage {
    key: String,
    entry: CacheEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeleteMessage {
    key: String,
}

struct CacheInner {
    bus: Bus,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    // Shared by every cache on the same runtime.
    entries: Arc<Mutex<CacheSnapshot>>,
    timer: OnceLock<CacheTimer>,
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    pub fn new(runtime: &BusRuntime, config: CacheConfig) -> Result<Self> {
        let inner = Arc::new(CacheInner {
            bus: runtime.bus(),
            config,
            clock: runtime.clock(),
            entries: runtime.cache_entries(),
            timer: OnceLock::new(),
        });
        let cache = Self { inner };
        cache.subscribe()?;
        cache.start_timer()?;
        Ok(cache)
    }

    fn subscribe(&self) -> Result<()> {
        let bus = &self.inner.bus;

        let weak = Arc::downgrade(&self.inner);
        bus.on(EVENT_UPDATE, move |message| {
            with_cache(&weak, |cache| {
                let update: UpdateMessage = serde_json::from_value(message.clone())?;
                cache.apply_remote(update.key, update.entry)
            });
        })?;

        let weak = Arc::downgrade(&self.inner);
        bus.on(EVENT_DELETE, move |message| {
            with_cache(&weak, |cache| {
                let delete: DeleteMessage = serde_json::from_value(message.clone())?;
                cache.remove(&delete.key, false)
            });
        })?;

        let weak = Arc::downgrade(&self.inner);
        bus.on(EVENT_SYNC_REQUEST, move |message| {
            with_cache(&weak, |cache| {
                let incoming: CacheSnapshot = serde_json::from_value(message.clone())?;
                let merged = cache.merge_snapshot(incoming)?;
                cache
                    .inner
                    .bus
                    .notify(EVENT_SYNC_RESPONSE, &merged, Delivery::PeersOnly)
            });
        })?;

        let weak = Arc::downgrade(&self.inner);
        bus.on(EVENT_SYNC_RESPONSE, move |message| {
            with_cache(&weak, |cache| {
                let incoming: CacheSnapshot = serde_json::from_value(message.clone())?;
                cache.merge_snapshot(incoming).map(|_| ())
            });
        })?;
        Ok(())
    }

    fn start_timer(&self) -> Result<()> {
        let config = &self.inner.config;
        let sync_after = config
            .sync_on_start
            .then(|| retry_delay(config.sync_delay_min, config.sync_delay_max));
        if config.cleanup_interval.is_none() && sync_after.is_none() {
            return Ok(());
        }
        let timer = CacheTimer::start(
            Arc::downgrade(&self.inner),
            config.cleanup_interval,
            sync_after,
        )?;
        let _ = self.inner.timer.set(timer);
        Ok(())
    }

    fn entries(&self) -> Result<MutexGuard<'_, CacheSnapshot>> {
        self.inner
            .entries
            .lock()
            .map_err(|_| Error::Corrupt("cache lock poisoned"))
    }

    fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value` and broadcasts it to peers.
    ///
    /// `ttl_secs`: `None` applies the configured default, `Some(0)` never
    /// expires.
    pub fn set<T>(&self, key: impl Into<String>, value: &T, ttl_secs: Option<u64>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.set_value(key.into(), serde_json::to_value(value)?, ttl_secs, true)
    }

    /// Stores `value` without telling peers.
    pub fn set_local<T>(&self, key: impl Into<String>, value: &T, ttl_secs: Option<u64>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.set_value(key.into(), serde_json::to_value(value)?, ttl_secs, false)
    }

    fn set_value(&self, key: String, value: Value, ttl_secs: Option<u64>, notify: bool) -> Result<()> {
        let ttl_secs = ttl_secs.unwrap_or(self.inner.config.default_ttl_secs);
        let now = self.now_ms();
        let entry = CacheEntry::new(value, now, ttl_secs);
        {
            let mut entries = self.entries()?;
            self.make_room(&mut entries, &key, now);
            entries.insert(key.clone(), entry.clone());
        }
        if notify {
            let update = UpdateMessage { key, entry };
            self.inner
                .bus
                .notify(EVENT_UPDATE, &update, Delivery::PeersOnly)?;
        }
        Ok(())
    }

    /// Applies a peer's write unless the local entry is newer.
    fn apply_remote(&self, key: String, entry: CacheEntry) -> Result<()> {
        let now = self.now_ms();
        if entry.is_expired(now) {
            return Ok(());
        }
        let mut entries = self.entries()?;
        self.admit(&mut entries, key, entry, now);
        Ok(())
    }

    /// Evicts one entry if inserting `key` would exceed capacity.
    fn make_room(&self, entries: &mut CacheSnapshot, key: &str, now_ms: u64) {
        let max = self.inner.config.max_entries;
        if max > 0 && entries.len() >= max && !entries.contains_key(key) {
            evict_one(entries, now_ms);
        }
    }

    fn admit(&self, entries: &mut CacheSnapshot, key: String, entry: CacheEntry, now_ms: u64) {
        let replace = entries
            .get(&key)
            .map_or(true, |current| supersedes(&entry, current));
        if replace {
            self.make_room(entries, &key, now_ms);
            entries.insert(key, entry);
        }
    }

    /// Returns the stored value, extending its lifetime, or `None` if absent,
    /// expired, or not a `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!("cache entry {key} has unexpected shape: {err}");
                None
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        let now = self.now_ms();
        let mut entries = self.entries().ok()?;
        let entry = entries.get_mut(key)?;
        if entry.is_expired(now) {
            entries.remove(key);
            return None;
        }
        entry.touch(now);
        Some(entry.value.clone())
    }

    /// Whether a live entry exists. Does not extend its lifetime.
    pub fn has(&self, key: &str) -> bool {
        let now = self.now_ms();
        self.entries()
            .map(|entries| entries.get(key).is_some_and(|entry| !entry.is_expired(now)))
            .unwrap_or(false)
    }

    /// Removes `key` here and on every peer.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.remove(key, true)
    }

    /// Removes `key` here only.
    pub fn delete_local(&self, key: &str) -> Result<()> {
        self.remove(key, false)
    }

    fn remove(&self, key: &str, notify: bool) -> Result<()> {
        self.entries()?.remove(key);
        if notify {
            let delete = DeleteMessage {
                key: key.to_string(),
            };
            self.inner
                .bus
                .notify(EVENT_DELETE, &delete, Delivery::PeersOnly)?;
        }
        Ok(())
    }

    /// Removes every expired entry; returns how many were removed.
    pub fn clean_up(&self) -> usize {
        let now = self.now_ms();
        let Ok(mut entries) = self.entries() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Wraps `f` so that results are cached under `name` plus the serialized
    /// arguments. A hit returns the cached value without calling `f`.
    pub fn memoize<A, R, F>(
        &self,
        name: &str,
        f: F,
        ttl_secs: Option<u64>,
    ) -> impl Fn(A) -> Result<R>
    where
        A: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(A) -> R,
    {
        let cache = self.clone();
        let name = name.to_string();
        move |args: A| {
            let key = memo_key(&name, &args)?;
            if let Some(hit) = cache.get::<R>(&key) {
                return Ok(hit);
            }
            let result = f(args);
            cache.set(key, &result, ttl_secs)?;
            Ok(result)
        }
    }

    /// A copy of the current map.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.entries()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Merges a peer's map into this one (greater `added` wins; already
    /// expired entries are ignored; capacity is enforced) and returns the
    /// merged map.
    pub fn merge_snapshot(&self, incoming: CacheSnapshot) -> Result<CacheSnapshot> {
        let now = self.now_ms();
        let mut entries = self.entries()?;
        let mut incoming: Vec<(String, CacheEntry)> = incoming.into_iter().collect();
        // Oldest first, so that when capacity runs out the newest writes stay.
        incoming.sort_by_key(|(_, entry)| entry.added);
        for (key, entry) in incoming {
            if entry.is_expired(now) {
                continue;
            }
            self.admit(&mut entries, key, entry, now);
        }
        Ok(entries.clone())
    }

    /// Broadcasts this cache's map to every peer, asking for theirs.
    pub fn request_sync(&self) -> Result<()> {
        let snapshot = self.snapshot();
        self.inner
            .bus
            .notify(EVENT_SYNC_REQUEST, &snapshot, Delivery::PeersOnly)
    }
}

impl Notifier for Cache {
    fn bus(&self) -> &Bus {
        &self.inner.bus
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
    }
}

fn with_cache<F>(weak: &Weak<CacheInner>, apply: F)
where
    F: FnOnce(&Cache) -> Result<()>,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if let Err(err) = apply(&Cache { inner }) {
        warn!("ignoring cache message: {err}");
    }
}

/// Whether `incoming` replaces `current`: the later insertion wins, and equal
/// insertion times fall back to comparing the serialized values so that every
/// process settles on the same entry.
fn supersedes(incoming: &CacheEntry, current: &CacheEntry) -> bool {
    match incoming.added.cmp(&current.added) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => incoming.value.to_string() >= current.value.to_string(),
    }
}

/// Drops the first expired entry found, or else the least recently accessed.
fn evict_one(entries: &mut CacheSnapshot, now_ms: u64) {
    let mut oldest: Option<(&String, u64)> = None;
    let mut expired: Option<&String> = None;
    for (key, entry) in entries.iter() {
        if entry.is_expired(now_ms) {
            expired = Some(key);
            break;
        }
        if oldest.map_or(true, |(_, accessed)| entry.accessed < accessed) {
            oldest = Some((key, entry.accessed));
        }
    }
    let victim = expired.or(oldest.map(|(key, _)| key)).cloned();
    if let Some(key) = victim {
        entries.remove(&key);
    }
}

fn memo_key<A: Serialize>(name: &str, args: &A) -> Result<String> {
    // Going through `Value` sorts object keys, so equal arguments always
    // serialize identically.
    let canonical = serde_json::to_value(args)?;
    Ok(format!("{name}__{}", serde_json::to_string(&canonical)?))
}

#[derive(Debug, Default)]
struct TimerState {
    shutdown: bool,
}

/// Background sweep and one-shot startup sync for a cache.
struct CacheTimer {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl CacheTimer {
    fn start(
        cache: Weak<CacheInner>,
        cleanup_interval: Option<Duration>,
        sync_after: Option<Duration>,
    ) -> Result<Self> {
        let shared = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("filebus-cache".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut sync_at = sync_after.map(|delay| started + delay);
                let mut cleanup_at = cleanup_interval.map(|every| started + every);
                loop {
                    let next = match (sync_at, cleanup_at) {
                        (Some(a), Some(b)) => a.min(b),
                        (Some(a), None) | (None, Some(a)) => a,
                        (None, None) => return,
                    };
                    if !sleep_until(&thread_shared, next) {
                        return;
                    }
                    let Some(inner) = cache.upgrade() else {
                        return;
                    };
                    let cache = Cache { inner };
                    let now = Instant::now();
                    if sync_at.is_some_and(|at| at <= now) {
                        sync_at = None;
                        if let Err(err) = cache.request_sync() {
                            warn!("cache sync request failed: {err}");
                        }
                    }
                    if let (Some(at), Some(every)) = (cleanup_at, cleanup_interval) {
                        if at <= now {
                            let removed = cache.clean_up();
                            if removed > 0 {
                                debug!("cache sweep removed {removed} expired entries");
                            }
                            cleanup_at = Some(now + every);
                        }
                    }
                }
            })
            .map_err(Error::Io)?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    fn stop(&mut self) {
        let (state, wake) = &*self.shared;
        if let Ok(mut state) = state.lock() {
            state.shutdown = true;
        }
        wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Sleeps until `at`; returns `false` if shutdown was requested.
fn sleep_until(shared: &(Mutex<TimerState>, Condvar), at: Instant) -> bool {
    let (state, wake) = shared;
    let Ok(mut guard) = state.lock() else {
        return false;
    };
    loop {
        if guard.shutdown {
            return false;
        }
        let now = Instant::now();
        if now >= at {
            return true;
        }
        guard = match wake.wait_timeout(guard, at - now) {
            Ok((guard, _)) => guard,
            Err(_) => return false,
        };
    }
}
