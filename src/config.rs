//! Bus and cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::ProcessRole;

pub const DEFAULT_STORE_FILE: &str = "notification.ipc";

/// Configuration for a [`BusRuntime`](crate::BusRuntime).
///
/// Every process sharing a store must agree on `path`, `stale_after`,
/// `stability_horizon` and `stability_windows`; the rest is local.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Shared store file.
    pub path: PathBuf,

    /// Whether this process announces itself as the pool coordinator.
    /// Default: `Peer`
    #[serde(default)]
    pub role: ProcessRole,

    /// A store header older than the local epoch by more than this, and
    /// unaware of this process, is treated as a dead session.
    /// Default: 5s
    pub stale_after: Duration,

    /// Lifetime of one stability window.
    /// Default: 25s
    pub stability_horizon: Duration,

    /// Number of stability windows kept in the store.
    /// Default: 5
    pub stability_windows: usize,

    /// Delay that coalesces flush triggers into one run.
    /// Default: 100ms
    pub debounce: Duration,

    /// Bounds of the randomized delay before retrying a failed flush.
    /// Default: 200ms..=700ms
    pub retry_min: Duration,
    pub retry_max: Duration,

    /// Flush at least this often even without triggers. Required for
    /// delivery when change hints are unavailable, and keeps this process
    /// inside the stability windows while idle.
    /// Default: 1s
    pub poll_interval: Option<Duration>,

    /// Use filesystem change notifications as a wake-up hint.
    /// Default: true
    pub watch_changes: bool,

    /// Run flush cycles on a background worker. When false, cycles only run
    /// through [`BusRuntime::flush`](crate::BusRuntime::flush).
    /// Default: true
    pub background_flush: bool,

    /// Fold the written store into base64 lines of this width.
    /// Default: None (plain lines)
    pub fold_width: Option<usize>,
}

impl BusConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            role: ProcessRole::Peer,
            stale_after: Duration::from_secs(5),
            stability_horizon: Duration::from_secs(25),
            stability_windows: 5,
            debounce: Duration::from_millis(100),
            retry_min: Duration::from_millis(200),
            retry_max: Duration::from_millis(700),
            poll_interval: Some(Duration::from_secs(1)),
            watch_changes: true,
            background_flush: true,
            fold_width: None,
        }
    }

    /// Configuration without background threads; cycles run only when
    /// [`BusRuntime::flush`](crate::BusRuntime::flush) is called.
    pub fn manual(path: impl Into<PathBuf>) -> Self {
        Self {
            poll_interval: None,
            watch_changes: false,
            background_flush: false,
            ..Self::new(path)
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join(DEFAULT_STORE_FILE))
    }
}

/// Configuration for a [`Cache`](crate::Cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity; 0 disables eviction.
    /// Default: 5000
    pub max_entries: usize,

    /// TTL applied when `set` is called without one.
    /// Default: 60
    pub default_ttl_secs: u64,

    /// Period of the background expiry sweep.
    /// Default: 60s
    pub cleanup_interval: Option<Duration>,

    /// Broadcast a sync request after a random delay in
    /// `sync_delay_min..=sync_delay_max` once constructed.
    /// Default: true, 2s..=4s
    pub sync_on_start: bool,
    pub sync_delay_min: Duration,
    pub sync_delay_max: Duration,
}

impl CacheConfig {
    /// Configuration without timers, for driving the cache by hand.
    pub fn manual() -> Self {
        Self {
            cleanup_interval: None,
            sync_on_start: false,
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5000,
            default_ttl_secs: 60,
            cleanup_interval: Some(Duration::from_secs(60)),
            sync_on_start: true,
            sync_delay_min: Duration::from_secs(2),
            sync_delay_max: Duration::from_secs(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_defaults() {
        let config = BusConfig::new("/tmp/bus.ipc");
        assert_eq!(config.stale_after, Duration::from_secs(5));
        assert_eq!(config.stability_horizon, Duration::from_secs(25));
        assert_eq!(config.stability_windows, 5);
        assert_eq!(config.debounce, Duration::from_millis(100));
        assert_eq!(config.retry_min, Duration::from_millis(200));
        assert_eq!(config.retry_max, Duration::from_millis(700));
        assert!(config.background_flush);
        assert!(config.fold_width.is_none());
    }

    #[test]
    fn manual_bus_has_no_background_work() {
        let config = BusConfig::manual("/tmp/bus.ipc");
        assert!(!config.background_flush);
        assert!(!config.watch_changes);
        assert!(config.poll_interval.is_none());
        assert_eq!(config.stale_after, Duration::from_secs(5));
    }

    #[test]
    fn cache_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 5000);
        assert_eq!(config.default_ttl_secs, 60);
        assert_eq!(config.cleanup_interval, Some(Duration::from_secs(60)));
        assert!(config.sync_on_start);

        let manual = CacheConfig::manual();
        assert!(manual.cleanup_interval.is_none());
        assert!(!manual.sync_on_start);
    }

    #[test]
    fn config_serializes_to_json() {
        let config = BusConfig::manual("/tmp/bus.ipc");
        let json = serde_json::to_string(&config).unwrap();
        let back: BusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, config.path);
        assert_eq!(back.role, ProcessRole::Peer);
    }
}
