//! Broker-less notification bus for processes on one host.
//!
//! Processes exchange events by merging a shared append-and-prune file under
//! an advisory lock. On top of the bus sits a replicated, expiring key/value
//! [`Cache`] that converges across processes through gossip.

pub mod bus;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod membership;
pub mod merge;
pub mod retention;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod store_lock;
pub mod watcher;

pub use bus::{Bus, Delivery, EventHandler, Notification, Notifier};
pub use cache::{Cache, CacheEntry, CacheSnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BusConfig, CacheConfig, DEFAULT_STORE_FILE};
pub use error::{Error, Result};
pub use identity::{ProcessId, ProcessRole, COORDINATOR_ID};
pub use runtime::{BusRuntime, FlushOutcome};
pub use store::{Header, Record, SharedStore, StoreSnapshot};
pub use store_lock::{FlockLock, LockOwner, StoreLock};
