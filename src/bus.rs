//! Per-instance bus facade.
//!
//! A [`Bus`] is one subscriber on a [`BusRuntime`]. Any number of them may
//! exist in a process; they share the runtime's store, pending queue and
//! flush worker, and each keeps its own event handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::{BusRuntime, SubscriberId};
use crate::store::Record;
use crate::{Error, Result};

/// Payload of one record on the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: u64,
    pub event: String,
    pub message: Value,
}

/// Who receives a notification besides the other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Only processes other than this one (the store round trip).
    #[default]
    PeersOnly,
    /// Peers, plus every subscriber in this process right away.
    IncludeLocal,
}

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

type HandlerMap = Arc<Mutex<HashMap<String, Vec<EventHandler>>>>;

pub struct Bus {
    runtime: BusRuntime,
    subscriber: SubscriberId,
    handlers: HandlerMap,
    destroyed: AtomicBool,
}

impl Bus {
    pub(crate) fn attach(runtime: BusRuntime) -> Self {
        let handlers: HandlerMap = Arc::new(Mutex::new(HashMap::new()));
        let routed = Arc::clone(&handlers);
        let subscriber = runtime.register(Arc::new(move |notification: &Notification| {
            let matching = match routed.lock() {
                Ok(map) => map.get(&notification.event).cloned(),
                Err(_) => None,
            };
            for handler in matching.unwrap_or_default() {
                handler(&notification.message);
            }
        }));
        Self {
            runtime,
            subscriber,
            handlers,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &BusRuntime {
        &self.runtime
    }

    /// Queues `message` under `event` for every other process and, with
    /// [`Delivery::IncludeLocal`], hands it to this process's subscribers
    /// immediately. Returns once queued; the store write happens on the next
    /// flush cycle and its failures never surface here.
    pub fn notify<T>(&self, event: &str, message: &T, delivery: Delivery) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        if self.is_destroyed() {
            debug!("dropping {event} notification from destroyed bus");
            return Ok(());
        }
        let timestamp = self.runtime.now_ms();
        let notification = Notification {
            timestamp,
            event: event.to_string(),
            message: serde_json::to_value(message)?,
        };
        let payload = serde_json::to_string(&notification)?;
        self.runtime.enqueue(Record::new(
            timestamp,
            payload,
            self.runtime.identity().clone(),
        ))?;
        if delivery == Delivery::IncludeLocal {
            self.runtime.dispatch(&notification);
        }
        self.runtime.trigger();
        Ok(())
    }

    /// Registers `handler` for `event`, whether it originates in this process
    /// or arrives from the store.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut map = self
            .handlers
            .lock()
            .map_err(|_| Error::Corrupt("bus handler lock poisoned"))?;
        map.entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
        Ok(())
    }

    /// Detaches this instance from the runtime. Idempotent; other instances
    /// and the shared store are unaffected.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runtime.unregister(self.subscriber);
        if let Ok(mut map) = self.handlers.lock() {
            map.clear();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The capability set shared by [`Bus`] and the types built on it.
pub trait Notifier {
    fn bus(&self) -> &Bus;

    fn notify<T>(&self, event: &str, message: &T, delivery: Delivery) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.bus().notify(event, message, delivery)
    }

    fn on<F>(&self, event: &str, handler: F) -> Result<()>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus().on(event, handler)
    }

    fn destroy(&self) {
        self.bus().destroy()
    }
}

impl Notifier for Bus {
    fn bus(&self) -> &Bus {
        self
    }
}
