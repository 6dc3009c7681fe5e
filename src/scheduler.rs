//! Single-slot flush scheduler.
//!
//! One worker thread drains a slot that holds at most one pending run. Any
//! number of triggers arriving before the slot fires collapse into that run,
//! and because there is exactly one worker a run can never overlap another.
//! A failed run re-arms the slot after a randomized delay so competing
//! processes drift apart; an optional poll interval keeps the worker cycling
//! when nothing else wakes it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Default)]
struct Slot {
    due: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct SlotShared {
    slot: Mutex<Slot>,
    wake: Condvar,
}

impl SlotShared {
    /// Arms the slot for `at`, keeping an earlier deadline if one is set.
    fn arm(&self, at: Instant) {
        let Ok(mut slot) = self.slot.lock() else {
            return;
        };
        slot.due = Some(match slot.due {
            Some(due) if due <= at => due,
            _ => at,
        });
        self.wake.notify_one();
    }
}

/// Cheap handle for requesting runs from other threads.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shared: Arc<SlotShared>,
    debounce: Duration,
}

impl SchedulerHandle {
    /// Requests a run after the debounce delay.
    pub fn trigger(&self) {
        self.shared.arm(Instant::now() + self.debounce);
    }

    /// Requests a run after `delay`.
    pub fn schedule_in(&self, delay: Duration) {
        self.shared.arm(Instant::now() + delay);
    }
}

pub struct FlushScheduler {
    handle: SchedulerHandle,
    worker: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Starts the worker. `job` runs once per fired slot; an `Err` schedules a
    /// jittered retry.
    pub fn start<F>(config: SchedulerConfig, mut job: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let shared = Arc::new(SlotShared::default());
        let handle = SchedulerHandle {
            shared: Arc::clone(&shared),
            debounce: config.debounce,
        };
        let worker_handle = handle.clone();
        let worker = thread::Builder::new()
            .name("filebus-flush".to_string())
            .spawn(move || {
                let mut last_run = Instant::now();
                while wait_for_slot(&shared, config.poll_interval, last_run) {
                    last_run = Instant::now();
                    if let Err(err) = job() {
                        let delay = retry_delay(config.retry_min, config.retry_max);
                        warn!("flush failed: {err}; retrying in {}ms", delay.as_millis());
                        worker_handle.schedule_in(delay);
                    }
                }
                debug!("flush worker stopped");
            })
            .map_err(Error::Io)?;
        Ok(Self {
            handle,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn trigger(&self) {
        self.handle.trigger();
    }

    pub fn stop(&mut self) {
        if let Ok(mut slot) = self.handle.shared.slot.lock() {
            slot.shutdown = true;
        }
        self.handle.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            // The last owner of the runtime may be the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocks until the slot fires or the poll interval elapses. Returns `false`
/// on shutdown.
fn wait_for_slot(shared: &SlotShared, poll: Option<Duration>, last_run: Instant) -> bool {
    let Ok(mut slot) = shared.slot.lock() else {
        return false;
    };
    loop {
        if slot.shutdown {
            return false;
        }
        let now = Instant::now();
        let poll_due = poll.map(|interval| last_run + interval);
        let next = match (slot.due, poll_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        slot = match next {
            Some(at) if at <= now => {
                slot.due = None;
                return true;
            }
            Some(at) => match shared.wake.wait_timeout(slot, at - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            },
            None => match shared.wake.wait(slot) {
                Ok(guard) => guard,
                Err(_) => return false,
            },
        };
    }
}

/// Uniform delay in `min..=max`.
pub fn retry_delay(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(debounce_ms: u64, poll: Option<Duration>) -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(debounce_ms),
            retry_min: Duration::from_millis(10),
            retry_max: Duration::from_millis(20),
            poll_interval: poll,
        }
    }

    #[test]
    fn retry_delay_stays_in_bounds() {
        for _ in 0..200 {
            let delay = retry_delay(Duration::from_millis(200), Duration::from_millis(700));
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(700));
        }
        assert_eq!(
            retry_delay(Duration::from_millis(50), Duration::from_millis(10)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn burst_of_triggers_coalesces() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let scheduler = FlushScheduler::start(config(50, None), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        for _ in 0..20 {
            scheduler.trigger();
        }
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.trigger();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_schedules_retry() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let scheduler = FlushScheduler::start(config(5, None), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Corrupt("first run fails"))
            } else {
                Ok(())
            }
        })
        .unwrap();

        scheduler.trigger();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn poll_runs_without_triggers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut scheduler =
            FlushScheduler::start(config(5, Some(Duration::from_millis(20))), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        scheduler.stop();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} polls");
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
