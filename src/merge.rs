//! Merge of this process's view into the shared store.
//!
//! [`reconcile`] is the body of one flush cycle minus the I/O: given the
//! snapshot read under the lock, the local session epoch and the drained
//! pending queue, it produces the snapshot to write back and the
//! notifications this process has not seen yet, in sequence order.
//! Delivery to subscribers is left to the caller so that it can happen after
//! the write (and the lock release) succeed.

use log::{info, warn};

use crate::bus::Notification;
use crate::identity::ProcessId;
use crate::membership::{self, StabilityWindow};
use crate::retention::prune_acknowledged;
use crate::store::{Header, Record, StoreSnapshot};

/// Tunables and identity for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct MergeContext<'a> {
    pub identity: &'a ProcessId,
    pub now_ms: u64,
    pub stale_after_ms: u64,
    pub stability_horizon_ms: u64,
    pub stability_windows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciled {
    pub snapshot: StoreSnapshot,
    pub deliveries: Vec<Notification>,
    /// This pass joined a fresh, reset, or newly entered store and therefore
    /// neither delivered nor pruned.
    pub in_process: bool,
    /// The previous session was judged dead and its content discarded.
    pub reset: bool,
    pub pruned: usize,
    pub appended: usize,
    pub malformed: usize,
}

pub fn reconcile(
    snapshot: StoreSnapshot,
    local_epoch: &mut u64,
    pending: Vec<Record>,
    ctx: &MergeContext<'_>,
) -> Reconciled {
    let StoreSnapshot {
        header,
        mut windows,
        mut records,
    } = snapshot;
    let me = ctx.identity;
    let mut out = Reconciled::default();

    let header = match header {
        Some(header) if header.epoch != *local_epoch => {
            let header_age = local_epoch.saturating_sub(header.epoch);
            if !header.knows(me) && header_age > ctx.stale_after_ms {
                info!(
                    "store epoch {} is {header_age}ms older than local epoch {}; starting a new session",
                    header.epoch, *local_epoch
                );
                windows.clear();
                records.clear();
                out.reset = true;
                None
            } else {
                *local_epoch = header.epoch;
                Some(header)
            }
        }
        other => other,
    };

    let mut header = match header {
        Some(header) => header,
        None => {
            *local_epoch = ctx.now_ms;
            out.in_process = true;
            Header::new(ctx.now_ms, me.clone())
        }
    };

    if header.admit(me) {
        out.in_process = true;
    }

    membership::observe(
        &mut windows,
        me,
        ctx.now_ms,
        ctx.stability_horizon_ms,
        ctx.stability_windows,
    );
    let known = membership::known_ids(&windows);

    records.sort_by_key(|record| record.sequence);

    if !out.in_process {
        for record in records.iter_mut() {
            if record.is_acked_by(me) {
                continue;
            }
            match serde_json::from_str::<Notification>(&record.payload) {
                Ok(notification) => out.deliveries.push(notification),
                Err(err) => {
                    warn!("skipping malformed record {}: {err}", record.sequence);
                    out.malformed += 1;
                }
            }
            record.ack(me);
        }
        out.pruned = prune_acknowledged(&mut records, &known);
    }

    out.appended = pending.len();
    records.extend(pending);

    // The header lists recent members only, so ids of departed processes
    // age out together with their stability windows.
    header.known_ids = known;

    out.snapshot = StoreSnapshot {
        header: Some(header),
        windows: trim_windows(windows),
        records,
    };
    out
}

fn trim_windows(mut windows: Vec<StabilityWindow>) -> Vec<StabilityWindow> {
    windows.retain(|window| !window.members.is_empty());
    windows
}
