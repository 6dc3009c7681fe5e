//! Stability windows: who has been active on the store recently.
//!
//! Each flush cycle stamps the calling process into the newest window. Once a
//! window is older than the horizon a new one is opened, and only the most
//! recent few are retained. The union of their members is the set of known
//! processes that must acknowledge a record before it can be pruned, so a
//! process that skips a cycle or two keeps its place while one that has gone
//! away drops out after `keep * horizon`.

use crate::identity::ProcessId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityWindow {
    pub start_ms: u64,
    pub members: Vec<ProcessId>,
}

impl StabilityWindow {
    pub fn new(start_ms: u64) -> Self {
        Self {
            start_ms,
            members: Vec::new(),
        }
    }

    /// Adds `id` to the window; returns `true` if it was absent.
    pub fn join(&mut self, id: &ProcessId) -> bool {
        if self.members.contains(id) {
            return false;
        }
        self.members.push(id.clone());
        true
    }

    pub fn is_current(&self, now_ms: u64, horizon_ms: u64) -> bool {
        now_ms.saturating_sub(self.start_ms) < horizon_ms
    }
}

/// Stamps `id` into the current window, opening a new one if the newest is
/// older than `horizon_ms`, and keeps only the last `keep` windows.
pub fn observe(
    windows: &mut Vec<StabilityWindow>,
    id: &ProcessId,
    now_ms: u64,
    horizon_ms: u64,
    keep: usize,
) {
    windows.sort_by_key(|window| window.start_ms);
    match windows.last_mut() {
        Some(latest) if latest.is_current(now_ms, horizon_ms) => {
            latest.join(id);
        }
        _ => {
            let mut window = StabilityWindow::new(now_ms);
            window.join(id);
            windows.push(window);
        }
    }
    let keep = keep.max(1);
    if windows.len() > keep {
        let excess = windows.len() - keep;
        windows.drain(..excess);
    }
}

/// Union of members across `windows`, in first-seen order.
pub fn known_ids(windows: &[StabilityWindow]) -> Vec<ProcessId> {
    let mut known: Vec<ProcessId> = Vec::new();
    for member in windows.iter().flat_map(|window| window.members.iter()) {
        if !known.contains(member) {
            known.push(member.clone());
        }
    }
    known
}
