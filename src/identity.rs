//! Process identity on the shared store.
//!
//! Every process appears in the store under one opaque string that stays the
//! same for the lifetime of the process. Pool workers use their pid plus the
//! kernel start time (so a recycled pid is never mistaken for the old owner);
//! the pool coordinator may instead use the fixed [`COORDINATOR_ID`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Result;
#[cfg(target_os = "linux")]
use crate::Error;

pub const COORDINATOR_ID: &str = "[MASTER]";

/// Role of this process within the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessRole {
    #[default]
    Peer,
    Coordinator,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Discovers the identity of the running process for the given role.
    pub fn discover(role: ProcessRole) -> Result<Self> {
        match role {
            ProcessRole::Coordinator => Ok(Self::coordinator()),
            ProcessRole::Peer => {
                let (pid, start_time) = process_identity()?;
                Ok(Self(format!("[{pid}:{start_time}]")))
            }
        }
    }

    pub fn coordinator() -> Self {
        Self(COORDINATOR_ID.to_string())
    }

    pub fn is_coordinator(&self) -> bool {
        self.0 == COORDINATOR_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Returns `(pid, start_time)` for the current process.
pub(crate) fn process_identity() -> Result<(u32, u64)> {
    let pid = std::process::id();
    Ok((pid, proc_start_time(pid)?))
}

/// Whether the process that recorded `(pid, start_time)` is still running.
#[cfg(target_os = "linux")]
pub(crate) fn process_alive(pid: u32, start_time: u64) -> bool {
    if pid == 0 {
        return false;
    }
    match proc_start_time(pid) {
        Ok(current) => current == start_time,
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn process_alive(_pid: u32, _start_time: u64) -> bool {
    true
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let end = contents.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    // starttime is field 22; the split begins at field 3 (state).
    let start = contents[end + 1..]
        .split_whitespace()
        .nth(19)
        .ok_or(Error::Corrupt("stat missing starttime"))?;
    start
        .parse::<u64>()
        .map_err(|_| Error::Corrupt("stat starttime invalid"))
}

#[cfg(not(target_os = "linux"))]
fn proc_start_time(_pid: u32) -> Result<u64> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_identity_is_fixed() {
        let id = ProcessId::discover(ProcessRole::Coordinator).unwrap();
        assert!(id.is_coordinator());
        assert_eq!(id.as_str(), COORDINATOR_ID);
    }

    #[test]
    fn peer_identity_carries_pid() {
        let id = ProcessId::discover(ProcessRole::Peer).unwrap();
        let pid = std::process::id().to_string();
        assert!(id.as_str().starts_with(&format!("[{pid}:")));
        assert!(!id.is_coordinator());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_process_is_alive() {
        let (pid, start) = process_identity().unwrap();
        assert!(process_alive(pid, start));
        assert!(!process_alive(pid, start.wrapping_add(1)));
        assert!(!process_alive(0, start));
    }
}
