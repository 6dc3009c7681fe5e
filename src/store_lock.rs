//! Advisory lock guarding the shared store.
//!
//! The lock lives in a sidecar file next to the store (`<store>.lock`) so the
//! store itself can be replaced by rename while the lock is held. Acquisition
//! is always non-blocking: a lock held by a peer means the current flush cycle
//! is abandoned, never waited on.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::identity::{process_alive, process_identity};
use crate::{Error, Result};

/// The lock primitive consumed by the flush cycle.
pub trait StoreLock: Send {
    /// Whether some holder currently has the lock.
    fn probe(&self) -> Result<bool>;
    /// Attempts to take the lock without blocking.
    fn try_acquire(&mut self) -> Result<bool>;
    /// Releases the lock if this handle holds it.
    fn release(&mut self) -> Result<()>;
    fn is_held(&self) -> bool;
}

/// `flock(2)` based lock on `<store>.lock`.
#[derive(Debug)]
pub struct FlockLock {
    path: PathBuf,
    held: Option<File>,
}

impl FlockLock {
    pub fn for_store(store_path: &Path) -> Self {
        Self {
            path: lock_path(store_path),
            held: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?)
    }
}

impl StoreLock for FlockLock {
    fn probe(&self) -> Result<bool> {
        if self.held.is_some() {
            return Ok(true);
        }
        let file = self.open()?;
        if try_lock(&file)? {
            unlock(&file)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn try_acquire(&mut self) -> Result<bool> {
        if self.held.is_some() {
            return Ok(true);
        }
        let file = self.open()?;
        if !try_lock(&file)? {
            return Ok(false);
        }
        write_owner_record(&file)?;
        self.held = Some(file);
        Ok(true)
    }

    fn release(&mut self) -> Result<()> {
        if let Some(file) = self.held.take() {
            unlock(&file)?;
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for FlockLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

pub fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store_path.with_file_name(name)
}

/// Last process that acquired a store lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub start_time: u64,
}

impl LockOwner {
    pub fn is_alive(&self) -> bool {
        process_alive(self.pid, self.start_time)
    }
}

/// Reads the owner record left by the last acquirer, if any.
pub fn read_lock_owner(store_path: &Path) -> Result<Option<LockOwner>> {
    let path = lock_path(store_path);
    if !path.exists() {
        return Ok(None);
    }
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    let mut parts = contents.split_whitespace();
    let pid = parts.next().and_then(|pid| pid.parse::<u32>().ok());
    let start_time = parts.next().and_then(|start| start.parse::<u64>().ok());
    Ok(match (pid, start_time) {
        (Some(pid), Some(start_time)) => Some(LockOwner { pid, start_time }),
        _ => None,
    })
}

fn write_owner_record(file: &File) -> Result<()> {
    let (pid, start_time) = process_identity()?;
    let record = format!("{pid} {start_time}\n");
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    Ok(())
}

fn try_lock(file: &File) -> Result<bool> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

fn unlock(file: &File) -> Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if res == 0 {
        return Ok(());
    }
    Err(Error::Io(std::io::Error::last_os_error()))
}
