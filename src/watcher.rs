//! Best-effort change hints for the shared store.
//!
//! On Linux an inotify worker watches the store's directory and calls the
//! supplied hook whenever the store file is created, written or renamed into
//! place. Elsewhere the watcher is inert and the flush scheduler's periodic
//! poll carries the load. Nothing depends on a hint arriving.

use std::path::Path;
use std::sync::Arc;

use crate::Result;

pub type ChangeHook = Arc<dyn Fn() + Send + Sync + 'static>;

#[cfg(target_os = "linux")]
mod platform {
    use std::ffi::CString;
    use std::mem;
    use std::os::unix::io::RawFd;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use libc::{
        inotify_add_watch, inotify_event, inotify_init1, poll, pollfd, read, IN_CLOEXEC,
        IN_CLOSE_WRITE, IN_CREATE, IN_MODIFY, IN_MOVED_TO, IN_NONBLOCK, POLLIN,
    };
    use log::debug;

    use super::ChangeHook;
    use crate::{Error, Result};

    pub struct InotifyWatcher {
        fd: Option<RawFd>,
        shutdown: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl InotifyWatcher {
        pub fn new(store_path: &Path, hook: ChangeHook) -> Result<Self> {
            let dir = match store_path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => std::path::PathBuf::from("."),
            };
            let file_name = store_path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or(Error::Unsupported("store path has no utf-8 file name"))?
                .to_string();
            let dir_cstr = CString::new(dir.to_string_lossy().as_bytes())
                .map_err(|_| Error::Unsupported("store path contains NUL"))?;

            let inotify_fd = unsafe { inotify_init1(IN_CLOEXEC | IN_NONBLOCK) };
            if inotify_fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let mask = IN_CREATE | IN_MODIFY | IN_CLOSE_WRITE | IN_MOVED_TO;
            let watch = unsafe { inotify_add_watch(inotify_fd, dir_cstr.as_ptr(), mask) };
            if watch < 0 {
                unsafe {
                    libc::close(inotify_fd);
                }
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let thread_shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name("filebus-watch".to_string())
                .spawn(move || watch_loop(inotify_fd, &file_name, &thread_shutdown, &hook))?;
            debug!("watching {} for store changes", dir.display());

            Ok(Self {
                fd: Some(inotify_fd),
                shutdown,
                handle: Some(handle),
            })
        }

        pub fn stop(&mut self) {
            self.shutdown.store(true, Ordering::Release);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
            if let Some(fd) = self.fd.take() {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    impl Drop for InotifyWatcher {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn watch_loop(fd: RawFd, file_name: &str, shutdown: &AtomicBool, hook: &ChangeHook) {
        let mut buffer = vec![0u8; 4096];
        let mut pfd = pollfd {
            fd,
            events: POLLIN,
            revents: 0,
        };
        let header_size = mem::size_of::<inotify_event>();
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let res = unsafe { poll(&mut pfd, 1, 100) };
            if res < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    thread::sleep(Duration::from_millis(50));
                }
                continue;
            }
            if res == 0 || (pfd.revents & POLLIN) == 0 {
                continue;
            }
            let len = unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
            if len <= 0 {
                continue;
            }
            let len = len as usize;

            let mut touched = false;
            let mut offset = 0usize;
            while offset + header_size <= len {
                let Some(name_len) = parse_name_len(&buffer[offset..offset + header_size]) else {
                    break;
                };
                let name_start = offset + header_size;
                let name_end = name_start.saturating_add(name_len as usize);
                if name_end > len {
                    break;
                }
                let name_bytes = &buffer[name_start..name_end];
                let nul = name_bytes
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(name_bytes.len());
                if &name_bytes[..nul] == file_name.as_bytes() {
                    touched = true;
                }
                offset = name_end;
            }

            if touched {
                hook();
            }
        }
    }

    fn parse_name_len(buf: &[u8]) -> Option<u32> {
        if buf.len() < mem::size_of::<inotify_event>() {
            return None;
        }
        Some(u32::from_ne_bytes(buf[12..16].try_into().ok()?))
    }

    pub(super) use InotifyWatcher as WatcherImpl;
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::path::Path;

    use super::ChangeHook;
    use crate::Result;

    pub struct NoopWatcher;

    impl NoopWatcher {
        pub fn new(_store_path: &Path, _hook: ChangeHook) -> Result<Self> {
            Ok(Self)
        }

        pub fn stop(&mut self) {}
    }

    pub(super) use NoopWatcher as WatcherImpl;
}

/// Calls a hook when the store file changes on disk.
pub struct StoreWatcher {
    inner: platform::WatcherImpl,
}

impl StoreWatcher {
    pub fn watch(store_path: &Path, hook: ChangeHook) -> Result<Self> {
        Ok(Self {
            inner: platform::WatcherImpl::new(store_path, hook)?,
        })
    }

    pub fn stop(&mut self) {
        self.inner.stop();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn hook_fires_on_store_write_only() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("notification.ipc");
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let mut watcher = StoreWatcher::watch(
            &store,
            Arc::new(move || {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(());
                }
            }),
        )
        .unwrap();

        std::fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        std::fs::write(&store, b"hello").unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        watcher.stop();
    }
}
