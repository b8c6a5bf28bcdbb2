//! Byte-range lock primitives.
//!
//! Every lock the VFS takes, on the database file or on the WAL-index file,
//! goes through a [`LockBackend`]. The lock state machines in
//! [`crate::lock`] and [`crate::shm`] are written once against this trait;
//! per-OS differences live only in the implementations here.

use std::fmt;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use sqlvfs_error::{IoErrorKind, Result, VfsError};

#[cfg(unix)]
mod fcntl;
mod memory;

#[cfg(unix)]
pub use fcntl::FcntlBackend;
pub use memory::{ByteLockTable, MemoryLockBackend};

/// Mode of an advisory byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeLock {
    Read,
    Write,
}

/// A non-blocking byte-range lock primitive bound to one lock owner.
///
/// Locks held by the same owner never conflict with each other; re-locking a
/// range the owner already holds replaces the mode, as `fcntl` does.
pub trait LockBackend: Send + Sync + fmt::Debug {
    /// Try to lock `len` bytes at `start` without blocking.
    ///
    /// Contention is reported as an `io::Error` whose errno (or
    /// `WouldBlock` kind) [`VfsError::from_lock_error`] maps to `Busy`.
    fn try_lock(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<()>;

    /// Release `len` bytes at `start`. Releasing an unheld range succeeds.
    fn unlock(&self, start: u64, len: u64) -> io::Result<()>;

    /// Report the mode of a lock held by another owner that would conflict
    /// with `kind` on the range, without acquiring anything.
    fn conflicting(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<Option<RangeLock>>;
}

/// Backends the host can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Open-file-description locks (`F_OFD_SETLK`), owned per descriptor.
    OpenFileDescription,
    /// Classic POSIX record locks (`F_SETLK`), owned per process.
    Posix,
    /// In-process lock table; no OS involvement.
    InProcess,
}

/// The backend selected for files on this host. Decided at compile time, so
/// it is effectively chosen once per process.
#[must_use]
pub const fn default_backend_kind() -> BackendKind {
    if cfg!(any(target_os = "linux", target_os = "android")) {
        BackendKind::OpenFileDescription
    } else if cfg!(unix) {
        BackendKind::Posix
    } else {
        BackendKind::InProcess
    }
}

/// Lock a range, retrying every millisecond while it is contended until
/// `timeout` has elapsed.
///
/// A zero timeout makes exactly one attempt. Errors other than contention are
/// returned immediately, translated with `io_kind`.
pub fn lock_with_timeout(
    backend: &dyn LockBackend,
    kind: RangeLock,
    start: u64,
    len: u64,
    timeout: Duration,
    io_kind: IoErrorKind,
) -> Result<()> {
    let started = Instant::now();
    loop {
        match backend.try_lock(kind, start, len) {
            Ok(()) => return Ok(()),
            Err(e) => {
                let err = VfsError::from_lock_error(e, io_kind);
                if !err.is_transient() || started.elapsed() >= timeout {
                    return Err(err);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Error returned by in-process backends on contention.
pub(crate) fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backend_kind() {
        let kind = default_backend_kind();
        if cfg!(target_os = "linux") {
            assert_eq!(kind, BackendKind::OpenFileDescription);
        }
        #[cfg(not(unix))]
        assert_eq!(kind, BackendKind::InProcess);
    }

    #[test]
    fn test_lock_with_timeout_gives_up() {
        let table = ByteLockTable::new();
        let a = MemoryLockBackend::new(table.clone());
        let b = MemoryLockBackend::new(table);
        a.try_lock(RangeLock::Write, 10, 1).unwrap();

        let start = Instant::now();
        let err = lock_with_timeout(
            &b,
            RangeLock::Read,
            10,
            1,
            Duration::from_millis(20),
            IoErrorKind::Lock,
        )
        .unwrap_err();
        assert!(matches!(err, VfsError::Busy));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_lock_with_timeout_succeeds_after_release() {
        let table = ByteLockTable::new();
        let a = MemoryLockBackend::new(table.clone());
        let b = MemoryLockBackend::new(table);
        a.try_lock(RangeLock::Write, 0, 4).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            a.unlock(0, 4).unwrap();
        });
        lock_with_timeout(
            &b,
            RangeLock::Write,
            0,
            4,
            Duration::from_secs(5),
            IoErrorKind::Lock,
        )
        .unwrap();
        releaser.join().unwrap();
    }
}
