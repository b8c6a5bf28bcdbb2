use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use nix::fcntl::{FcntlArg, fcntl};

use super::{BackendKind, LockBackend, RangeLock, default_backend_kind};

/// `fcntl` record locks on a shared descriptor.
///
/// On Linux this uses open-file-description locks, so two descriptors opened
/// separately on the same file conflict even inside one process. Elsewhere it
/// falls back to per-process POSIX locks.
#[derive(Debug, Clone)]
pub struct FcntlBackend {
    file: Arc<File>,
    kind: BackendKind,
}

impl FcntlBackend {
    #[must_use]
    pub fn new(file: Arc<File>) -> Self {
        Self {
            file,
            kind: default_backend_kind(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    fn set(&self, flock: &libc::flock) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let arg = match self.kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::OpenFileDescription => FcntlArg::F_OFD_SETLK(flock),
            _ => FcntlArg::F_SETLK(flock),
        };
        fcntl(fd, arg).map(drop).map_err(io::Error::from)
    }

    fn get(&self, flock: &mut libc::flock) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let arg = match self.kind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::OpenFileDescription => FcntlArg::F_OFD_GETLK(flock),
            _ => FcntlArg::F_GETLK(flock),
        };
        fcntl(fd, arg).map(drop).map_err(io::Error::from)
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn make_flock(l_type: libc::c_int, start: u64, len: u64) -> libc::flock {
    libc::flock {
        l_type: l_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    }
}

const fn lock_type(kind: RangeLock) -> libc::c_int {
    match kind {
        RangeLock::Read => libc::F_RDLCK,
        RangeLock::Write => libc::F_WRLCK,
    }
}

impl LockBackend for FcntlBackend {
    fn try_lock(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<()> {
        self.set(&make_flock(lock_type(kind), start, len))
    }

    fn unlock(&self, start: u64, len: u64) -> io::Result<()> {
        self.set(&make_flock(libc::F_UNLCK, start, len))
    }

    fn conflicting(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<Option<RangeLock>> {
        let mut flock = make_flock(lock_type(kind), start, len);
        self.get(&mut flock)?;
        Ok(match libc::c_int::from(flock.l_type) {
            libc::F_RDLCK => Some(RangeLock::Read),
            libc::F_WRLCK => Some(RangeLock::Write),
            _ => None,
        })
    }
}
