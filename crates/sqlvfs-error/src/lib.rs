use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for sqlvfs operations.
///
/// Modeled after SQLite's VFS result codes: every variant maps onto a primary
/// [`ErrorCode`] and, for I/O failures, onto an extended subcode carried by
/// [`IoErrorKind`]. Lock contention is always [`VfsError::Busy`] so callers can
/// tell retryable conditions from hard failures.
#[derive(Error, Debug)]
pub enum VfsError {
    // === Locking ===
    /// Lock contention: another handle or process holds a conflicting lock.
    #[error("database is busy")]
    Busy,

    /// The OS refused the lock or access for permission reasons.
    #[error("access permission denied")]
    Permission,

    /// Attempt to take a write lock on, or initialize shared memory for, a
    /// read-only file.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// Downgrading EXCLUSIVE back to SHARED failed.
    ///
    /// Another process is not following the locking protocol; the handle's
    /// lock state can no longer be trusted.
    #[error("lock integrity failure: {detail}")]
    LockIntegrity { detail: String },

    // === I/O ===
    /// OS-level I/O failure, tagged with the operation that failed.
    #[error("disk I/O error ({kind}): {source}")]
    Io {
        kind: IoErrorKind,
        #[source]
        source: io::Error,
    },

    /// Fewer bytes than requested were available; the tail was zero-filled.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// A page checksum did not match its trailer.
    #[error("page checksum mismatch at offset {offset} ({len} bytes)")]
    DataCorruption { offset: u64, len: usize },

    // === Open ===
    /// Cannot open file.
    #[error("unable to open database file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// The path names a directory.
    #[error("unable to open database file, is a directory: '{path}'")]
    CannotOpenIsDirectory { path: PathBuf },

    /// The path could not be resolved to an absolute path.
    #[error("unable to resolve full path: '{path}'")]
    CannotOpenFullPath { path: PathBuf },

    // === Capabilities ===
    /// Capability absent on this file or backend.
    #[error("operation not supported")]
    NotSupported,

    /// Unrecognized pragma or file control.
    #[error("not found")]
    NotFound,

    // === Programming errors ===
    /// A caller broke a documented precondition (illegal lock transition,
    /// malformed shm lock request, misaligned checksum input).
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Operation that produced an [`VfsError::Io`] error.
///
/// Each kind corresponds to one SQLite `SQLITE_IOERR_*` extended code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoErrorKind {
    Other,
    Read,
    ShortRead,
    Write,
    Fsync,
    DirFsync,
    Truncate,
    Fstat,
    Unlock,
    RdLock,
    Delete,
    Access,
    CheckReservedLock,
    Lock,
    Close,
    ShmOpen,
    ShmSize,
    ShmLock,
    ShmMap,
    Seek,
    DeleteNoent,
    GetTempPath,
    BeginAtomic,
    CommitAtomic,
    RollbackAtomic,
    Data,
}

impl IoErrorKind {
    /// The extended-code subcode (the value shifted left by 8 and or-ed with
    /// `SQLITE_IOERR`).
    #[must_use]
    pub const fn subcode(self) -> i32 {
        match self {
            Self::Other => 0,
            Self::Read => 1,
            Self::ShortRead => 2,
            Self::Write => 3,
            Self::Fsync => 4,
            Self::DirFsync => 5,
            Self::Truncate => 6,
            Self::Fstat => 7,
            Self::Unlock => 8,
            Self::RdLock => 9,
            Self::Delete => 10,
            Self::Access => 13,
            Self::CheckReservedLock => 14,
            Self::Lock => 15,
            Self::Close => 16,
            Self::ShmOpen => 18,
            Self::ShmSize => 19,
            Self::ShmLock => 20,
            Self::ShmMap => 21,
            Self::Seek => 22,
            Self::DeleteNoent => 23,
            Self::GetTempPath => 25,
            Self::BeginAtomic => 29,
            Self::CommitAtomic => 30,
            Self::RollbackAtomic => 31,
            Self::Data => 32,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Other => "io",
            Self::Read => "read",
            Self::ShortRead => "short read",
            Self::Write => "write",
            Self::Fsync => "fsync",
            Self::DirFsync => "dir fsync",
            Self::Truncate => "truncate",
            Self::Fstat => "fstat",
            Self::Unlock => "unlock",
            Self::RdLock => "rdlock",
            Self::Delete => "delete",
            Self::Access => "access",
            Self::CheckReservedLock => "check reserved lock",
            Self::Lock => "lock",
            Self::Close => "close",
            Self::ShmOpen => "shm open",
            Self::ShmSize => "shm size",
            Self::ShmLock => "shm lock",
            Self::ShmMap => "shm map",
            Self::Seek => "seek",
            Self::DeleteNoent => "delete noent",
            Self::GetTempPath => "temp path",
            Self::BeginAtomic => "begin atomic",
            Self::CommitAtomic => "commit atomic",
            Self::RollbackAtomic => "rollback atomic",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQLite primary result codes used by the VFS layer.
///
/// These match the numeric values from C SQLite's `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Internal logic error.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Database file is locked.
    Busy = 5,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Disk I/O error.
    IoErr = 10,
    /// Not found (unknown file control or pragma).
    NotFound = 12,
    /// Unable to open database file.
    CantOpen = 14,
    /// Library used incorrectly.
    Misuse = 21,
}

const CANTOPEN_ISDIR_SUBCODE: i32 = 2;
const CANTOPEN_FULLPATH_SUBCODE: i32 = 3;

impl VfsError {
    /// Map this error to its primary SQLite error code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Busy => ErrorCode::Busy,
            Self::Permission => ErrorCode::Perm,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::LockIntegrity { .. }
            | Self::Io { .. }
            | Self::ShortRead { .. }
            | Self::DataCorruption { .. } => ErrorCode::IoErr,
            Self::CannotOpen { .. }
            | Self::CannotOpenIsDirectory { .. }
            | Self::CannotOpenFullPath { .. } => ErrorCode::CantOpen,
            Self::NotSupported | Self::NotFound => ErrorCode::NotFound,
            Self::PreconditionViolation(_) => ErrorCode::Misuse,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The extended result code (`primary | subcode << 8`).
    #[must_use]
    pub const fn extended_code(&self) -> i32 {
        let primary = self.error_code() as i32;
        let sub = match self {
            Self::Io { kind, .. } => kind.subcode(),
            Self::LockIntegrity { .. } => IoErrorKind::RdLock.subcode(),
            Self::ShortRead { .. } => IoErrorKind::ShortRead.subcode(),
            Self::DataCorruption { .. } => IoErrorKind::Data.subcode(),
            Self::CannotOpenIsDirectory { .. } => CANTOPEN_ISDIR_SUBCODE,
            Self::CannotOpenFullPath { .. } => CANTOPEN_FULLPATH_SUBCODE,
            _ => 0,
        };
        primary | (sub << 8)
    }

    /// The I/O subcode kind, if this is an I/O-class error.
    #[must_use]
    pub const fn io_kind(&self) -> Option<IoErrorKind> {
        match self {
            Self::Io { kind, .. } => Some(*kind),
            Self::LockIntegrity { .. } => Some(IoErrorKind::RdLock),
            Self::ShortRead { .. } => Some(IoErrorKind::ShortRead),
            Self::DataCorruption { .. } => Some(IoErrorKind::Data),
            _ => None,
        }
    }

    /// Whether the caller may retry the whole operation.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// Whether the error invalidates the current read or lock state and must
    /// propagate to the engine uncaught.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DataCorruption { .. } | Self::LockIntegrity { .. } | Self::Internal(_)
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy => Some("Retry the transaction after a short delay"),
            Self::ReadOnly => Some("Reopen the database read-write"),
            Self::DataCorruption { .. } => {
                Some("Restore the database from a backup; a page failed checksum verification")
            }
            Self::LockIntegrity { .. } => {
                Some("Another process is violating the locking protocol; close all connections")
            }
            Self::PreconditionViolation(_) => Some("This is a bug in the calling code"),
            _ => None,
        }
    }

    /// Wrap an OS error with the operation that produced it.
    pub fn io(kind: IoErrorKind, source: io::Error) -> Self {
        Self::Io { kind, source }
    }

    /// Translate an OS error raised by a byte-range lock call.
    ///
    /// Contention (`EACCES`, `EAGAIN`, `EBUSY`, `EINTR`, `ENOLCK`, `EDEADLK`,
    /// `ETIMEDOUT`, `EWOULDBLOCK`) becomes [`VfsError::Busy`]; `EPERM` becomes
    /// [`VfsError::Permission`]; anything else keeps `kind`.
    #[allow(unreachable_patterns)]
    pub fn from_lock_error(source: io::Error, kind: IoErrorKind) -> Self {
        #[cfg(unix)]
        if let Some(errno) = source.raw_os_error() {
            match errno {
                libc::EACCES
                | libc::EAGAIN
                | libc::EWOULDBLOCK
                | libc::EBUSY
                | libc::EINTR
                | libc::ENOLCK
                | libc::EDEADLK
                | libc::ETIMEDOUT => return Self::Busy,
                libc::EPERM => return Self::Permission,
                _ => return Self::Io { kind, source },
            }
        }
        match source.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Self::Busy
            }
            _ => Self::Io { kind, source },
        }
    }

    /// Create a precondition violation.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolation(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<io::Error> for VfsError {
    fn from(source: io::Error) -> Self {
        Self::Io {
            kind: IoErrorKind::Other,
            source,
        }
    }
}

/// Result type alias using `VfsError`.
pub type Result<T> = std::result::Result<T, VfsError>;
