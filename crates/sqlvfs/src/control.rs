//! File-control dispatch.
//!
//! Engines drive optional per-file behaviour through a small set of opcodes.
//! Opcodes a file has no support for answer [`VfsError::NotFound`], except
//! the batch-atomic-write opcodes, which answer [`VfsError::NotSupported`].

use std::time::Duration;

use sqlvfs_error::{IoErrorKind, Result, VfsError};
use sqlvfs_types::LockLevel;
use tracing::debug;

use crate::traits::{BatchAtomicWrite, VfsFile};

/// A file-control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl<'a> {
    /// Report the handle's lock level.
    LockState,
    /// Replace the lock timeout; answers the previous one.
    LockTimeout(Duration),
    /// `Some` sets the flag; both forms answer the current value.
    PowersafeOverwrite(Option<bool>),
    PersistWal(Option<bool>),
    /// The file is about to grow to this many bytes.
    SizeHint(u64),
    HasMoved,
    BeginAtomicWrite,
    CommitAtomicWrite,
    RollbackAtomicWrite,
    /// The journal is finalized; complete the commit.
    CommitPhaseTwo,
    CheckpointStart,
    CheckpointDone,
    Pragma {
        name: &'a str,
        value: Option<&'a str>,
    },
}

/// The answer to a [`FileControl`] request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Done,
    LockState(LockLevel),
    LockTimeout(Duration),
    Flag(bool),
    Pragma(Option<String>),
}

/// Errors from a batch operation are reported under the batch's own subcode.
fn atomic_error(err: VfsError, kind: IoErrorKind) -> VfsError {
    match err {
        VfsError::Io { source, .. } => VfsError::io(kind, source),
        other => other,
    }
}

fn batch<F: VfsFile + ?Sized>(file: &mut F) -> Result<&mut dyn BatchAtomicWrite> {
    file.batch_atomic_write().ok_or(VfsError::NotSupported)
}

/// Apply `op` to `file`.
pub fn file_control<F: VfsFile + ?Sized>(file: &mut F, op: FileControl<'_>) -> Result<ControlResponse> {
    debug!(target: "sqlvfs::control", ?op, "file control");
    match op {
        FileControl::LockState => Ok(ControlResponse::LockState(file.lock_state())),
        FileControl::LockTimeout(timeout) => file
            .set_lock_timeout(timeout)
            .map(ControlResponse::LockTimeout)
            .ok_or(VfsError::NotFound),
        FileControl::PowersafeOverwrite(value) => {
            if let Some(on) = value {
                file.set_powersafe_overwrite(on)?;
            }
            file.powersafe_overwrite()
                .map(ControlResponse::Flag)
                .ok_or(VfsError::NotFound)
        }
        FileControl::PersistWal(value) => {
            if let Some(on) = value {
                file.set_persist_wal(on)?;
            }
            file.persist_wal()
                .map(ControlResponse::Flag)
                .ok_or(VfsError::NotFound)
        }
        FileControl::SizeHint(size) => {
            file.size_hint(size)?;
            Ok(ControlResponse::Done)
        }
        FileControl::HasMoved => file.has_moved().map(ControlResponse::Flag),
        FileControl::BeginAtomicWrite => {
            batch(file)?
                .begin_atomic_write()
                .map_err(|e| atomic_error(e, IoErrorKind::BeginAtomic))?;
            Ok(ControlResponse::Done)
        }
        FileControl::CommitAtomicWrite => {
            batch(file)?
                .commit_atomic_write()
                .map_err(|e| atomic_error(e, IoErrorKind::CommitAtomic))?;
            Ok(ControlResponse::Done)
        }
        FileControl::RollbackAtomicWrite => {
            batch(file)?
                .rollback_atomic_write()
                .map_err(|e| atomic_error(e, IoErrorKind::RollbackAtomic))?;
            Ok(ControlResponse::Done)
        }
        FileControl::CommitPhaseTwo => {
            file.commit_phase_two()?;
            Ok(ControlResponse::Done)
        }
        FileControl::CheckpointStart => {
            file.checkpoint_start();
            Ok(ControlResponse::Done)
        }
        FileControl::CheckpointDone => {
            file.checkpoint_done();
            Ok(ControlResponse::Done)
        }
        FileControl::Pragma { name, value } => file.pragma(name, value).map(ControlResponse::Pragma),
    }
}
