//! Five-level advisory locking over byte ranges.
//!
//! **Lock hierarchy:** `None < Shared < Reserved < Pending < Exclusive`
//!
//! **Lock byte ranges (at the 1 GiB boundary):**
//! - `PENDING_BYTE`  = `0x4000_0000` (1 byte)
//! - `RESERVED_BYTE` = `0x4000_0001` (1 byte)
//! - `SHARED_FIRST`  = `0x4000_0002` (510 bytes)
//!
//! Handles that share one OS lock owner (all handles on one inode in a
//! process, for the Unix VFS) also share an [`OwnerState`]. The owner's level
//! is the strongest lock any of those handles holds; a handle whose own level
//! lags behind it is refused anything that would need the OS locks to change.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlvfs_error::{IoErrorKind, Result, VfsError};
use sqlvfs_types::{LockLevel, PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};
use tracing::{debug, warn};

use crate::backend::{LockBackend, RangeLock, lock_with_timeout};

/// Lock state of one OS lock owner, shared by the handles that use it.
#[derive(Debug, Default)]
pub struct OwnerState {
    level: LockLevel,
    n_shared: u32,
}

impl OwnerState {
    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    /// Handles of this owner that hold at least SHARED.
    #[must_use]
    pub const fn shared_holders(&self) -> u32 {
        self.n_shared
    }
}

pub type SharedOwner = Arc<Mutex<OwnerState>>;

/// The per-handle view of the lock protocol.
#[derive(Debug)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    owner: SharedOwner,
    level: LockLevel,
    readonly: bool,
    timeout: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, owner: SharedOwner, readonly: bool) -> Self {
        Self {
            backend,
            owner,
            level: LockLevel::None,
            readonly,
            timeout: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The level this handle holds.
    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the lock timeout, returning the previous one.
    pub fn set_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.timeout, timeout)
    }

    #[must_use]
    pub fn owner_level(&self) -> LockLevel {
        self.owner.lock().level
    }

    fn check_transition(&self, requested: LockLevel) -> Result<()> {
        let legal = match requested {
            LockLevel::Shared => self.level == LockLevel::None,
            LockLevel::Reserved => self.level == LockLevel::Shared,
            LockLevel::Exclusive => self.level >= LockLevel::Shared,
            LockLevel::None | LockLevel::Pending => false,
        };
        if legal {
            Ok(())
        } else {
            Err(VfsError::precondition(format!(
                "illegal lock transition {} -> {requested}",
                self.level
            )))
        }
    }

    /// Raise this handle's lock to `requested`.
    ///
    /// A failed EXCLUSIVE request leaves the handle at PENDING when the
    /// pending byte was acquired.
    #[allow(clippy::significant_drop_tightening)]
    pub fn lock(&mut self, requested: LockLevel) -> Result<()> {
        if self.level >= requested {
            return Ok(());
        }
        self.check_transition(requested)?;
        if requested > LockLevel::Shared && self.readonly {
            return Err(VfsError::ReadOnly);
        }

        let mut owner = self.owner.lock();

        if self.level != owner.level
            && (owner.level >= LockLevel::Pending || requested > LockLevel::Shared)
        {
            return Err(VfsError::Busy);
        }

        if requested == LockLevel::Shared
            && matches!(owner.level, LockLevel::Shared | LockLevel::Reserved)
        {
            owner.n_shared += 1;
            self.level = LockLevel::Shared;
            return Ok(());
        }

        match requested {
            LockLevel::Shared => {
                self.acquire_shared()?;
                owner.n_shared = 1;
            }
            LockLevel::Reserved => {
                self.backend
                    .try_lock(RangeLock::Write, RESERVED_BYTE, 1)
                    .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::Lock))?;
            }
            _ => {
                if self.level < LockLevel::Pending {
                    self.backend
                        .try_lock(RangeLock::Write, PENDING_BYTE, 1)
                        .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::Lock))?;
                    self.level = LockLevel::Pending;
                    owner.level = LockLevel::Pending;
                }
                if owner.n_shared > 1 {
                    return Err(VfsError::Busy);
                }
                lock_with_timeout(
                    self.backend.as_ref(),
                    RangeLock::Write,
                    SHARED_FIRST,
                    SHARED_SIZE,
                    self.timeout,
                    IoErrorKind::Lock,
                )?;
            }
        }

        debug!(
            target: "sqlvfs::lock",
            from = %self.level,
            to = %requested,
            "lock acquired"
        );
        self.level = requested;
        owner.level = requested;
        Ok(())
    }

    /// Take the pending byte, take the shared range, release the pending byte.
    fn acquire_shared(&self) -> Result<()> {
        self.backend
            .try_lock(RangeLock::Read, PENDING_BYTE, 1)
            .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::Lock))?;

        let shared = lock_with_timeout(
            self.backend.as_ref(),
            RangeLock::Read,
            SHARED_FIRST,
            SHARED_SIZE,
            self.timeout,
            IoErrorKind::Lock,
        );
        let released = self.backend.unlock(PENDING_BYTE, 1);
        shared?;
        if let Err(e) = released {
            drop(self.backend.unlock(SHARED_FIRST, SHARED_SIZE));
            return Err(VfsError::io(IoErrorKind::Unlock, e));
        }
        Ok(())
    }

    /// Lower this handle's lock to `target` (`None` or `Shared`).
    #[allow(clippy::significant_drop_tightening)]
    pub fn unlock(&mut self, target: LockLevel) -> Result<()> {
        if !matches!(target, LockLevel::None | LockLevel::Shared) {
            return Err(VfsError::precondition(format!(
                "cannot unlock to {target}"
            )));
        }
        if self.level <= target {
            return Ok(());
        }

        let mut owner = self.owner.lock();

        if self.level > LockLevel::Shared {
            if target == LockLevel::Shared {
                if let Err(e) = self
                    .backend
                    .try_lock(RangeLock::Read, SHARED_FIRST, SHARED_SIZE)
                {
                    warn!(
                        target: "sqlvfs::lock",
                        from = %self.level,
                        error = %e,
                        "downgrade to shared failed"
                    );
                    return Err(VfsError::LockIntegrity {
                        detail: format!("downgrade from {} to SHARED failed: {e}", self.level),
                    });
                }
            }
            self.backend
                .unlock(PENDING_BYTE, 2)
                .map_err(|e| VfsError::io(IoErrorKind::Unlock, e))?;
            owner.level = LockLevel::Shared;
        }

        if target == LockLevel::None {
            owner.n_shared = owner.n_shared.saturating_sub(1);
            if owner.n_shared == 0 {
                self.backend
                    .unlock(SHARED_FIRST, SHARED_SIZE)
                    .map_err(|e| VfsError::io(IoErrorKind::Unlock, e))?;
                owner.level = LockLevel::None;
            }
        }

        debug!(
            target: "sqlvfs::lock",
            from = %self.level,
            to = %target,
            "lock released"
        );
        self.level = target;
        Ok(())
    }

    /// Whether some handle holds RESERVED or higher.
    ///
    /// Answered locally when this handle or its owner already holds
    /// RESERVED+, otherwise by probing the reserved byte.
    pub fn check_reserved(&self) -> Result<bool> {
        if self.level >= LockLevel::Reserved || self.owner.lock().level >= LockLevel::Reserved {
            return Ok(true);
        }
        let holder = self
            .backend
            .conflicting(RangeLock::Write, RESERVED_BYTE, 1)
            .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::CheckReservedLock))?;
        Ok(holder.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ByteLockTable, MemoryLockBackend};

    /// A handle that behaves as its own process.
    fn process(table: &ByteLockTable) -> LockManager {
        LockManager::new(
            Arc::new(MemoryLockBackend::new(table.clone())),
            SharedOwner::default(),
            false,
        )
    }

    /// Two handles sharing one OS owner, as two connections in one process do.
    fn same_process(table: &ByteLockTable) -> (LockManager, LockManager) {
        let backend: Arc<dyn LockBackend> = Arc::new(MemoryLockBackend::new(table.clone()));
        let owner = SharedOwner::default();
        (
            LockManager::new(Arc::clone(&backend), Arc::clone(&owner), false),
            LockManager::new(backend, owner, false),
        )
    }

    #[test]
    fn test_lock_escalation_and_release() {
        let table = ByteLockTable::new();
        let mut h = process(&table);
        h.lock(LockLevel::Shared).unwrap();
        h.lock(LockLevel::Reserved).unwrap();
        h.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(h.level(), LockLevel::Exclusive);
        h.unlock(LockLevel::Shared).unwrap();
        assert_eq!(h.level(), LockLevel::Shared);
        h.unlock(LockLevel::None).unwrap();
        assert_eq!(h.level(), LockLevel::None);
        assert_eq!(table.held_ranges(), 0);
    }

    #[test]
    fn test_illegal_transitions() {
        let table = ByteLockTable::new();
        let mut h = process(&table);
        for bad in [LockLevel::Reserved, LockLevel::Exclusive, LockLevel::Pending] {
            let err = h.lock(bad).unwrap_err();
            assert!(matches!(err, VfsError::PreconditionViolation(_)), "{bad}");
        }
        h.lock(LockLevel::Shared).unwrap();
        assert!(matches!(
            h.lock(LockLevel::Pending).unwrap_err(),
            VfsError::PreconditionViolation(_)
        ));
        assert!(matches!(
            h.unlock(LockLevel::Reserved).unwrap_err(),
            VfsError::PreconditionViolation(_)
        ));
    }

    #[test]
    fn test_lock_at_or_below_current_is_noop() {
        let table = ByteLockTable::new();
        let mut h = process(&table);
        h.lock(LockLevel::Shared).unwrap();
        h.lock(LockLevel::Reserved).unwrap();
        h.lock(LockLevel::Shared).unwrap();
        assert_eq!(h.level(), LockLevel::Reserved);
        h.unlock(LockLevel::Shared).unwrap();
        h.unlock(LockLevel::Shared).unwrap();
        assert_eq!(h.level(), LockLevel::Shared);
    }

    #[test]
    fn test_readonly_refuses_write_locks() {
        let table = ByteLockTable::new();
        let mut h = LockManager::new(
            Arc::new(MemoryLockBackend::new(table)),
            SharedOwner::default(),
            true,
        );
        h.lock(LockLevel::Shared).unwrap();
        assert!(matches!(
            h.lock(LockLevel::Reserved).unwrap_err(),
            VfsError::ReadOnly
        ));
        assert!(matches!(
            h.lock(LockLevel::Exclusive).unwrap_err(),
            VfsError::ReadOnly
        ));
    }

    #[test]
    fn test_processes_share_and_contend_reserved() {
        let table = ByteLockTable::new();
        let mut a = process(&table);
        let mut b = process(&table);
        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        assert!(matches!(
            b.lock(LockLevel::Reserved).unwrap_err(),
            VfsError::Busy
        ));
        assert!(b.check_reserved().unwrap());
        assert!(a.check_reserved().unwrap());
    }

    #[test]
    fn test_pending_blocks_new_readers() {
        let table = ByteLockTable::new();
        let mut writer = process(&table);
        let mut reader = process(&table);
        let mut late = process(&table);
        writer.lock(LockLevel::Shared).unwrap();
        reader.lock(LockLevel::Shared).unwrap();

        let err = writer.lock(LockLevel::Exclusive).unwrap_err();
        assert!(matches!(err, VfsError::Busy));
        assert_eq!(writer.level(), LockLevel::Pending);

        assert!(matches!(
            late.lock(LockLevel::Shared).unwrap_err(),
            VfsError::Busy
        ));

        reader.unlock(LockLevel::None).unwrap();
        writer.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(writer.level(), LockLevel::Exclusive);
    }

    #[test]
    fn test_exclusive_round_trip() {
        let table = ByteLockTable::new();
        let mut h = process(&table);
        h.lock(LockLevel::Shared).unwrap();
        h.lock(LockLevel::Exclusive).unwrap();
        h.unlock(LockLevel::Shared).unwrap();
        h.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(h.level(), LockLevel::Exclusive);

        let mut other = process(&table);
        assert!(matches!(
            other.lock(LockLevel::Shared).unwrap_err(),
            VfsError::Busy
        ));
    }

    #[test]
    fn test_exclusive_waits_for_reader_within_timeout() {
        let table = ByteLockTable::new();
        let mut writer = process(&table).with_timeout(Duration::from_secs(5));
        let mut reader = process(&table);
        writer.lock(LockLevel::Shared).unwrap();
        reader.lock(LockLevel::Shared).unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            reader.unlock(LockLevel::None).unwrap();
        });
        writer.lock(LockLevel::Exclusive).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_same_process_handles_piggyback_shared() {
        let table = ByteLockTable::new();
        let (mut a, mut b) = same_process(&table);
        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();

        a.lock(LockLevel::Reserved).unwrap();
        assert!(matches!(
            b.lock(LockLevel::Reserved).unwrap_err(),
            VfsError::Busy
        ));
        assert!(b.check_reserved().unwrap());

        // Other in-process readers keep EXCLUSIVE out.
        assert!(matches!(
            a.lock(LockLevel::Exclusive).unwrap_err(),
            VfsError::Busy
        ));
        assert_eq!(a.level(), LockLevel::Pending);

        b.unlock(LockLevel::None).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();
        a.unlock(LockLevel::None).unwrap();
        assert_eq!(a.owner_level(), LockLevel::None);
        assert_eq!(table.held_ranges(), 0);
    }

    #[test]
    fn test_last_shared_holder_releases_range() {
        let table = ByteLockTable::new();
        let (mut a, mut b) = same_process(&table);
        let mut other = process(&table);
        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        a.unlock(LockLevel::None).unwrap();

        other.lock(LockLevel::Shared).unwrap();
        assert!(matches!(
            other.lock(LockLevel::Exclusive).unwrap_err(),
            VfsError::Busy
        ));
        other.unlock(LockLevel::None).unwrap();

        b.unlock(LockLevel::None).unwrap();
        other.lock(LockLevel::Shared).unwrap();
        other.lock(LockLevel::Exclusive).unwrap();
    }

    #[test]
    fn test_set_timeout_returns_previous() {
        let table = ByteLockTable::new();
        let mut h = process(&table);
        assert_eq!(h.set_timeout(Duration::from_millis(7)), Duration::ZERO);
        assert_eq!(h.set_timeout(Duration::ZERO), Duration::from_millis(7));
    }
}
