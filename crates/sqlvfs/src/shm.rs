//! WAL-index shared memory: region handles and slot locks.
//!
//! Backends ([`crate::unix`], [`crate::memory`]) own the storage and the
//! per-database node; the lock-slot bookkeeping and region handle here are
//! shared by both.

use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use memmap2::{Mmap, MmapMut};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use sqlvfs_error::{IoErrorKind, Result, VfsError};
use sqlvfs_types::{SHM_BASE, SHM_NLOCK, ShmLockFlags};

use crate::backend::{LockBackend, RangeLock};

/// Access to the WAL index of an open database file.
///
/// Obtained from `VfsFile::shared_memory`. Each file handle is one shm
/// instance; instances on the same database share regions and slot counters.
pub trait SharedMemory: Send {
    /// Map region `region` of `size` bytes.
    ///
    /// Returns `Ok(None)` when the backing store is too short and `extend` is
    /// false.
    fn shm_map(&mut self, region: u32, size: usize, extend: bool) -> Result<Option<ShmRegion>>;

    /// Lock or unlock `n` slots starting at `offset`.
    fn shm_lock(&mut self, offset: usize, n: usize, flags: ShmLockFlags) -> Result<()>;

    /// Make writes to mapped regions visible before subsequent reads.
    fn shm_barrier(&self);

    /// Release this instance's slots and regions. The last instance on a
    /// database closes the backing store and, if `delete`, removes it.
    fn shm_unmap(&mut self, delete: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Region handle
// ---------------------------------------------------------------------------

enum Backing {
    Heap(Vec<u8>),
    Mapped(MmapMut),
    MappedReadOnly(Mmap),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(v) => v.as_slice(),
            Self::Mapped(m) => &m[..],
            Self::MappedReadOnly(m) => &m[..],
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Heap(v) => Some(v.as_mut_slice()),
            Self::Mapped(m) => Some(&mut m[..]),
            Self::MappedReadOnly(_) => None,
        }
    }
}

/// A handle to a mapped shared-memory region.
///
/// Cloning is cheap; clones refer to the same bytes. Regions backed by a
/// read-only mapping refuse mutable access with [`VfsError::ReadOnly`].
#[derive(Clone)]
pub struct ShmRegion {
    len: usize,
    writable: bool,
    data: Arc<Mutex<Backing>>,
}

impl fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegion")
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl ShmRegion {
    /// Create a new zeroed heap region of the given size.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::wrap(data.len(), true, Backing::Heap(data))
    }

    pub(crate) fn from_mmap(map: MmapMut) -> Self {
        Self::wrap(map.len(), true, Backing::Mapped(map))
    }

    pub(crate) fn from_mmap_read_only(map: Mmap) -> Self {
        Self::wrap(map.len(), false, Backing::MappedReadOnly(map))
    }

    fn wrap(len: usize, writable: bool, backing: Backing) -> Self {
        Self {
            len,
            writable,
            data: Arc::new(Mutex::new(backing)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether two handles refer to the same bytes.
    #[must_use]
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Borrow the region as a byte slice.
    #[must_use]
    pub fn lock(&self) -> ShmRegionGuard<'_> {
        ShmRegionGuard {
            guard: self.data.lock(),
        }
    }

    /// Borrow the region mutably.
    pub fn lock_mut(&self) -> Result<MappedMutexGuard<'_, [u8]>> {
        MutexGuard::try_map(self.data.lock(), Backing::as_mut_slice)
            .map_err(|_| VfsError::ReadOnly)
    }

    /// Read a little-endian `u32` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > self.len()`.
    #[must_use]
    pub fn read_u32_le(&self, offset: usize) -> u32 {
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(&self.lock()[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Write a little-endian `u32` at the given byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4 > self.len()`.
    pub fn write_u32_le(&self, offset: usize, val: u32) -> Result<()> {
        self.lock_mut()?[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if `offset + 8 > self.len()`.
    #[must_use]
    pub fn read_u64_le(&self, offset: usize) -> u64 {
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&self.lock()[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    /// # Panics
    ///
    /// Panics if `offset + 8 > self.len()`.
    pub fn write_u64_le(&self, offset: usize, val: u64) -> Result<()> {
        self.lock_mut()?[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }
}

/// Locked read access to a region.
pub struct ShmRegionGuard<'a> {
    guard: MutexGuard<'a, Backing>,
}

impl Deref for ShmRegionGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

// ---------------------------------------------------------------------------
// Region sizing
// ---------------------------------------------------------------------------

/// The host's virtual memory page size.
#[must_use]
pub fn host_page_size() -> usize {
    #[cfg(unix)]
    {
        use nix::unistd::{SysconfVar, sysconf};
        if let Ok(Some(size)) = sysconf(SysconfVar::PAGE_SIZE) {
            if let Ok(size) = usize::try_from(size) {
                return size;
            }
        }
    }
    4096
}

/// Reject region sizes that are zero or not page multiples.
pub(crate) fn validate_region_size(size: usize) -> Result<()> {
    let page = host_page_size();
    if size == 0 || size % page != 0 {
        return Err(VfsError::io(
            IoErrorKind::ShmMap,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("region size {size} is not a multiple of the page size {page}"),
            ),
        ));
    }
    Ok(())
}

/// Full memory fence used by every backend's `shm_barrier`.
pub(crate) fn memory_barrier() {
    fence(Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Lock slots
// ---------------------------------------------------------------------------

/// Check the shape of a `shm_lock` request.
pub fn validate_shm_request(offset: usize, n: usize, flags: ShmLockFlags) -> Result<()> {
    if n == 0 || offset.checked_add(n).is_none_or(|end| end > SHM_NLOCK) {
        return Err(VfsError::precondition(format!(
            "shm lock range {offset}+{n} outside 0..{SHM_NLOCK}"
        )));
    }
    if !flags.is_well_formed() {
        return Err(VfsError::precondition(format!(
            "malformed shm lock flags {flags:?}"
        )));
    }
    if n != 1 && !flags.contains(ShmLockFlags::EXCLUSIVE) {
        return Err(VfsError::precondition(
            "multi-slot shm locks must be exclusive",
        ));
    }
    Ok(())
}

/// Slots held by one shm instance, as bitmasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeldSlots {
    shared: u16,
    exclusive: u16,
}

impl HeldSlots {
    pub(crate) const fn is_empty(self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }

    const fn holds(self, mask: u16) -> bool {
        (self.shared | self.exclusive) & mask != 0
    }
}

const fn slot_mask(offset: usize, n: usize) -> u16 {
    ((1_u16 << n) - 1) << offset
}

/// Per-database slot counters: `>0` shared holders, `-1` exclusive, `0` free.
///
/// OS byte locks at `SHM_BASE + slot` change only when a counter moves
/// between zero and non-zero, so other processes see one lock per slot
/// regardless of how many instances in this process share it.
#[derive(Debug, Default)]
pub(crate) struct ShmSlots {
    counts: [i32; SHM_NLOCK],
}

impl ShmSlots {
    pub(crate) fn count(&self, slot: usize) -> i32 {
        self.counts[slot]
    }

    /// Apply a validated lock request on behalf of the instance owning
    /// `held`.
    pub(crate) fn apply(
        &mut self,
        held: &mut HeldSlots,
        offset: usize,
        n: usize,
        flags: ShmLockFlags,
        os: Option<&dyn LockBackend>,
    ) -> Result<()> {
        validate_shm_request(offset, n, flags)?;
        let mask = slot_mask(offset, n);

        if flags.contains(ShmLockFlags::UNLOCK) {
            return self.release(held, mask, os);
        }

        if held.holds(mask) {
            return Err(VfsError::precondition(format!(
                "shm slots {offset}+{n} already held by this instance"
            )));
        }

        if flags.contains(ShmLockFlags::SHARED) {
            if self.counts[offset] < 0 {
                return Err(VfsError::Busy);
            }
            if self.counts[offset] == 0 {
                if let Some(os) = os {
                    os.try_lock(RangeLock::Read, SHM_BASE + offset as u64, 1)
                        .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::ShmLock))?;
                }
            }
            self.counts[offset] += 1;
            held.shared |= mask;
        } else {
            if self.counts[offset..offset + n].iter().any(|&c| c != 0) {
                return Err(VfsError::Busy);
            }
            if let Some(os) = os {
                os.try_lock(RangeLock::Write, SHM_BASE + offset as u64, n as u64)
                    .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::ShmLock))?;
            }
            self.counts[offset..offset + n].fill(-1);
            held.exclusive |= mask;
        }
        Ok(())
    }

    /// Release every slot in `mask` that `held` owns.
    pub(crate) fn release(
        &mut self,
        held: &mut HeldSlots,
        mask: u16,
        os: Option<&dyn LockBackend>,
    ) -> Result<()> {
        for slot in 0..SHM_NLOCK {
            let bit = 1_u16 << slot;
            if mask & bit == 0 {
                continue;
            }
            if held.exclusive & bit != 0 {
                self.counts[slot] = 0;
                held.exclusive &= !bit;
            } else if held.shared & bit != 0 {
                self.counts[slot] = (self.counts[slot] - 1).max(0);
                held.shared &= !bit;
            } else {
                continue;
            }
            if self.counts[slot] == 0 {
                if let Some(os) = os {
                    os.unlock(SHM_BASE + slot as u64, 1)
                        .map_err(|e| VfsError::io(IoErrorKind::ShmLock, e))?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn release_all(
        &mut self,
        held: &mut HeldSlots,
        os: Option<&dyn LockBackend>,
    ) -> Result<()> {
        self.release(held, slot_mask(0, SHM_NLOCK), os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ByteLockTable, MemoryLockBackend};

    #[test]
    fn test_shm_region_new_zeroed() {
        let region = ShmRegion::new(4096);
        assert_eq!(region.len(), 4096);
        assert!(region.is_writable());
        assert!(region.lock().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shm_region_read_write() {
        let region = ShmRegion::new(64);
        region.write_u32_le(0, 0xDEAD_BEEF).unwrap();
        region.write_u64_le(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(region.read_u32_le(0), 0xDEAD_BEEF);
        assert_eq!(region.read_u64_le(8), 0x0102_0304_0506_0708);

        let clone = region.clone();
        assert!(clone.same_region(&region));
        clone.lock_mut().unwrap()[20] = 7;
        assert_eq!(region.lock()[20], 7);
    }

    #[test]
    fn test_region_size_validation() {
        let page = host_page_size();
        validate_region_size(page).unwrap();
        validate_region_size(page * 8).unwrap();
        let err = validate_region_size(page + 1).unwrap_err();
        assert_eq!(err.io_kind(), Some(IoErrorKind::ShmMap));
        assert!(validate_region_size(0).is_err());
    }

    #[test]
    fn test_validate_shm_request() {
        validate_shm_request(0, 1, ShmLockFlags::LOCK_SHARED).unwrap();
        validate_shm_request(0, 8, ShmLockFlags::LOCK_EXCLUSIVE).unwrap();
        validate_shm_request(3, 5, ShmLockFlags::UNLOCK_EXCLUSIVE).unwrap();

        for (offset, n, flags) in [
            (0, 0, ShmLockFlags::LOCK_SHARED),
            (7, 2, ShmLockFlags::LOCK_EXCLUSIVE),
            (8, 1, ShmLockFlags::LOCK_SHARED),
            (0, 2, ShmLockFlags::LOCK_SHARED),
            (0, 1, ShmLockFlags::LOCK),
            (0, 1, ShmLockFlags::LOCK | ShmLockFlags::UNLOCK | ShmLockFlags::SHARED),
        ] {
            let err = validate_shm_request(offset, n, flags).unwrap_err();
            assert!(
                matches!(err, VfsError::PreconditionViolation(_)),
                "{offset}+{n} {flags:?}"
            );
        }
    }

    #[test]
    fn test_slots_shared_then_exclusive_busy() {
        let mut slots = ShmSlots::default();
        let mut a = HeldSlots::default();
        let mut b = HeldSlots::default();

        slots.apply(&mut a, 2, 1, ShmLockFlags::LOCK_SHARED, None).unwrap();
        assert_eq!(slots.count(2), 1);
        slots.apply(&mut b, 2, 1, ShmLockFlags::LOCK_SHARED, None).unwrap();
        assert_eq!(slots.count(2), 2);

        let mut c = HeldSlots::default();
        let err = slots
            .apply(&mut c, 2, 1, ShmLockFlags::LOCK_EXCLUSIVE, None)
            .unwrap_err();
        assert!(matches!(err, VfsError::Busy));

        slots.apply(&mut a, 2, 1, ShmLockFlags::UNLOCK_SHARED, None).unwrap();
        slots.apply(&mut b, 2, 1, ShmLockFlags::UNLOCK_SHARED, None).unwrap();
        assert_eq!(slots.count(2), 0);
        slots.apply(&mut c, 2, 1, ShmLockFlags::LOCK_EXCLUSIVE, None).unwrap();
        assert_eq!(slots.count(2), -1);
    }

    #[test]
    fn test_slots_exclusive_blocks_shared() {
        let mut slots = ShmSlots::default();
        let mut a = HeldSlots::default();
        let mut b = HeldSlots::default();
        slots.apply(&mut a, 0, 4, ShmLockFlags::LOCK_EXCLUSIVE, None).unwrap();
        assert!(matches!(
            slots.apply(&mut b, 3, 1, ShmLockFlags::LOCK_SHARED, None),
            Err(VfsError::Busy)
        ));
        slots.release_all(&mut a, None).unwrap();
        assert!(a.is_empty());
        slots.apply(&mut b, 3, 1, ShmLockFlags::LOCK_SHARED, None).unwrap();
    }

    #[test]
    fn test_slots_relock_is_precondition_violation() {
        let mut slots = ShmSlots::default();
        let mut a = HeldSlots::default();
        slots.apply(&mut a, 1, 1, ShmLockFlags::LOCK_SHARED, None).unwrap();
        assert!(matches!(
            slots.apply(&mut a, 1, 1, ShmLockFlags::LOCK_SHARED, None),
            Err(VfsError::PreconditionViolation(_))
        ));
        assert!(matches!(
            slots.apply(&mut a, 0, 3, ShmLockFlags::LOCK_EXCLUSIVE, None),
            Err(VfsError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_unlock_of_unheld_slot_is_ignored() {
        let mut slots = ShmSlots::default();
        let mut a = HeldSlots::default();
        let mut b = HeldSlots::default();
        slots.apply(&mut a, 5, 1, ShmLockFlags::LOCK_SHARED, None).unwrap();
        slots.apply(&mut b, 5, 1, ShmLockFlags::UNLOCK_SHARED, None).unwrap();
        assert_eq!(slots.count(5), 1);
    }

    #[test]
    fn test_os_lock_follows_zero_crossings() {
        let table = ByteLockTable::new();
        let os = MemoryLockBackend::new(table.clone());
        let foreign = MemoryLockBackend::new(table);
        let mut slots = ShmSlots::default();
        let mut a = HeldSlots::default();
        let mut b = HeldSlots::default();

        slots.apply(&mut a, 0, 1, ShmLockFlags::LOCK_SHARED, Some(&os)).unwrap();
        slots.apply(&mut b, 0, 1, ShmLockFlags::LOCK_SHARED, Some(&os)).unwrap();
        assert!(foreign.try_lock(RangeLock::Write, SHM_BASE, 1).is_err());

        slots.apply(&mut a, 0, 1, ShmLockFlags::UNLOCK_SHARED, Some(&os)).unwrap();
        assert!(foreign.try_lock(RangeLock::Write, SHM_BASE, 1).is_err());

        slots.apply(&mut b, 0, 1, ShmLockFlags::UNLOCK_SHARED, Some(&os)).unwrap();
        foreign.try_lock(RangeLock::Write, SHM_BASE, 1).unwrap();

        let err = slots
            .apply(&mut a, 0, 1, ShmLockFlags::LOCK_SHARED, Some(&os))
            .unwrap_err();
        assert!(matches!(err, VfsError::Busy));
        assert_eq!(slots.count(0), 0);
    }
}
