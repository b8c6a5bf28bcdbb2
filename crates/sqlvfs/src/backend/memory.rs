use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{LockBackend, RangeLock, would_block};

#[derive(Debug, Clone, Copy)]
struct HeldRange {
    owner: u64,
    kind: RangeLock,
    start: u64,
    end: u64,
}

impl HeldRange {
    const fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// Byte-range locks for one in-memory file, shared by every backend bound
/// to it.
#[derive(Debug, Clone, Default)]
pub struct ByteLockTable {
    held: Arc<Mutex<Vec<HeldRange>>>,
}

impl ByteLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct ranges currently held, by any owner.
    #[must_use]
    pub fn held_ranges(&self) -> usize {
        self.held.lock().len()
    }
}

/// Remove `owner`'s locks on `[start, end)`, splitting ranges that straddle
/// the boundaries.
fn carve(held: &mut Vec<HeldRange>, owner: u64, start: u64, end: u64) {
    let mut kept = Vec::with_capacity(held.len() + 1);
    for range in held.drain(..) {
        if range.owner != owner || !range.overlaps(start, end) {
            kept.push(range);
            continue;
        }
        if range.start < start {
            kept.push(HeldRange { end: start, ..range });
        }
        if range.end > end {
            kept.push(HeldRange { start: end, ..range });
        }
    }
    *held = kept;
}

fn range_end(start: u64, len: u64) -> u64 {
    if len == 0 {
        u64::MAX
    } else {
        start.saturating_add(len)
    }
}

/// A [`LockBackend`] over a [`ByteLockTable`]; each instance is a distinct
/// owner, so two handles on the same file conflict like two processes.
///
/// Dropping the backend releases everything it holds.
#[derive(Debug)]
pub struct MemoryLockBackend {
    table: ByteLockTable,
    owner: u64,
}

impl MemoryLockBackend {
    #[must_use]
    pub fn new(table: ByteLockTable) -> Self {
        static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
        Self {
            table,
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn conflict(&self, held: &[HeldRange], kind: RangeLock, start: u64, end: u64) -> Option<RangeLock> {
        held.iter()
            .filter(|r| r.owner != self.owner && r.overlaps(start, end))
            .find(|r| kind == RangeLock::Write || r.kind == RangeLock::Write)
            .map(|r| r.kind)
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_lock(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<()> {
        let end = range_end(start, len);
        let mut held = self.table.held.lock();
        if self.conflict(&held, kind, start, end).is_some() {
            return Err(would_block());
        }
        carve(&mut held, self.owner, start, end);
        held.push(HeldRange {
            owner: self.owner,
            kind,
            start,
            end,
        });
        Ok(())
    }

    fn unlock(&self, start: u64, len: u64) -> io::Result<()> {
        let end = range_end(start, len);
        carve(&mut self.table.held.lock(), self.owner, start, end);
        Ok(())
    }

    fn conflicting(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<Option<RangeLock>> {
        let end = range_end(start, len);
        let held = self.table.held.lock();
        Ok(self.conflict(&held, kind, start, end))
    }
}

impl Drop for MemoryLockBackend {
    fn drop(&mut self) {
        let owner = self.owner;
        self.table.held.lock().retain(|r| r.owner != owner);
    }
}
