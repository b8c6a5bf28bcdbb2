use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlvfs_error::{IoErrorKind, Result, VfsError};
use sqlvfs_types::{
    AccessFlags, DeviceCharacteristics, LockLevel, ShmLockFlags, SyncFlags, VfsOpenFlags,
};
use tracing::debug;

use crate::backend::{ByteLockTable, MemoryLockBackend};
use crate::config::VfsConfig;
use crate::lock::{LockManager, SharedOwner};
use crate::shm::{
    HeldSlots, SharedMemory, ShmRegion, ShmSlots, memory_barrier, validate_region_size,
    validate_shm_request,
};
use crate::traits::{BatchAtomicWrite, Vfs, VfsFile};

/// WAL-index state of one in-memory database.
#[derive(Debug, Default)]
struct MemShmNode {
    regions: Vec<ShmRegion>,
    slots: ShmSlots,
    attached: u32,
}

/// Shared storage for one file in the memory VFS.
///
/// Every `MemoryFile` handle on the same name references the same storage.
/// Locks on it are tracked per handle, so two handles contend exactly like
/// two processes would.
#[derive(Debug, Default)]
struct FileStorage {
    data: Mutex<Vec<u8>>,
    locks: ByteLockTable,
    shm: Mutex<MemShmNode>,
}

/// Shared state for the entire memory VFS.
#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<FileStorage>>,
    next_temp_id: u64,
}

/// An in-memory VFS for testing and in-memory databases.
///
/// All files are stored in memory with no persistence. Multiple connections
/// can share the same `MemoryVfs` instance to access the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
    config: VfsConfig,
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: VfsConfig) -> Self {
        Self {
            inner: Arc::default(),
            config: config.validated(),
        }
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memdb"
    }

    #[allow(clippy::significant_drop_tightening)]
    fn open(&self, path: Option<&Path>, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        let mut flags = flags;
        let mut inner = self.inner.lock();

        let resolved_path = if let Some(p) = path {
            p.to_path_buf()
        } else {
            // Generate a unique temporary filename.
            let id = inner.next_temp_id;
            inner.next_temp_id += 1;
            flags |= VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE | VfsOpenFlags::DELETEONCLOSE;
            PathBuf::from(format!("__temp_{id}__"))
        };

        let is_create = flags.contains(VfsOpenFlags::CREATE);
        let is_exclusive = is_create && flags.contains(VfsOpenFlags::EXCLUSIVE);
        let storage = match inner.files.get(&resolved_path) {
            Some(_) if is_exclusive => {
                return Err(VfsError::CannotOpen {
                    path: resolved_path,
                });
            }
            Some(existing) => Arc::clone(existing),
            None if is_create => {
                let storage = Arc::new(FileStorage::default());
                inner
                    .files
                    .insert(resolved_path.clone(), Arc::clone(&storage));
                storage
            }
            None => {
                return Err(VfsError::CannotOpen {
                    path: resolved_path,
                });
            }
        };

        drop(inner);

        let readonly = !is_create && !flags.contains(VfsOpenFlags::READWRITE);
        let backend = Arc::new(MemoryLockBackend::new(storage.locks.clone()));
        let lock = LockManager::new(backend, SharedOwner::default(), readonly)
            .with_timeout(self.config.lock_timeout);

        let file = MemoryFile {
            path: resolved_path,
            storage: Arc::clone(&storage),
            lock,
            readonly,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            powersafe_overwrite: self.config.powersafe_overwrite,
            persist_wal: self.config.persist_wal,
            max_lock_timeout: self.config.max_lock_timeout,
            batch: None,
            shm: MemoryShm {
                storage,
                held: HeldSlots::default(),
                attached: false,
            },
            closed: false,
            vfs: Arc::clone(&self.inner),
        };

        let mut out_flags = flags;
        if is_create {
            out_flags |= VfsOpenFlags::READWRITE;
        }

        Ok((file, out_flags))
    }

    fn delete(&self, path: &Path, _sync_dir: bool) -> Result<()> {
        if self.inner.lock().files.remove(path).is_none() {
            return Err(VfsError::io(
                IoErrorKind::DeleteNoent,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        Ok(())
    }

    fn access(&self, path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(path))
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(Path::new("/").join(path))
        }
    }
}

// ---------------------------------------------------------------------------
// Batch atomic write
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum PendingOp {
    Write { offset: usize, data: Vec<u8> },
    Truncate(usize),
}

impl PendingOp {
    fn apply(&self, data: &mut Vec<u8>) {
        match self {
            Self::Write { offset, data: buf } => write_at(data, buf, *offset),
            Self::Truncate(size) => data.resize(*size, 0),
        }
    }
}

fn write_at(data: &mut Vec<u8>, buf: &[u8], offset: usize) {
    let end = offset + buf.len();
    if end > data.len() {
        data.resize(end, 0);
    }
    data[offset..end].copy_from_slice(buf);
}

fn read_at(data: &[u8], buf: &mut [u8], offset: usize) -> usize {
    if offset >= data.len() {
        buf.fill(0);
        return 0;
    }
    let to_read = buf.len().min(data.len() - offset);
    buf[..to_read].copy_from_slice(&data[offset..offset + to_read]);
    // Zero-fill the rest if short read.
    buf[to_read..].fill(0);
    to_read
}

// ---------------------------------------------------------------------------
// MemoryFile
// ---------------------------------------------------------------------------

/// A file handle in the memory VFS.
///
/// Reads and writes operate on a shared `Vec<u8>` protected by a mutex.
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    storage: Arc<FileStorage>,
    lock: LockManager,
    readonly: bool,
    delete_on_close: bool,
    powersafe_overwrite: bool,
    persist_wal: bool,
    max_lock_timeout: Duration,
    /// Writes buffered by an open batch.
    batch: Option<Vec<PendingOp>>,
    shm: MemoryShm,
    closed: bool,
    vfs: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryFile {
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(VfsError::ReadOnly);
        }
        Ok(())
    }

    /// File contents with any buffered batch applied.
    fn batch_view(&self, ops: &[PendingOp]) -> Vec<u8> {
        let mut view = self.storage.data.lock().clone();
        for op in ops {
            op.apply(&mut view);
        }
        view
    }
}

impl VfsFile for MemoryFile {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.batch = None;
        let unlocked = self.lock.unlock(LockLevel::None);
        let unmapped = self.shm.shm_unmap(false);
        if self.delete_on_close {
            let mut inner = self.vfs.lock();
            if inner
                .files
                .get(&self.path)
                .is_some_and(|s| Arc::ptr_eq(s, &self.storage))
            {
                inner.files.remove(&self.path);
            }
        }
        unlocked?;
        unmapped
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if let Some(ops) = &self.batch {
            let view = self.batch_view(ops);
            return Ok(read_at(&view, buf, offset));
        }
        let data = self.storage.data.lock();
        Ok(read_at(&data, buf, offset))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_writable()?;
        let offset = offset as usize;
        if let Some(ops) = &mut self.batch {
            ops.push(PendingOp::Write {
                offset,
                data: buf.to_vec(),
            });
            return Ok(());
        }
        write_at(&mut self.storage.data.lock(), buf, offset);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_writable()?;
        let size = size as usize;
        if let Some(ops) = &mut self.batch {
            ops.push(PendingOp::Truncate(size));
            return Ok(());
        }
        self.storage.data.lock().truncate(size);
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        let len = match &self.batch {
            Some(ops) => self.batch_view(ops).len(),
            None => self.storage.data.lock().len(),
        };
        Ok(len as u64)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.lock.unlock(level)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        self.lock.check_reserved()
    }

    fn lock_state(&self) -> LockLevel {
        self.lock.level()
    }

    fn set_lock_timeout(&mut self, timeout: Duration) -> Option<Duration> {
        Some(self.lock.set_timeout(timeout.min(self.max_lock_timeout)))
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        let mut caps = DeviceCharacteristics::SUBPAGE_READ | DeviceCharacteristics::BATCH_ATOMIC;
        if self.powersafe_overwrite {
            caps |= DeviceCharacteristics::POWERSAFE_OVERWRITE;
        }
        caps
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size_hint(&mut self, size: u64) -> Result<()> {
        let mut data = self.storage.data.lock();
        let additional = (size as usize).saturating_sub(data.len());
        data.reserve(additional);
        Ok(())
    }

    fn has_moved(&self) -> Result<bool> {
        let inner = self.vfs.lock();
        Ok(!inner
            .files
            .get(&self.path)
            .is_some_and(|s| Arc::ptr_eq(s, &self.storage)))
    }

    fn powersafe_overwrite(&self) -> Option<bool> {
        Some(self.powersafe_overwrite)
    }

    fn set_powersafe_overwrite(&mut self, on: bool) -> Result<()> {
        self.powersafe_overwrite = on;
        Ok(())
    }

    fn persist_wal(&self) -> Option<bool> {
        Some(self.persist_wal)
    }

    fn set_persist_wal(&mut self, on: bool) -> Result<()> {
        self.persist_wal = on;
        Ok(())
    }

    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        Some(&mut self.shm)
    }

    fn batch_atomic_write(&mut self) -> Option<&mut dyn BatchAtomicWrite> {
        Some(self)
    }
}

impl BatchAtomicWrite for MemoryFile {
    fn begin_atomic_write(&mut self) -> Result<()> {
        self.check_writable()?;
        if self.batch.is_some() {
            return Err(VfsError::precondition("batch atomic write already open"));
        }
        self.batch = Some(Vec::new());
        Ok(())
    }

    fn commit_atomic_write(&mut self) -> Result<()> {
        let ops = self
            .batch
            .take()
            .ok_or_else(|| VfsError::precondition("no batch atomic write to commit"))?;
        let mut data = self.storage.data.lock();
        for op in &ops {
            op.apply(&mut data);
        }
        drop(data);
        debug!(target: "sqlvfs::memory", ops = ops.len(), "batch committed");
        Ok(())
    }

    fn rollback_atomic_write(&mut self) -> Result<()> {
        if let Some(ops) = self.batch.take() {
            debug!(target: "sqlvfs::memory", ops = ops.len(), "batch rolled back");
        }
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        drop(self.close());
    }
}

// ---------------------------------------------------------------------------
// MemoryShm
// ---------------------------------------------------------------------------

/// Heap-backed WAL index. The regions are discarded when the last attached
/// handle unmaps.
#[derive(Debug)]
pub struct MemoryShm {
    storage: Arc<FileStorage>,
    held: HeldSlots,
    attached: bool,
}

impl SharedMemory for MemoryShm {
    #[allow(clippy::significant_drop_tightening)]
    fn shm_map(&mut self, region: u32, size: usize, extend: bool) -> Result<Option<ShmRegion>> {
        validate_region_size(size)?;
        let mut node = self.storage.shm.lock();
        if !self.attached {
            node.attached += 1;
            self.attached = true;
        }

        let idx = region as usize;
        if let Some(mapped) = node.regions.get(idx) {
            return Ok(Some(mapped.clone()));
        }
        if !extend {
            return Ok(None);
        }
        while node.regions.len() <= idx {
            node.regions.push(ShmRegion::new(size));
        }
        Ok(Some(node.regions[idx].clone()))
    }

    fn shm_lock(&mut self, offset: usize, n: usize, flags: ShmLockFlags) -> Result<()> {
        validate_shm_request(offset, n, flags)?;
        if !self.attached {
            return Err(VfsError::precondition("shm_lock before shm_map"));
        }
        self.storage
            .shm
            .lock()
            .slots
            .apply(&mut self.held, offset, n, flags, None)
    }

    fn shm_barrier(&self) {
        memory_barrier();
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        if !self.attached {
            return Ok(());
        }
        self.attached = false;
        let mut node = self.storage.shm.lock();
        let released = node.slots.release_all(&mut self.held, None);
        node.attached = node.attached.saturating_sub(1);
        if node.attached == 0 {
            node.regions.clear();
        }
        drop(node);
        debug!(target: "sqlvfs::memory", delete, "wal-index unmapped");
        released
    }
}
