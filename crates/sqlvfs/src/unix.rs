//! Unix VFS implementation with `fcntl`-based five-level locking and an
//! mmap-backed WAL index.
//!
//! **Key design:** POSIX fcntl locks are per-process, not per-fd. If one fd in
//! a process holds a lock, closing *any* fd to the same file releases it. We
//! handle this with a global inode table ([`InodeTable`]) that keeps one
//! canonical descriptor and one lock owner per inode, and defers closing any
//! extra descriptor until the last handle on the inode is gone.
//!
//! The WAL index lives in `<db><shm_suffix>`. One [`ShmNode`] per database
//! inode holds the mapped regions and slot counters; every handle is a
//! [`UnixShm`] instance attached to it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::MmapOptions;
use parking_lot::{Mutex, RwLock};
use sqlvfs_error::{IoErrorKind, Result, VfsError};
use sqlvfs_types::{
    AccessFlags, DeviceCharacteristics, LockLevel, SHARED_FIRST, SHARED_SIZE, SHM_BASE, SHM_DMS,
    SHM_NLOCK, ShmLockFlags, SyncFlags, VfsOpenFlags,
};
use tracing::{debug, info, warn};

use crate::backend::{
    BackendKind, FcntlBackend, LockBackend, RangeLock, default_backend_kind, lock_with_timeout,
};
use crate::config::VfsConfig;
use crate::lock::{LockManager, SharedOwner};
use crate::shm::{
    HeldSlots, SharedMemory, ShmRegion, ShmSlots, memory_barrier, validate_region_size,
    validate_shm_request,
};
use crate::traits::{Vfs, VfsFile};

// ---------------------------------------------------------------------------
// Inode table — per-process lock coalescing
// ---------------------------------------------------------------------------

/// Unique identity for an open file (device + inode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InodeKey {
    dev: u64,
    ino: u64,
}

impl InodeKey {
    fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Whether closing a descriptor releases locks taken through another one.
fn locks_are_per_process() -> bool {
    default_backend_kind() != BackendKind::OpenFileDescription
}

/// The lock owner of one inode.
///
/// The descriptor behind it is swapped when a writable descriptor replaces a
/// read-only canonical one, so handles holding this owner never notice.
#[derive(Debug)]
struct InodeLocks {
    current: RwLock<FcntlBackend>,
}

impl LockBackend for InodeLocks {
    fn try_lock(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<()> {
        self.current.read().try_lock(kind, start, len)
    }

    fn unlock(&self, start: u64, len: u64) -> io::Result<()> {
        self.current.read().unlock(start, len)
    }

    fn conflicting(&self, kind: RangeLock, start: u64, len: u64) -> io::Result<Option<RangeLock>> {
        self.current.read().conflicting(kind, start, len)
    }
}

/// Per-inode state shared across all file handles in this process.
#[derive(Debug)]
struct InodeEntry {
    /// Canonical descriptor; every lock on the inode goes through it.
    file: Arc<File>,
    writable: bool,
    locks: Arc<InodeLocks>,
    owner: SharedOwner,
    /// Total number of open file handles referencing this inode.
    n_ref: u32,
    /// Extra descriptors of closed handles, kept only under per-process POSIX
    /// locks: closing them while the inode is in use would drop its locks.
    deferred: Vec<Arc<File>>,
}

impl InodeEntry {
    fn new(file: &Arc<File>, writable: bool) -> Self {
        Self {
            file: Arc::clone(file),
            writable,
            locks: Arc::new(InodeLocks {
                current: RwLock::new(FcntlBackend::new(Arc::clone(file))),
            }),
            owner: SharedOwner::default(),
            n_ref: 0,
            deferred: Vec::new(),
        }
    }

    fn retire(&mut self, file: Arc<File>) {
        if locks_are_per_process() {
            self.deferred.push(file);
        }
    }

    /// Make the writable descriptor `file` canonical in place of a read-only
    /// one.
    ///
    /// A read-only descriptor can only carry SHARED. With descriptor-owned
    /// locks that read lock is moved over before the swap.
    fn promote(&mut self, file: &Arc<File>) -> io::Result<()> {
        let owner = self.owner.lock();
        let mut current = self.locks.current.write();
        let next = FcntlBackend::new(Arc::clone(file));
        if next.kind() == BackendKind::OpenFileDescription && owner.level() >= LockLevel::Shared {
            next.try_lock(RangeLock::Read, SHARED_FIRST, SHARED_SIZE)?;
            current.unlock(SHARED_FIRST, SHARED_SIZE)?;
        }
        *current = next;
        drop(current);
        drop(owner);

        let previous = std::mem::replace(&mut self.file, Arc::clone(file));
        self.writable = true;
        self.retire(previous);
        Ok(())
    }

    fn attached(&self, io: Arc<File>) -> Attached {
        Attached {
            io,
            backend: Arc::clone(&self.locks) as Arc<dyn LockBackend>,
            owner: Arc::clone(&self.owner),
        }
    }
}

/// What a handle gets when it attaches to an inode.
struct Attached {
    io: Arc<File>,
    backend: Arc<dyn LockBackend>,
    owner: SharedOwner,
}

struct InodeTable {
    map: Mutex<HashMap<InodeKey, InodeEntry>>,
}

impl InodeTable {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Attach to an inode already open in this process, if its canonical
    /// descriptor allows the requested access.
    fn attach_existing(&self, key: InodeKey, want_write: bool) -> Option<Attached> {
        let mut map = self.map.lock();
        let entry = map.get_mut(&key)?;
        if want_write && !entry.writable {
            return None;
        }
        entry.n_ref += 1;
        Some(entry.attached(Arc::clone(&entry.file)))
    }

    /// Attach a freshly opened descriptor. It becomes canonical if the inode
    /// is new to this process or only has a read-only canonical descriptor;
    /// otherwise it is used for I/O only.
    fn attach(&self, key: InodeKey, file: Arc<File>, writable: bool) -> Attached {
        let mut map = self.map.lock();
        let entry = map
            .entry(key)
            .or_insert_with(|| InodeEntry::new(&file, writable));
        if writable && !entry.writable {
            if let Err(e) = entry.promote(&file) {
                warn!(
                    target: "sqlvfs::unix",
                    error = %e,
                    "could not make writable descriptor canonical"
                );
            }
        }
        entry.n_ref += 1;
        entry.attached(file)
    }

    fn detach(&self, key: InodeKey, io: Arc<File>) {
        let mut map = self.map.lock();
        let Some(entry) = map.get_mut(&key) else {
            return;
        };
        if !Arc::ptr_eq(&entry.file, &io) {
            entry.retire(io);
        }
        entry.n_ref = entry.n_ref.saturating_sub(1);
        if entry.n_ref == 0 {
            map.remove(&key);
        }
    }
}

/// The singleton global inode table for the process.
fn global_inode_table() -> &'static InodeTable {
    static TABLE: OnceLock<InodeTable> = OnceLock::new();
    TABLE.get_or_init(InodeTable::new)
}

/// Extract the (device, inode) pair from a path without opening the file.
///
/// Returns `Ok(None)` if the file does not exist.
fn inode_key_from_path(path: &Path) -> io::Result<Option<InodeKey>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(InodeKey::from_metadata(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Shared-memory node table
// ---------------------------------------------------------------------------

/// WAL-index state shared by every handle on one database in this process.
#[derive(Debug)]
struct ShmNode {
    path: PathBuf,
    file: Arc<File>,
    backend: FcntlBackend,
    readonly: bool,
    regions: Vec<ShmRegion>,
    slots: ShmSlots,
    /// Descriptors replaced by a read-write reopen, kept open only under
    /// per-process POSIX locks.
    retired: Vec<Arc<File>>,
}

impl ShmNode {
    /// Switch a read-only node to the read-write descriptor `file`: remap
    /// every region writable and move the DMS and shared slot locks over.
    fn make_writable(&mut self, file: File) -> Result<()> {
        let file = Arc::new(file);
        let mut regions = Vec::with_capacity(self.regions.len());
        let mut offset = 0_u64;
        for region in &self.regions {
            regions.push(map_region(&file, offset, region.len(), false)?);
            offset += region.len() as u64;
        }

        let backend = FcntlBackend::new(Arc::clone(&file));
        if backend.kind() == BackendKind::OpenFileDescription {
            let held: Vec<u64> = std::iter::once(SHM_DMS)
                .chain(
                    (0..SHM_NLOCK)
                        .filter(|&slot| self.slots.count(slot) > 0)
                        .map(|slot| SHM_BASE + slot as u64),
                )
                .collect();
            for &start in &held {
                backend
                    .try_lock(RangeLock::Read, start, 1)
                    .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::ShmOpen))?;
            }
            for &start in &held {
                drop(self.backend.unlock(start, 1));
            }
        }

        let previous = std::mem::replace(&mut self.file, file);
        self.backend = backend;
        self.regions = regions;
        self.readonly = false;
        if locks_are_per_process() {
            self.retired.push(previous);
        }
        Ok(())
    }
}

struct ShmTable {
    map: Mutex<HashMap<InodeKey, (Arc<Mutex<ShmNode>>, u32)>>,
}

impl ShmTable {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Attach to the node for `key`, opening it with `open` if this process
    /// has none, or passing an existing one through `join`. The table stays
    /// locked while opening so that only one handle runs the dead-man's
    /// switch.
    fn acquire(
        &self,
        key: InodeKey,
        open: impl FnOnce() -> Result<ShmNode>,
        join: impl FnOnce(&mut ShmNode) -> Result<()>,
    ) -> Result<Arc<Mutex<ShmNode>>> {
        let mut map = self.map.lock();
        if let Some((node, refs)) = map.get_mut(&key) {
            join(&mut node.lock())?;
            *refs += 1;
            return Ok(Arc::clone(node));
        }
        let node = Arc::new(Mutex::new(open()?));
        map.insert(key, (Arc::clone(&node), 1));
        Ok(node)
    }

    fn release(&self, key: InodeKey, delete: bool) -> Result<()> {
        let node = {
            let mut map = self.map.lock();
            let Some((_, refs)) = map.get_mut(&key) else {
                return Ok(());
            };
            *refs -= 1;
            if *refs > 0 {
                return Ok(());
            }
            match map.remove(&key) {
                Some((node, _)) => node,
                None => return Ok(()),
            }
        };

        let node = node.lock();
        drop(node.backend.unlock(SHM_DMS, 1));
        debug!(
            target: "sqlvfs::unix",
            path = %node.path.display(),
            delete,
            "wal-index closed"
        );
        if delete {
            match fs::remove_file(&node.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(VfsError::io(IoErrorKind::Delete, e)),
            }
        }
        Ok(())
    }
}

fn global_shm_table() -> &'static ShmTable {
    static TABLE: OnceLock<ShmTable> = OnceLock::new();
    TABLE.get_or_init(ShmTable::new)
}

fn map_region(file: &File, offset: u64, size: usize, readonly: bool) -> Result<ShmRegion> {
    let mut options = MmapOptions::new();
    options.offset(offset).len(size);
    // SAFETY: the WAL-index file is mapped MAP_SHARED and is expected to be
    // modified by other processes; callers coordinate through the slot locks
    // and only reach the bytes through the region mutex.
    let mapped = if readonly {
        unsafe { options.map(file) }.map(ShmRegion::from_mmap_read_only)
    } else {
        unsafe { options.map_mut(file) }.map(ShmRegion::from_mmap)
    };
    mapped.map_err(|e| VfsError::io(IoErrorKind::ShmMap, e))
}

/// One handle's view of a database's WAL index.
#[derive(Debug)]
pub struct UnixShm {
    key: InodeKey,
    path: PathBuf,
    readonly_db: bool,
    timeout: Duration,
    node: Option<Arc<Mutex<ShmNode>>>,
    held: HeldSlots,
}

impl UnixShm {
    fn new(key: InodeKey, db_path: &Path, suffix: &str, readonly_db: bool, timeout: Duration) -> Self {
        let mut path = OsString::from(db_path.as_os_str());
        path.push(suffix);
        Self {
            key,
            path: PathBuf::from(path),
            readonly_db,
            timeout,
            node: None,
            held: HeldSlots::default(),
        }
    }

    /// Path of the backing `-shm` file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn node(&mut self) -> Result<Arc<Mutex<ShmNode>>> {
        if let Some(node) = &self.node {
            return Ok(Arc::clone(node));
        }
        let node = global_shm_table().acquire(
            self.key,
            || self.open_node(),
            |node| self.join_node(node),
        )?;
        self.node = Some(Arc::clone(&node));
        Ok(node)
    }

    fn open_file(&self) -> Result<(File, bool)> {
        if !self.readonly_db {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
            {
                Ok(file) => return Ok((file, false)),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
                Err(e) => return Err(VfsError::io(IoErrorKind::ShmOpen, e)),
            }
        }
        // No index file means no live connection that could initialize it.
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => VfsError::ReadOnly,
            _ => VfsError::io(IoErrorKind::ShmOpen, e),
        })?;
        Ok((file, true))
    }

    /// A read-write handle joining a node opened read-only reopens it.
    fn join_node(&self, node: &mut ShmNode) -> Result<()> {
        if !node.readonly || self.readonly_db {
            return Ok(());
        }
        let (file, readonly) = self.open_file()?;
        if readonly {
            return Ok(());
        }
        node.make_writable(file)?;
        debug!(
            target: "sqlvfs::unix",
            path = %self.path.display(),
            "wal-index reopened read-write"
        );
        Ok(())
    }

    /// Open the backing file and run the dead-man's switch.
    fn open_node(&self) -> Result<ShmNode> {
        let (file, readonly) = self.open_file()?;
        let file = Arc::new(file);
        let backend = FcntlBackend::new(Arc::clone(&file));

        let holder = backend
            .conflicting(RangeLock::Write, SHM_DMS, 1)
            .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::ShmOpen))?;
        match holder {
            Some(RangeLock::Write) => return Err(VfsError::Busy),
            Some(RangeLock::Read) => {}
            None => {
                if readonly {
                    return Err(VfsError::ReadOnly);
                }
                backend
                    .try_lock(RangeLock::Write, SHM_DMS, 1)
                    .map_err(|e| VfsError::from_lock_error(e, IoErrorKind::ShmOpen))?;
                file.set_len(0)
                    .map_err(|e| VfsError::io(IoErrorKind::ShmOpen, e))?;
                debug!(
                    target: "sqlvfs::unix",
                    path = %self.path.display(),
                    "wal-index reset by first opener"
                );
            }
        }
        lock_with_timeout(
            &backend,
            RangeLock::Read,
            SHM_DMS,
            1,
            self.timeout,
            IoErrorKind::ShmOpen,
        )?;

        debug!(
            target: "sqlvfs::unix",
            path = %self.path.display(),
            readonly,
            "wal-index opened"
        );
        Ok(ShmNode {
            path: self.path.clone(),
            file,
            backend,
            readonly,
            regions: Vec::new(),
            slots: ShmSlots::default(),
            retired: Vec::new(),
        })
    }
}

impl SharedMemory for UnixShm {
    #[allow(clippy::significant_drop_tightening)]
    fn shm_map(&mut self, region: u32, size: usize, extend: bool) -> Result<Option<ShmRegion>> {
        validate_region_size(size)?;
        let node = self.node()?;
        let mut node = node.lock();

        let idx = region as usize;
        if let Some(mapped) = node.regions.get(idx) {
            return Ok(Some(mapped.clone()));
        }

        let size_u64 = size as u64;
        let needed = (u64::from(region) + 1) * size_u64;
        let len = node
            .file
            .metadata()
            .map_err(|e| VfsError::io(IoErrorKind::ShmSize, e))?
            .len();
        if len < needed {
            if !extend {
                return Ok(None);
            }
            if node.readonly {
                return Err(VfsError::ReadOnly);
            }
            node.file
                .set_len(needed)
                .map_err(|e| VfsError::io(IoErrorKind::ShmSize, e))?;
        }

        while node.regions.len() <= idx {
            let offset = node.regions.len() as u64 * size_u64;
            let mapped = map_region(&node.file, offset, size, node.readonly)?;
            node.regions.push(mapped);
        }
        debug!(
            target: "sqlvfs::unix",
            region,
            size,
            "wal-index region mapped"
        );
        Ok(Some(node.regions[idx].clone()))
    }

    fn shm_lock(&mut self, offset: usize, n: usize, flags: ShmLockFlags) -> Result<()> {
        validate_shm_request(offset, n, flags)?;
        let Some(node) = &self.node else {
            return Err(VfsError::precondition("shm_lock before shm_map"));
        };
        let mut guard = node.lock();
        let node = &mut *guard;
        if node.readonly && flags == ShmLockFlags::LOCK_EXCLUSIVE {
            return Err(VfsError::ReadOnly);
        }
        node.slots.apply(
            &mut self.held,
            offset,
            n,
            flags,
            Some(&node.backend as &dyn LockBackend),
        )
    }

    fn shm_barrier(&self) {
        if let Some(node) = &self.node {
            drop(node.lock());
        }
        memory_barrier();
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<()> {
        let Some(node) = self.node.take() else {
            return Ok(());
        };
        let released = {
            let mut guard = node.lock();
            let node = &mut *guard;
            node.slots
                .release_all(&mut self.held, Some(&node.backend as &dyn LockBackend))
        };
        drop(node);
        global_shm_table().release(self.key, delete)?;
        released
    }
}

// ---------------------------------------------------------------------------
// UnixVfs
// ---------------------------------------------------------------------------

/// A VFS backed by the real Unix filesystem with `fcntl` advisory locking.
#[derive(Debug)]
pub struct UnixVfs {
    config: VfsConfig,
}

impl UnixVfs {
    /// Create a new Unix VFS instance.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(VfsConfig::default())
    }

    #[must_use]
    pub fn with_config(config: VfsConfig) -> Self {
        let config = config.validated();
        info!(
            target: "sqlvfs::unix",
            backend = ?default_backend_kind(),
            lock_timeout_ms = config.lock_timeout.as_millis(),
            "unix vfs ready"
        );
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &VfsConfig {
        &self.config
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

fn temp_path() -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());
    std::env::temp_dir().join(format!(
        "sqlvfs_{}_{seq}_{nanos:08x}.tmp",
        std::process::id()
    ))
}

fn is_dir_error(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EISDIR)
}

fn is_readonly_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::EROFS)
}

/// Open options and fallback policy for one `open` call.
fn open_file(path: &Path, flags: VfsOpenFlags) -> Result<(File, bool)> {
    let create = flags.contains(VfsOpenFlags::CREATE);
    let exclusive = create && flags.contains(VfsOpenFlags::EXCLUSIVE);
    let read_write = create || flags.contains(VfsOpenFlags::READWRITE);

    let cant_open = |e: &io::Error| {
        if is_dir_error(e) {
            VfsError::CannotOpenIsDirectory {
                path: path.to_path_buf(),
            }
        } else {
            VfsError::CannotOpen {
                path: path.to_path_buf(),
            }
        }
    };

    let opened = OpenOptions::new()
        .read(true)
        .write(read_write)
        .create(create && !exclusive)
        .create_new(exclusive)
        .truncate(false)
        .open(path);

    let (file, readonly) = match opened {
        Ok(file) => (file, !read_write),
        Err(e) if read_write && !exclusive && is_readonly_error(&e) => {
            let file = File::open(path).map_err(|e| cant_open(&e))?;
            (file, true)
        }
        Err(e) => return Err(cant_open(&e)),
    };

    let meta = file.metadata().map_err(|e| VfsError::io(IoErrorKind::Fstat, e))?;
    if meta.is_dir() {
        return Err(VfsError::CannotOpenIsDirectory {
            path: path.to_path_buf(),
        });
    }
    Ok((file, readonly))
}

fn sync_directory(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| VfsError::io(IoErrorKind::DirFsync, e))
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, path: Option<&Path>, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        let mut flags = flags;
        let resolved = if let Some(p) = path {
            p.to_path_buf()
        } else {
            flags |= VfsOpenFlags::CREATE
                | VfsOpenFlags::READWRITE
                | VfsOpenFlags::EXCLUSIVE
                | VfsOpenFlags::DELETEONCLOSE;
            temp_path()
        };

        let create = flags.contains(VfsOpenFlags::CREATE);
        let want_write = create || flags.contains(VfsOpenFlags::READWRITE);
        let exclusive = create && flags.contains(VfsOpenFlags::EXCLUSIVE);

        // Reuse the in-process canonical fd when the inode is already open.
        let existing = if exclusive {
            None
        } else {
            inode_key_from_path(&resolved)
                .map_err(|e| VfsError::io(IoErrorKind::Fstat, e))?
                .and_then(|key| {
                    global_inode_table()
                        .attach_existing(key, want_write)
                        .map(|attached| (key, attached, !want_write))
                })
        };

        let (key, attached, readonly) = if let Some(found) = existing {
            found
        } else {
            let (file, readonly) = open_file(&resolved, flags)?;
            let meta = file
                .metadata()
                .map_err(|e| VfsError::io(IoErrorKind::Fstat, e))?;
            let key = InodeKey::from_metadata(&meta);
            let attached = global_inode_table().attach(key, Arc::new(file), !readonly);
            (key, attached, readonly)
        };

        let mut out_flags = flags;
        if readonly {
            out_flags.remove(VfsOpenFlags::READWRITE | VfsOpenFlags::CREATE);
            out_flags |= VfsOpenFlags::READONLY;
        } else if create {
            out_flags |= VfsOpenFlags::READWRITE;
        }

        let lock = LockManager::new(attached.backend, attached.owner, readonly)
            .with_timeout(self.config.lock_timeout);
        let shm = UnixShm::new(
            key,
            &resolved,
            self.config.shm_suffix,
            readonly,
            self.config.shm_lock_timeout,
        );

        debug!(
            target: "sqlvfs::unix",
            path = %resolved.display(),
            readonly,
            "file opened"
        );

        let unix_file = UnixFile {
            io: Some(attached.io),
            path: resolved,
            key,
            lock,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            sync_dir_pending: flags.needs_dir_sync(),
            powersafe_overwrite: self.config.powersafe_overwrite,
            persist_wal: self.config.persist_wal,
            max_lock_timeout: self.config.max_lock_timeout,
            shm,
        };
        Ok((unix_file, out_flags))
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        fs::remove_file(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                VfsError::io(IoErrorKind::DeleteNoent, e)
            } else {
                VfsError::io(IoErrorKind::Delete, e)
            }
        })?;
        if sync_dir {
            sync_directory(path)?;
        }
        Ok(())
    }

    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        use nix::unistd::{AccessFlags as Mode, access};

        let mode = if flags.contains(AccessFlags::READWRITE) {
            Mode::R_OK | Mode::W_OK
        } else if flags.contains(AccessFlags::READ) {
            Mode::R_OK
        } else {
            Mode::F_OK
        };
        match access(path, mode) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ENOENT | nix::errno::Errno::EACCES | nix::errno::Errno::EROFS) => {
                Ok(false)
            }
            Err(e) => Err(VfsError::io(IoErrorKind::Access, e.into())),
        }
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let cwd = std::env::current_dir().map_err(|_| VfsError::CannotOpenFullPath {
            path: path.to_path_buf(),
        })?;
        Ok(cwd.join(path))
    }
}

// ---------------------------------------------------------------------------
// UnixFile
// ---------------------------------------------------------------------------

/// A file handle opened by [`UnixVfs`].
#[derive(Debug)]
pub struct UnixFile {
    /// `None` once closed.
    io: Option<Arc<File>>,
    path: PathBuf,
    key: InodeKey,
    lock: LockManager,
    delete_on_close: bool,
    sync_dir_pending: bool,
    powersafe_overwrite: bool,
    persist_wal: bool,
    max_lock_timeout: Duration,
    shm: UnixShm,
}

impl UnixFile {
    fn file(&self) -> Result<&File> {
        self.io
            .as_deref()
            .ok_or_else(|| VfsError::precondition("file handle used after close"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VfsFile for UnixFile {
    fn close(&mut self) -> Result<()> {
        if self.io.is_none() {
            return Ok(());
        }
        let unlocked = self.lock.unlock(LockLevel::None);
        let unmapped = self.shm.shm_unmap(false);

        if let Some(io) = self.io.take() {
            global_inode_table().detach(self.key, io);
        }
        if self.delete_on_close {
            drop(fs::remove_file(&self.path));
        }
        debug!(target: "sqlvfs::unix", path = %self.path.display(), "file closed");
        unlocked?;
        unmapped
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0_usize;
        while total < buf.len() {
            let off = offset + total as u64;
            let n = file
                .read_at(&mut buf[total..], off)
                .map_err(|e| VfsError::io(IoErrorKind::Read, e))?;
            if n == 0 {
                break; // EOF
            }
            total += n;
        }

        // Zero-fill short reads.
        if total < buf.len() {
            buf[total..].fill(0);
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        file.write_all_at(buf, offset)
            .map_err(|e| VfsError::io(IoErrorKind::Write, e))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file()?
            .set_len(size)
            .map_err(|e| VfsError::io(IoErrorKind::Truncate, e))
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let file = self.file()?;
        let synced = if flags.contains(SyncFlags::DATAONLY) {
            file.sync_data()
        } else {
            file.sync_all()
        };
        synced.map_err(|e| VfsError::io(IoErrorKind::Fsync, e))?;

        if self.sync_dir_pending {
            sync_directory(&self.path)?;
            self.sync_dir_pending = false;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        let meta = self
            .file()?
            .metadata()
            .map_err(|e| VfsError::io(IoErrorKind::Fstat, e))?;
        Ok(meta.len())
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
        let mut caps = DeviceCharacteristics::SUBPAGE_READ;
        if self.powersafe_overwrite {
            caps |= DeviceCharacteristics::POWERSAFE_OVERWRITE;
        }
        caps
    }

    #[allow(clippy::cast_possible_wrap)]
    fn size_hint(&mut self, size: u64) -> Result<()> {
        let file = self.file()?;
        let current = file
            .metadata()
            .map_err(|e| VfsError::io(IoErrorKind::Fstat, e))?
            .len();
        if size <= current {
            return Ok(());
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use std::os::fd::AsRawFd;
            if nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t).is_ok() {
                return Ok(());
            }
        }
        file.set_len(size)
            .map_err(|e| VfsError::io(IoErrorKind::Truncate, e))
    }

    fn has_moved(&self) -> Result<bool> {
        let current = inode_key_from_path(&self.path)
            .map_err(|e| VfsError::io(IoErrorKind::Fstat, e))?;
        Ok(current != Some(self.key))
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
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        drop(self.close());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
