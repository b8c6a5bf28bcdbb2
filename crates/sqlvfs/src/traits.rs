use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlvfs_error::{Result, VfsError};
use sqlvfs_types::{AccessFlags, DeviceCharacteristics, LockLevel, SyncFlags, VfsOpenFlags};

use crate::shm::SharedMemory;

/// A virtual filesystem implementation.
///
/// This trait abstracts all file system operations, allowing different
/// backends: real files (Unix), in-memory (testing), or wrappers such as the
/// checksum VFS.
///
/// Modeled after C SQLite's `sqlite3_vfs` struct from `os.h`.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile + 'static;

    /// The name of this VFS (e.g., "unix", "memdb").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `path` is `None` for temporary files that should be auto-named.
    /// Returns the opened file and the flags that were actually used (the VFS
    /// adds `READWRITE` when `CREATE` is specified, and reports `READONLY`
    /// when it had to fall back to a read-only open).
    fn open(&self, path: Option<&Path>, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)>;

    /// Delete a file, syncing its directory afterwards if `sync_dir`.
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()>;

    /// Whether the file at `path` satisfies the access check in `flags`.
    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Resolve a potentially relative path into an absolute path.
    fn full_pathname(&self, path: &Path) -> Result<PathBuf>;
}

/// Explicit batch-atomic-write capability.
///
/// Writes issued between `begin` and `commit` become durable together or not
/// at all.
pub trait BatchAtomicWrite {
    fn begin_atomic_write(&mut self) -> Result<()>;
    fn commit_atomic_write(&mut self) -> Result<()>;
    fn rollback_atomic_write(&mut self) -> Result<()>;
}

/// A file handle opened by a VFS.
///
/// Corresponds to C SQLite's `sqlite3_file` + `sqlite3_io_methods`. Optional
/// capabilities default to `Err(VfsError::NotFound)` or `None`.
pub trait VfsFile: Send + Sync {
    /// Close the file, releasing any lock it holds.
    fn close(&mut self) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read. If fewer bytes are read
    /// than requested (short read), the remaining bytes in `buf` are zeroed.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Like [`read`](Self::read), but a short read is an error
    /// (`IOERR_SHORT_READ`) after the tail has been zero-filled.
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let n = self.read(buf, offset)?;
        if n < buf.len() {
            return Err(VfsError::ShortRead {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    /// Write `buf` starting at byte offset `offset`.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Sync the file contents to stable storage.
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;

    /// Return the current file size in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Acquire a file lock at the given level.
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// Release the file lock to the given level (`None` or `Shared`).
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// Whether any handle, this one included, holds RESERVED or higher.
    fn check_reserved_lock(&self) -> Result<bool>;

    /// The lock level this handle holds.
    fn lock_state(&self) -> LockLevel;

    /// Replace the lock timeout, returning the previous value, or `None` if
    /// this file has no lock timeout.
    fn set_lock_timeout(&mut self, timeout: Duration) -> Option<Duration> {
        let _ = timeout;
        None
    }

    /// The minimum write granularity of the underlying storage.
    fn sector_size(&self) -> u32 {
        4096
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// Hint that the file is about to grow to `size` bytes.
    fn size_hint(&mut self, size: u64) -> Result<()> {
        let _ = size;
        Err(VfsError::NotFound)
    }

    /// Whether the path this file was opened with now names another file.
    fn has_moved(&self) -> Result<bool> {
        Err(VfsError::NotFound)
    }

    fn powersafe_overwrite(&self) -> Option<bool> {
        None
    }

    fn set_powersafe_overwrite(&mut self, on: bool) -> Result<()> {
        let _ = on;
        Err(VfsError::NotFound)
    }

    fn persist_wal(&self) -> Option<bool> {
        None
    }

    fn set_persist_wal(&mut self, on: bool) -> Result<()> {
        let _ = on;
        Err(VfsError::NotFound)
    }

    /// Handle `PRAGMA name = value`. `Ok(Some(text))` is the pragma's result.
    fn pragma(&mut self, name: &str, value: Option<&str>) -> Result<Option<String>> {
        let _ = (name, value);
        Err(VfsError::NotFound)
    }

    /// Second phase of a commit, issued once the journal is finalized.
    fn commit_phase_two(&mut self) -> Result<()> {
        Err(VfsError::NotFound)
    }

    /// A checkpoint is about to copy WAL frames into this file.
    fn checkpoint_start(&mut self) {}

    /// The checkpoint started by [`checkpoint_start`](Self::checkpoint_start)
    /// finished.
    fn checkpoint_done(&mut self) {}

    /// The WAL index of this file, if the VFS provides one.
    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        None
    }

    /// Batch atomic writes, if the storage supports them.
    fn batch_atomic_write(&mut self) -> Option<&mut dyn BatchAtomicWrite> {
        None
    }
}

impl<F: VfsFile + ?Sized> VfsFile for Box<F> {
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read(buf, offset)
    }
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        (**self).read_exact_at(buf, offset)
    }
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        (**self).write(buf, offset)
    }
    fn truncate(&mut self, size: u64) -> Result<()> {
        (**self).truncate(size)
    }
    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        (**self).sync(flags)
    }
    fn file_size(&self) -> Result<u64> {
        (**self).file_size()
    }
    fn lock(&mut self, level: LockLevel) -> Result<()> {
        (**self).lock(level)
    }
    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        (**self).unlock(level)
    }
    fn check_reserved_lock(&self) -> Result<bool> {
        (**self).check_reserved_lock()
    }
    fn lock_state(&self) -> LockLevel {
        (**self).lock_state()
    }
    fn set_lock_timeout(&mut self, timeout: Duration) -> Option<Duration> {
        (**self).set_lock_timeout(timeout)
    }
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn device_characteristics(&self) -> DeviceCharacteristics {
        (**self).device_characteristics()
    }
    fn size_hint(&mut self, size: u64) -> Result<()> {
        (**self).size_hint(size)
    }
    fn has_moved(&self) -> Result<bool> {
        (**self).has_moved()
    }
    fn powersafe_overwrite(&self) -> Option<bool> {
        (**self).powersafe_overwrite()
    }
    fn set_powersafe_overwrite(&mut self, on: bool) -> Result<()> {
        (**self).set_powersafe_overwrite(on)
    }
    fn persist_wal(&self) -> Option<bool> {
        (**self).persist_wal()
    }
    fn set_persist_wal(&mut self, on: bool) -> Result<()> {
        (**self).set_persist_wal(on)
    }
    fn pragma(&mut self, name: &str, value: Option<&str>) -> Result<Option<String>> {
        (**self).pragma(name, value)
    }
    fn commit_phase_two(&mut self) -> Result<()> {
        (**self).commit_phase_two()
    }
    fn checkpoint_start(&mut self) {
        (**self).checkpoint_start();
    }
    fn checkpoint_done(&mut self) {
        (**self).checkpoint_done();
    }
    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        (**self).shared_memory()
    }
    fn batch_atomic_write(&mut self) -> Option<&mut dyn BatchAtomicWrite> {
        (**self).batch_atomic_write()
    }
}

// ---------------------------------------------------------------------------
// Type-erased VFS
// ---------------------------------------------------------------------------

/// Object-safe form of [`Vfs`], used where implementations are looked up by
/// name at runtime.
///
/// Every `Vfs` is a `DynVfs`; `dyn DynVfs` is itself a `Vfs` whose files are
/// `Box<dyn VfsFile>`.
pub trait DynVfs: Send + Sync {
    fn name_dyn(&self) -> &'static str;
    fn open_dyn(
        &self,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Box<dyn VfsFile>, VfsOpenFlags)>;
    fn delete_dyn(&self, path: &Path, sync_dir: bool) -> Result<()>;
    fn access_dyn(&self, path: &Path, flags: AccessFlags) -> Result<bool>;
    fn full_pathname_dyn(&self, path: &Path) -> Result<PathBuf>;
}

impl<V: Vfs> DynVfs for V {
    fn name_dyn(&self) -> &'static str {
        self.name()
    }

    fn open_dyn(
        &self,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Box<dyn VfsFile>, VfsOpenFlags)> {
        let (file, out) = self.open(path, flags)?;
        Ok((Box::new(file), out))
    }

    fn delete_dyn(&self, path: &Path, sync_dir: bool) -> Result<()> {
        self.delete(path, sync_dir)
    }

    fn access_dyn(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        self.access(path, flags)
    }

    fn full_pathname_dyn(&self, path: &Path) -> Result<PathBuf> {
        self.full_pathname(path)
    }
}

impl<V: Vfs + ?Sized> Vfs for Arc<V> {
    type File = V::File;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn open(&self, path: Option<&Path>, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        (**self).open(path, flags)
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        (**self).delete(path, sync_dir)
    }

    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        (**self).access(path, flags)
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        (**self).full_pathname(path)
    }
}

impl Vfs for dyn DynVfs {
    type File = Box<dyn VfsFile>;

    fn name(&self) -> &'static str {
        self.name_dyn()
    }

    fn open(&self, path: Option<&Path>, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        self.open_dyn(path, flags)
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        self.delete_dyn(path, sync_dir)
    }

    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        self.access_dyn(path, flags)
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        self.full_pathname_dyn(path)
    }
}
