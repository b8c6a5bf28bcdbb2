//! Per-page checksum VFS.
//!
//! Databases whose header reserves exactly 8 bytes per page (header byte 20)
//! carry an 8-byte checksum in the last 8 bytes of every page. The wrapper
//! fills the trailer on write and verifies it on read. Only main database
//! files are checksummed; journals, WAL files and temp files pass through.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlvfs_error::{Result, VfsError};
use sqlvfs_types::{
    AccessFlags, DeviceCharacteristics, LockLevel, PageSize, SyncFlags, VfsOpenFlags,
    has_header_magic, header_page_size, header_reserved_bytes,
};
use tracing::{debug, warn};

use crate::shm::SharedMemory;
use crate::traits::{BatchAtomicWrite, Vfs, VfsFile};

/// Reserved bytes per page that switch checksumming on.
pub const CHECKSUM_RESERVED_BYTES: u8 = 8;

/// Length of the checksum trailer.
pub const CHECKSUM_LEN: usize = 8;

/// Minimum header length that is inspected for the reserved-bytes field.
const HEADER_MIN_LEN: usize = 100;

/// Compute the 8-byte checksum of `data`.
///
/// `data` is consumed as pairs of little-endian `u32`s; its length must be a
/// multiple of 8.
pub fn page_checksum(data: &[u8]) -> Result<[u8; CHECKSUM_LEN]> {
    if data.len() % 8 != 0 {
        return Err(VfsError::precondition(format!(
            "checksum input length {} is not a multiple of 8",
            data.len()
        )));
    }
    let mut s1 = 0_u32;
    let mut s2 = 0_u32;
    for chunk in data.chunks_exact(8) {
        let a = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let b = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        s1 = s1.wrapping_add(a).wrapping_add(s2);
        s2 = s2.wrapping_add(b).wrapping_add(s1);
    }
    let mut out = [0_u8; CHECKSUM_LEN];
    out[..4].copy_from_slice(&s1.to_le_bytes());
    out[4..].copy_from_slice(&s2.to_le_bytes());
    Ok(out)
}

/// Whether a read or write of `len` bytes covers exactly one page.
const fn is_page_len(len: usize) -> bool {
    len.is_power_of_two() && len >= PageSize::MIN.as_usize() && len <= PageSize::MAX.as_usize()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Checksum state of one open database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumFlags {
    /// Fill the trailer of every page written.
    pub compute: bool,
    /// Check the trailer of every page read.
    pub verify: bool,
    pub page_size: PageSize,
    /// A checkpoint is copying pages that already carry checksums.
    pub in_checkpoint: bool,
}

impl Default for ChecksumFlags {
    fn default() -> Self {
        Self {
            compute: false,
            verify: false,
            page_size: PageSize::DEFAULT,
            in_checkpoint: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ChecksumVfs
// ---------------------------------------------------------------------------

/// A VFS that adds page checksums on top of another VFS.
#[derive(Debug)]
pub struct ChecksumVfs<V> {
    inner: V,
}

impl<V: Vfs> ChecksumVfs<V> {
    #[must_use]
    pub const fn new(inner: V) -> Self {
        Self { inner }
    }

    #[must_use]
    pub const fn inner(&self) -> &V {
        &self.inner
    }
}

impl<V: Vfs> Vfs for ChecksumVfs<V> {
    type File = ChecksumFile<V::File>;

    fn name(&self) -> &'static str {
        "cksmvfs"
    }

    fn open(&self, path: Option<&Path>, flags: VfsOpenFlags) -> Result<(Self::File, VfsOpenFlags)> {
        let (inner, out) = self.inner.open(path, flags)?;
        Ok((
            ChecksumFile::new(inner, flags.contains(VfsOpenFlags::MAIN_DB)),
            out,
        ))
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        self.inner.delete(path, sync_dir)
    }

    fn access(&self, path: &Path, flags: AccessFlags) -> Result<bool> {
        self.inner.access(path, flags)
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        self.inner.full_pathname(path)
    }
}

// ---------------------------------------------------------------------------
// ChecksumFile
// ---------------------------------------------------------------------------

/// A file opened through [`ChecksumVfs`].
#[derive(Debug)]
pub struct ChecksumFile<F> {
    inner: F,
    /// Only main database files are checksummed.
    enabled: bool,
    flags: ChecksumFlags,
}

impl<F: VfsFile> ChecksumFile<F> {
    #[must_use]
    pub fn new(inner: F, main_db: bool) -> Self {
        Self {
            inner,
            enabled: main_db,
            flags: ChecksumFlags::default(),
        }
    }

    #[must_use]
    pub const fn flags(&self) -> ChecksumFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn get_ref(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    /// Re-derive the flags from a database header seen at offset 0.
    fn observe_header(&mut self, buf: &[u8], offset: u64) {
        if !self.enabled || offset != 0 || buf.len() < HEADER_MIN_LEN || !has_header_magic(buf) {
            return;
        }
        let checksummed = header_reserved_bytes(buf) == Some(CHECKSUM_RESERVED_BYTES);
        if checksummed != self.flags.compute {
            self.flags.compute = checksummed;
            self.flags.verify = checksummed;
            debug!(target: "sqlvfs::cksm", checksummed, "checksum state changed");
        }
        if let Some(page_size) = header_page_size(buf) {
            self.flags.page_size = page_size;
        }
    }

    fn verify_page(&self, buf: &[u8], offset: u64) -> Result<()> {
        let (body, trailer) = buf.split_at(buf.len() - CHECKSUM_LEN);
        if page_checksum(body)? != trailer {
            warn!(
                target: "sqlvfs::cksm",
                offset,
                len = buf.len(),
                "page checksum mismatch"
            );
            return Err(VfsError::DataCorruption {
                offset,
                len: buf.len(),
            });
        }
        Ok(())
    }

    fn checksum_verification(&mut self, value: Option<&str>) -> Option<String> {
        if let Some(on) = value.and_then(parse_bool) {
            self.flags.verify = on && self.flags.compute;
        }
        Some(if self.flags.verify { "1" } else { "0" }.to_owned())
    }
}

impl<F: VfsFile> VfsFile for ChecksumFile<F> {
    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self.inner.read(buf, offset)?;
        if !self.enabled || n < buf.len() {
            return Ok(n);
        }
        self.observe_header(buf, offset);
        if self.flags.verify && !self.flags.in_checkpoint && is_page_len(buf.len()) {
            self.verify_page(buf, offset)?;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if !self.enabled {
            return self.inner.write(buf, offset);
        }
        self.observe_header(buf, offset);
        if self.flags.compute && !self.flags.in_checkpoint && is_page_len(buf.len()) {
            let mut page = buf.to_vec();
            let body_len = page.len() - CHECKSUM_LEN;
            let sum = page_checksum(&page[..body_len])?;
            page[body_len..].copy_from_slice(&sum);
            return self.inner.write(&page, offset);
        }
        self.inner.write(buf, offset)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.inner.truncate(size)
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        self.inner.sync(flags)
    }

    fn file_size(&self) -> Result<u64> {
        self.inner.file_size()
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.inner.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.inner.unlock(level)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        self.inner.check_reserved_lock()
    }

    fn lock_state(&self) -> LockLevel {
        self.inner.lock_state()
    }

    fn set_lock_timeout(&mut self, timeout: Duration) -> Option<Duration> {
        self.inner.set_lock_timeout(timeout)
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        self.inner.device_characteristics()
    }

    fn size_hint(&mut self, size: u64) -> Result<()> {
        self.inner.size_hint(size)
    }

    fn has_moved(&self) -> Result<bool> {
        self.inner.has_moved()
    }

    fn powersafe_overwrite(&self) -> Option<bool> {
        self.inner.powersafe_overwrite()
    }

    fn set_powersafe_overwrite(&mut self, on: bool) -> Result<()> {
        self.inner.set_powersafe_overwrite(on)
    }

    fn persist_wal(&self) -> Option<bool> {
        self.inner.persist_wal()
    }

    fn set_persist_wal(&mut self, on: bool) -> Result<()> {
        self.inner.set_persist_wal(on)
    }

    fn pragma(&mut self, name: &str, value: Option<&str>) -> Result<Option<String>> {
        if self.enabled {
            if name.eq_ignore_ascii_case("checksum_verification") {
                return Ok(self.checksum_verification(value));
            }
            // The page size of a checksummed database is fixed.
            if name.eq_ignore_ascii_case("page_size") && self.flags.compute && value.is_some() {
                return Ok(Some(self.flags.page_size.get().to_string()));
            }
        }
        self.inner.pragma(name, value)
    }

    fn commit_phase_two(&mut self) -> Result<()> {
        self.inner.commit_phase_two()
    }

    fn checkpoint_start(&mut self) {
        self.flags.in_checkpoint = true;
        self.inner.checkpoint_start();
    }

    fn checkpoint_done(&mut self) {
        self.flags.in_checkpoint = false;
        self.inner.checkpoint_done();
    }

    fn shared_memory(&mut self) -> Option<&mut dyn SharedMemory> {
        self.inner.shared_memory()
    }

    fn batch_atomic_write(&mut self) -> Option<&mut dyn BatchAtomicWrite> {
        self.inner.batch_atomic_write()
    }
}
