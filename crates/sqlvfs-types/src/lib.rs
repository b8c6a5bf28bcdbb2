pub mod flags;

pub use flags::{AccessFlags, DeviceCharacteristics, ShmLockFlags, SyncFlags, VfsOpenFlags};

use std::fmt;

// ---------------------------------------------------------------------------
// Lock bytes
// ---------------------------------------------------------------------------

/// Offset of the pending byte (1 GiB). Pages overlapping this byte are never
/// used by the pager, so the lock bytes never alias database content.
pub const PENDING_BYTE: u64 = 0x4000_0000;

/// Byte locked (write) by the single RESERVED holder.
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;

/// First byte of the shared range.
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;

/// Length of the shared range.
pub const SHARED_SIZE: u64 = 510;

// ---------------------------------------------------------------------------
// WAL-index shared memory
// ---------------------------------------------------------------------------

/// Number of WAL-index lock slots.
pub const SHM_NLOCK: usize = 8;

/// Byte offset in the `-shm` file of the first slot lock byte.
pub const SHM_BASE: u64 = 120;

/// Byte offset of the dead-man's-switch lock byte.
pub const SHM_DMS: u64 = SHM_BASE + SHM_NLOCK as u64;

/// Size in bytes of one WAL-index region.
pub const SHM_REGION_SIZE: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Database header
// ---------------------------------------------------------------------------

/// The 16-byte magic string at offset 0 of every database file.
pub const SQLITE_DB_HEADER_MAGIC: [u8; 16] = *b"SQLite format 3\0";

/// Offset of the big-endian page size field.
pub const HEADER_PAGE_SIZE_OFFSET: usize = 16;

/// Offset of the per-page reserved byte count.
pub const HEADER_RESERVED_OFFSET: usize = 20;

/// Lock level for database file locking (SQLite's five-state lock).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (waiting for shared locks to clear).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
}

impl LockLevel {
    /// Decode a raw level, as passed across a C boundary.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Shared),
            2 => Some(Self::Reserved),
            3 => Some(Self::Pending),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Shared => "SHARED",
            Self::Reserved => "RESERVED",
            Self::Pending => "PENDING",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database page size in bytes.
///
/// Must be a power of two between 512 and 65536 (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSize(u32);

impl PageSize {
    pub const MIN: Self = Self(512);
    pub const DEFAULT: Self = Self(4096);
    pub const MAX: Self = Self(65_536);

    /// Create a new page size, validating that it is a power of two in
    /// the range \[512, 65536\].
    pub const fn new(size: u32) -> Option<Self> {
        if size < 512 || size > 65_536 || !size.is_power_of_two() {
            None
        } else {
            Some(Self(size))
        }
    }

    /// Decode the two-byte header encoding, where `1` means 65536.
    pub const fn from_header_field(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::MAX),
            n => Self::new(n as u32),
        }
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read the page size recorded in a database header prefix.
///
/// Returns `None` if `header` is too short, lacks the magic string, or holds
/// an invalid encoding.
#[must_use]
pub fn header_page_size(header: &[u8]) -> Option<PageSize> {
    if header.len() < HEADER_PAGE_SIZE_OFFSET + 2 || !has_header_magic(header) {
        return None;
    }
    let raw = u16::from_be_bytes([
        header[HEADER_PAGE_SIZE_OFFSET],
        header[HEADER_PAGE_SIZE_OFFSET + 1],
    ]);
    PageSize::from_header_field(raw)
}

/// Whether `header` starts with [`SQLITE_DB_HEADER_MAGIC`].
#[must_use]
pub fn has_header_magic(header: &[u8]) -> bool {
    header.starts_with(&SQLITE_DB_HEADER_MAGIC)
}

/// The reserved-bytes-per-page field, if `header` is long enough.
#[must_use]
pub fn header_reserved_bytes(header: &[u8]) -> Option<u8> {
    header.get(HEADER_RESERVED_OFFSET).copied()
}
