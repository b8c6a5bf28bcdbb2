//! Bit flag sets passed across the VFS boundary.
//!
//! Numeric values match SQLite's `sqlite3.h` so they can be handed to or
//! received from a C engine unchanged.

bitflags::bitflags! {
    /// Flags passed to `Vfs::open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VfsOpenFlags: u32 {
        const READONLY       = 0x0000_0001;
        const READWRITE      = 0x0000_0002;
        const CREATE         = 0x0000_0004;
        const DELETEONCLOSE  = 0x0000_0008;
        const EXCLUSIVE      = 0x0000_0010;
        const URI            = 0x0000_0040;
        const MEMORY         = 0x0000_0080;
        const MAIN_DB        = 0x0000_0100;
        const TEMP_DB        = 0x0000_0200;
        const TRANSIENT_DB   = 0x0000_0400;
        const MAIN_JOURNAL   = 0x0000_0800;
        const TEMP_JOURNAL   = 0x0000_1000;
        const SUBJOURNAL     = 0x0000_2000;
        const SUPER_JOURNAL  = 0x0000_4000;
        const NOMUTEX        = 0x0000_8000;
        const FULLMUTEX      = 0x0001_0000;
        const WAL            = 0x0008_0000;
        const NOFOLLOW       = 0x0100_0000;
    }
}

impl VfsOpenFlags {
    /// The file-type bits; exactly one is expected on each open.
    pub const FILE_TYPE_MASK: Self = Self::MAIN_DB
        .union(Self::TEMP_DB)
        .union(Self::TRANSIENT_DB)
        .union(Self::MAIN_JOURNAL)
        .union(Self::TEMP_JOURNAL)
        .union(Self::SUBJOURNAL)
        .union(Self::SUPER_JOURNAL)
        .union(Self::WAL);

    /// Journal and WAL files, whose parent directory must be synced once
    /// after creation.
    #[must_use]
    pub const fn needs_dir_sync(self) -> bool {
        self.contains(Self::CREATE)
            && self.intersects(Self::MAIN_JOURNAL.union(Self::SUPER_JOURNAL).union(Self::WAL))
    }
}

bitflags::bitflags! {
    /// Query kinds for `Vfs::access`. `EXISTS` is the empty set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const EXISTS    = 0;
        const READWRITE = 1;
        const READ      = 2;
    }
}

bitflags::bitflags! {
    /// Flags for `VfsFile::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x0000_0002;
        const FULL     = 0x0000_0003;
        const DATAONLY = 0x0000_0010;
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self::NORMAL
    }
}

bitflags::bitflags! {
    /// Device characteristics bitmask returned by
    /// `VfsFile::device_characteristics`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC                = 0x0000_0001;
        const ATOMIC512             = 0x0000_0002;
        const ATOMIC4K              = 0x0000_0010;
        const SAFE_APPEND           = 0x0000_0200;
        const SEQUENTIAL            = 0x0000_0400;
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
        const POWERSAFE_OVERWRITE   = 0x0000_1000;
        const IMMUTABLE             = 0x0000_2000;
        const BATCH_ATOMIC          = 0x0000_4000;
        const SUBPAGE_READ          = 0x0000_8000;
    }
}

bitflags::bitflags! {
    /// Flags for `SharedMemory::shm_lock`.
    ///
    /// A valid request carries exactly one of `LOCK`/`UNLOCK` and exactly one
    /// of `SHARED`/`EXCLUSIVE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShmLockFlags: u32 {
        const UNLOCK    = 1;
        const LOCK      = 2;
        const SHARED    = 4;
        const EXCLUSIVE = 8;
    }
}

impl ShmLockFlags {
    pub const LOCK_SHARED: Self = Self::LOCK.union(Self::SHARED);
    pub const LOCK_EXCLUSIVE: Self = Self::LOCK.union(Self::EXCLUSIVE);
    pub const UNLOCK_SHARED: Self = Self::UNLOCK.union(Self::SHARED);
    pub const UNLOCK_EXCLUSIVE: Self = Self::UNLOCK.union(Self::EXCLUSIVE);

    /// Whether the flags form one of the four valid combinations.
    #[must_use]
    pub fn is_well_formed(self) -> bool {
        self == Self::LOCK_SHARED
            || self == Self::LOCK_EXCLUSIVE
            || self == Self::UNLOCK_SHARED
            || self == Self::UNLOCK_EXCLUSIVE
    }
}
