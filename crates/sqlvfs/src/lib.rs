pub mod backend;
pub mod cksm;
pub mod config;
pub mod control;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod shm;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use cksm::{ChecksumFile, ChecksumFlags, ChecksumVfs, page_checksum};
pub use config::VfsConfig;
pub use control::{ControlResponse, FileControl, file_control};
pub use lock::LockManager;
pub use memory::{MemoryFile, MemoryVfs};
pub use registry::VfsRegistry;
pub use shm::{SharedMemory, ShmRegion};
pub use traits::{BatchAtomicWrite, DynVfs, Vfs, VfsFile};
#[cfg(unix)]
pub use unix::{UnixFile, UnixVfs};

pub use sqlvfs_error::{ErrorCode, IoErrorKind, Result, VfsError};
pub use sqlvfs_types::{
    AccessFlags, DeviceCharacteristics, LockLevel, ShmLockFlags, SyncFlags, VfsOpenFlags,
};
