use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sqlvfs_error::{Result, VfsError};
use tracing::debug;

use crate::cksm::ChecksumVfs;
use crate::memory::MemoryVfs;
use crate::traits::DynVfs;

/// Names that always resolve to the built-in default.
const RESERVED_NAMES: [&str; 2] = ["", "os"];

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// The VFS used when no other is named: Unix where available, memory
/// otherwise.
#[must_use]
pub fn platform_default() -> Arc<dyn DynVfs> {
    #[cfg(unix)]
    {
        Arc::new(crate::unix::UnixVfs::new())
    }
    #[cfg(not(unix))]
    {
        Arc::new(MemoryVfs::new())
    }
}

/// Name-keyed lookup of VFS implementations.
///
/// The default VFS is always reachable under `""` and `"os"`; those names
/// cannot be registered or unregistered.
pub struct VfsRegistry {
    default: Arc<dyn DynVfs>,
    entries: RwLock<HashMap<String, Arc<dyn DynVfs>>>,
}

impl std::fmt::Debug for VfsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsRegistry")
            .field("default", &self.default.name_dyn())
            .field("names", &self.names())
            .finish()
    }
}

impl Default for VfsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VfsRegistry {
    /// A registry holding only the platform default.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default(platform_default())
    }

    #[must_use]
    pub fn with_default(default: Arc<dyn DynVfs>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(default.name_dyn().to_owned(), Arc::clone(&default));
        Self {
            default,
            entries: RwLock::new(entries),
        }
    }

    /// The platform default plus `"memdb"` and `"cksmvfs"` (checksums over
    /// the default).
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let memdb: Arc<dyn DynVfs> = Arc::new(MemoryVfs::new());
        let cksm: Arc<dyn DynVfs> = Arc::new(ChecksumVfs::new(Arc::clone(&registry.default)));
        {
            let mut entries = registry.entries.write();
            entries.insert(memdb.name_dyn().to_owned(), memdb);
            entries.insert(cksm.name_dyn().to_owned(), cksm);
        }
        registry
    }

    /// The built-in default VFS.
    #[must_use]
    pub fn default_vfs(&self) -> Arc<dyn DynVfs> {
        Arc::clone(&self.default)
    }

    /// Register `vfs` under `name`, returning the VFS it replaced.
    pub fn register(&self, name: &str, vfs: Arc<dyn DynVfs>) -> Result<Option<Arc<dyn DynVfs>>> {
        if is_reserved(name) {
            return Err(VfsError::precondition(format!(
                "cannot register reserved VFS name {name:?}"
            )));
        }
        debug!(target: "sqlvfs::registry", name, vfs = vfs.name_dyn(), "vfs registered");
        Ok(self.entries.write().insert(name.to_owned(), vfs))
    }

    /// Remove the VFS registered under `name`.
    pub fn unregister(&self, name: &str) -> Result<Option<Arc<dyn DynVfs>>> {
        if is_reserved(name) {
            return Err(VfsError::precondition(format!(
                "cannot unregister reserved VFS name {name:?}"
            )));
        }
        let removed = self.entries.write().remove(name);
        if removed.is_some() {
            debug!(target: "sqlvfs::registry", name, "vfs unregistered");
        }
        Ok(removed)
    }

    /// Look up a VFS by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn DynVfs>> {
        if is_reserved(name) {
            return Some(self.default_vfs());
        }
        self.entries.read().get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::traits::{Vfs, VfsFile};
    use sqlvfs_types::VfsOpenFlags;

    #[test]
    fn test_reserved_names_resolve_to_default() {
        let registry = VfsRegistry::new();
        let default = registry.find("").unwrap();
        assert!(Arc::ptr_eq(&default, &registry.find("os").unwrap()));
        assert!(Arc::ptr_eq(&default, &registry.default_vfs()));
        #[cfg(unix)]
        assert_eq!(default.name_dyn(), "unix");
    }

    #[test]
    fn test_reserved_names_cannot_be_changed() {
        let registry = VfsRegistry::new();
        for name in ["", "os"] {
            assert!(matches!(
                registry.register(name, Arc::new(MemoryVfs::new())),
                Err(VfsError::PreconditionViolation(_))
            ));
            assert!(matches!(
                registry.unregister(name),
                Err(VfsError::PreconditionViolation(_))
            ));
        }
        assert!(registry.find("os").is_some());
    }

    #[test]
    fn test_register_find_unregister() {
        let registry = VfsRegistry::new();
        assert!(registry.find("mine").is_none());

        let replaced = registry.register("mine", Arc::new(MemoryVfs::new())).unwrap();
        assert!(replaced.is_none());
        assert_eq!(registry.find("mine").unwrap().name_dyn(), "memdb");

        let replaced = registry.register("mine", Arc::new(MemoryVfs::new())).unwrap();
        assert!(replaced.is_some());

        assert!(registry.unregister("mine").unwrap().is_some());
        assert!(registry.find("mine").is_none());
        assert!(registry.unregister("mine").unwrap().is_none());
    }

    #[test]
    fn test_with_defaults_lists_builtins() {
        let registry = VfsRegistry::with_defaults();
        let names = registry.names();
        assert!(names.contains(&"memdb".to_owned()));
        assert!(names.contains(&"cksmvfs".to_owned()));
        assert!(names.contains(&registry.default_vfs().name_dyn().to_owned()));
    }

    #[test]
    fn test_open_through_registry() {
        let registry = VfsRegistry::with_defaults();
        let memdb = registry.find("memdb").unwrap();
        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (mut file, out) = memdb.open(Some(Path::new("reg.db")), flags).unwrap();
        assert!(out.contains(VfsOpenFlags::READWRITE));
        file.write(b"via registry", 0).unwrap();
        assert_eq!(file.file_size().unwrap(), 12);
        file.close().unwrap();
    }
}
