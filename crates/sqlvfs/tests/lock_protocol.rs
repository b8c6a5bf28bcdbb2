use std::path::Path;
use std::time::Duration;

use sqlvfs::{LockLevel, MemoryVfs, Vfs, VfsError, VfsFile, VfsOpenFlags};

fn create_flags() -> VfsOpenFlags {
    VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE
}

fn open_pair(vfs: &MemoryVfs, name: &str) -> (sqlvfs::MemoryFile, sqlvfs::MemoryFile) {
    let (a, _) = vfs.open(Some(Path::new(name)), create_flags()).unwrap();
    let (b, _) = vfs.open(Some(Path::new(name)), create_flags()).unwrap();
    (a, b)
}

fn assert_precondition(result: sqlvfs::Result<()>) {
    assert!(
        matches!(result, Err(VfsError::PreconditionViolation(_))),
        "expected precondition violation, got {result:?}"
    );
}

#[test]
fn transition_legality() {
    let vfs = MemoryVfs::new();
    let (mut file, _) = vfs.open(Some(Path::new("legal.db")), create_flags()).unwrap();

    assert_precondition(file.lock(LockLevel::Reserved));
    assert_precondition(file.lock(LockLevel::Exclusive));
    assert_precondition(file.lock(LockLevel::Pending));
    assert_eq!(file.lock_state(), LockLevel::None);

    file.lock(LockLevel::Shared).unwrap();
    assert_precondition(file.lock(LockLevel::Pending));
    file.lock(LockLevel::Reserved).unwrap();
    file.lock(LockLevel::Shared).unwrap();
    assert_eq!(file.lock_state(), LockLevel::Reserved);

    assert_precondition(file.unlock(LockLevel::Reserved));
    assert_precondition(file.unlock(LockLevel::Exclusive));
    file.unlock(LockLevel::None).unwrap();
    file.unlock(LockLevel::None).unwrap();
}

#[test]
fn two_handles_share_then_contend_for_reserved() {
    let vfs = MemoryVfs::new();
    let (mut a, mut b) = open_pair(&vfs, "contend.db");

    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    assert!(!a.check_reserved_lock().unwrap());

    a.lock(LockLevel::Reserved).unwrap();
    let err = b.lock(LockLevel::Reserved).unwrap_err();
    assert!(matches!(err, VfsError::Busy));
    assert!(err.is_transient());
    assert_eq!(b.lock_state(), LockLevel::Shared);
    assert!(b.check_reserved_lock().unwrap());

    a.unlock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Reserved).unwrap();
    assert!(a.check_reserved_lock().unwrap());
}

#[test]
fn exclusive_shared_exclusive_round_trip() {
    let vfs = MemoryVfs::new();
    let (mut writer, mut reader) = open_pair(&vfs, "round.db");

    writer.lock(LockLevel::Shared).unwrap();
    writer.lock(LockLevel::Exclusive).unwrap();
    assert!(matches!(reader.lock(LockLevel::Shared), Err(VfsError::Busy)));

    writer.unlock(LockLevel::Shared).unwrap();
    reader.lock(LockLevel::Shared).unwrap();

    // A reader keeps the upgrade at PENDING, which in turn shuts out new readers.
    assert!(matches!(writer.lock(LockLevel::Exclusive), Err(VfsError::Busy)));
    assert_eq!(writer.lock_state(), LockLevel::Pending);
    let (mut late, _) = vfs.open(Some(Path::new("round.db")), create_flags()).unwrap();
    assert!(matches!(late.lock(LockLevel::Shared), Err(VfsError::Busy)));

    reader.unlock(LockLevel::None).unwrap();
    writer.lock(LockLevel::Exclusive).unwrap();
    assert_eq!(writer.lock_state(), LockLevel::Exclusive);
    writer.unlock(LockLevel::None).unwrap();
    late.lock(LockLevel::Shared).unwrap();
}

#[test]
fn exclusive_waits_out_a_reader_within_timeout() {
    let vfs = MemoryVfs::new();
    let (mut writer, mut reader) = open_pair(&vfs, "wait.db");
    assert_eq!(
        writer.set_lock_timeout(Duration::from_secs(5)),
        Some(Duration::ZERO)
    );

    writer.lock(LockLevel::Shared).unwrap();
    reader.lock(LockLevel::Shared).unwrap();
    let release = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        reader.unlock(LockLevel::None).unwrap();
        reader
    });
    writer.lock(LockLevel::Exclusive).unwrap();
    drop(release.join().unwrap());
}

#[test]
fn close_releases_every_lock() {
    let vfs = MemoryVfs::new();
    let (mut a, mut b) = open_pair(&vfs, "close.db");
    a.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Exclusive).unwrap();
    a.close().unwrap();
    assert_eq!(a.lock_state(), LockLevel::None);

    b.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Exclusive).unwrap();
}

#[cfg(target_os = "linux")]
mod unix_files {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::Arc;

    use sqlvfs::backend::{FcntlBackend, LockBackend, RangeLock};
    use sqlvfs::{UnixVfs, VfsConfig};
    use sqlvfs_types::{PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE};

    use super::*;

    /// A lock owner on a separately opened descriptor, standing in for
    /// another process.
    fn foreign(path: &Path) -> FcntlBackend {
        let file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        FcntlBackend::new(Arc::new(file))
    }

    fn temp_db(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn reserved_held_elsewhere_is_busy_and_visible() {
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("foreign_reserved.db");
        let (mut file, _) = vfs.open(Some(&path), create_flags()).unwrap();

        let other = foreign(&path);
        other.try_lock(RangeLock::Read, SHARED_FIRST, SHARED_SIZE).unwrap();
        other.try_lock(RangeLock::Write, RESERVED_BYTE, 1).unwrap();

        file.lock(LockLevel::Shared).unwrap();
        assert!(file.check_reserved_lock().unwrap());
        assert!(matches!(file.lock(LockLevel::Reserved), Err(VfsError::Busy)));

        other.unlock(RESERVED_BYTE, 1).unwrap();
        assert!(!file.check_reserved_lock().unwrap());
        file.lock(LockLevel::Reserved).unwrap();

        // The foreign reader blocks the final step of the upgrade.
        assert!(matches!(file.lock(LockLevel::Exclusive), Err(VfsError::Busy)));
        assert_eq!(file.lock_state(), LockLevel::Pending);
        assert_eq!(
            other.conflicting(RangeLock::Read, PENDING_BYTE, 1).unwrap(),
            Some(RangeLock::Write)
        );

        other.unlock(SHARED_FIRST, SHARED_SIZE).unwrap();
        file.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(
            other.conflicting(RangeLock::Read, SHARED_FIRST, SHARED_SIZE).unwrap(),
            Some(RangeLock::Write)
        );

        file.close().unwrap();
        assert_eq!(
            other.conflicting(RangeLock::Write, PENDING_BYTE, 2 + SHARED_SIZE).unwrap(),
            None
        );
    }

    #[test]
    fn pending_elsewhere_refuses_new_readers() {
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("foreign_pending.db");
        let (mut file, _) = vfs.open(Some(&path), create_flags()).unwrap();

        let other = foreign(&path);
        other.try_lock(RangeLock::Write, PENDING_BYTE, 1).unwrap();
        assert!(matches!(file.lock(LockLevel::Shared), Err(VfsError::Busy)));
        assert_eq!(file.lock_state(), LockLevel::None);

        other.unlock(PENDING_BYTE, 1).unwrap();
        file.lock(LockLevel::Shared).unwrap();
    }

    #[test]
    fn exclusive_upgrade_retries_until_timeout() {
        let config = VfsConfig::default().with_lock_timeout(Duration::from_secs(5));
        let vfs = UnixVfs::with_config(config);
        let (_dir, path) = temp_db("foreign_retry.db");
        let (mut file, _) = vfs.open(Some(&path), create_flags()).unwrap();

        let other = foreign(&path);
        other.try_lock(RangeLock::Read, SHARED_FIRST, SHARED_SIZE).unwrap();
        file.lock(LockLevel::Shared).unwrap();

        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            other.unlock(SHARED_FIRST, SHARED_SIZE).unwrap();
            other
        });
        file.lock(LockLevel::Exclusive).unwrap();
        drop(release.join().unwrap());
    }
}
