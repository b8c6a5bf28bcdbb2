#![cfg(unix)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use sqlvfs::{
    ChecksumVfs, UnixVfs, Vfs, VfsError, VfsFile, VfsOpenFlags, VfsRegistry, page_checksum,
};
use sqlvfs_types::{HEADER_PAGE_SIZE_OFFSET, HEADER_RESERVED_OFFSET, SQLITE_DB_HEADER_MAGIC};

const PAGE: usize = 4096;

fn main_flags() -> VfsOpenFlags {
    VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE
}

fn first_page() -> Vec<u8> {
    let mut page = vec![0_u8; PAGE];
    page[..16].copy_from_slice(&SQLITE_DB_HEADER_MAGIC);
    page[HEADER_PAGE_SIZE_OFFSET..HEADER_PAGE_SIZE_OFFSET + 2]
        .copy_from_slice(&u16::try_from(PAGE).unwrap().to_be_bytes());
    page[HEADER_RESERVED_OFFSET] = 8;
    page
}

fn write_db(vfs: &impl Vfs, path: &Path) {
    let (mut file, _) = vfs.open(Some(path), main_flags()).unwrap();
    file.write(&first_page(), 0).unwrap();
    let body: Vec<u8> = (0..PAGE).map(|i| (i % 251) as u8).collect();
    file.write(&body, PAGE as u64).unwrap();
    file.close().unwrap();
}

#[test]
fn page_survives_reopen_with_valid_trailer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cksm.db");
    let vfs = ChecksumVfs::new(UnixVfs::new());
    write_db(&vfs, &path);

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw.len(), 2 * PAGE);
    for page in raw.chunks(PAGE) {
        let (body, trailer) = page.split_at(PAGE - 8);
        assert_eq!(page_checksum(body).unwrap(), trailer);
    }

    let (mut file, _) = vfs.open(Some(&path), main_flags()).unwrap();
    let mut buf = vec![0_u8; PAGE];
    file.read_exact_at(&mut buf, 0).unwrap();
    assert!(file.flags().verify);
    file.read_exact_at(&mut buf, PAGE as u64).unwrap();
    assert_eq!(buf[..PAGE - 8], raw[PAGE..2 * PAGE - 8]);
}

#[test]
fn flipped_byte_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flip.db");
    let vfs = ChecksumVfs::new(UnixVfs::new());
    write_db(&vfs, &path);

    let raw = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut byte = [0_u8; 1];
    raw.read_exact_at(&mut byte, PAGE as u64 + 1000).unwrap();
    raw.write_all_at(&[byte[0] ^ 0x01], PAGE as u64 + 1000).unwrap();
    drop(raw);

    let (mut file, _) = vfs.open(Some(&path), main_flags()).unwrap();
    let mut buf = vec![0_u8; PAGE];
    file.read_exact_at(&mut buf, 0).unwrap();
    let err = file.read(&mut buf, PAGE as u64).unwrap_err();
    assert!(matches!(err, VfsError::DataCorruption { offset, .. } if offset == PAGE as u64));

    // Partial reads are not page reads and are never checked.
    let mut head = [0_u8; 16];
    file.read_exact_at(&mut head, PAGE as u64).unwrap();
}

#[test]
fn registry_exposes_checksums_over_the_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    let registry = VfsRegistry::with_defaults();
    let cksm = registry.find("cksmvfs").unwrap();

    let (mut file, _) = cksm.open(Some(&path), main_flags()).unwrap();
    file.write(&first_page(), 0).unwrap();
    assert_eq!(
        file.pragma("checksum_verification", None).unwrap(),
        Some("1".to_owned())
    );
    file.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(
        page_checksum(&raw[..PAGE - 8]).unwrap(),
        raw[PAGE - 8..PAGE]
    );
}
