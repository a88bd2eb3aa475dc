extern crate vvfat;

use std::path::Path;
use vvfat::{system_time_from_fat, VvfatConfig, VvfatImage};

mod common;
use common::*;

fn open_default(dir: &Path) -> VvfatImage {
    return VvfatImage::open(
        dir,
        VvfatConfig {
            disk_size: 10 << 20,
            ..VvfatConfig::default()
        },
    )
    .unwrap();
}

/// Patches a 32-byte directory entry into `sector` at `slot`.
fn put_entry(
    sector: &mut [u8; 512],
    slot: usize,
    name: &[u8; 8],
    ext: &[u8; 3],
    attributes: u8,
    begin: u16,
    size: u32,
    dates: (u16, u16), // (date, time) used for ctime, mtime and adate
) {
    let offset = slot * 32;
    let (date, time) = dates;

    sector[offset..offset + 8].copy_from_slice(name);
    sector[offset + 8..offset + 11].copy_from_slice(ext);
    sector[offset + 11] = attributes;
    sector[offset + 12] = 0;
    sector[offset + 13] = 0;
    sector[offset + 14..offset + 16].copy_from_slice(&time.to_le_bytes());
    sector[offset + 16..offset + 18].copy_from_slice(&date.to_le_bytes());
    sector[offset + 18..offset + 20].copy_from_slice(&date.to_le_bytes());
    sector[offset + 20..offset + 22].copy_from_slice(&0u16.to_le_bytes());
    sector[offset + 22..offset + 24].copy_from_slice(&time.to_le_bytes());
    sector[offset + 24..offset + 26].copy_from_slice(&date.to_le_bytes());
    sector[offset + 26..offset + 28].copy_from_slice(&begin.to_le_bytes());
    sector[offset + 28..offset + 32].copy_from_slice(&size.to_le_bytes());
}

#[test]
fn test_commit_creates_guest_file() {
    let dir = TestDir::new("commit-create");
    let mut image = open_default(dir.path());

    let root_sector = image.offset_to_root_dir() as u64;
    let fat_sector = image.offset_to_fat() as u64;
    let data_sector = image.offset_to_data() as u64;

    // the guest stores NEW.BIN at cluster 2, 1024 bytes
    let mut root = read_sector(&mut image, root_sector);
    put_entry(
        &mut root,
        1,
        b"NEW     ",
        b"BIN",
        0x20,
        2,
        1024,
        (0x3d81, 0x6000),
    );
    write_sector(&mut image, root_sector, &root);

    let mut fat = read_sector(&mut image, fat_sector);
    fat[4] = 0xff;
    fat[5] = 0xff;
    write_sector(&mut image, fat_sector, &fat);

    write_sector(&mut image, data_sector, &[0x11; 512]);
    write_sector(&mut image, data_sector + 1, &[0x22; 512]);

    assert!(image.is_modified());
    image.commit().unwrap();
    assert!(!image.is_modified());

    let host_path = dir.path().join("new.bin");
    let contents = std::fs::read(&host_path).unwrap();

    assert_eq!(contents.len(), 1024);
    assert!(contents[..512].iter().all(|&b| b == 0x11));
    assert!(contents[512..].iter().all(|&b| b == 0x22));

    // the guest's FAT mtime survives on the host file
    let modified = std::fs::metadata(&host_path).unwrap().modified().unwrap();
    assert_eq!(modified, system_time_from_fat(0x3d81, 0x6000).unwrap());
}

#[test]
fn test_commit_twice_is_idempotent() {
    let dir = TestDir::new("commit-idem");
    let mut image = open_default(dir.path());

    let root_sector = image.offset_to_root_dir() as u64;
    let mut root = read_sector(&mut image, root_sector);
    put_entry(
        &mut root,
        1,
        b"ONCE    ",
        b"BIN",
        0x20,
        0,
        0,
        (0x3d81, 0x6000),
    );
    write_sector(&mut image, root_sector, &root);

    image.commit().unwrap();
    let first = std::fs::metadata(dir.path().join("once.bin")).unwrap().modified().unwrap();

    // nothing was written since; the second commit must not touch the host
    image.commit().unwrap();
    let second = std::fs::metadata(dir.path().join("once.bin")).unwrap().modified().unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_commit_deletes_removed_file() {
    let dir = TestDir::new("commit-delete");
    dir.write_file("old.txt", b"doomed");
    let mut image = open_default(dir.path());

    let root_sector = image.offset_to_root_dir() as u64;
    let mut root = read_sector(&mut image, root_sector);

    // slot 1 holds the long name, slot 2 the 8.3 entry; wipe both
    assert_eq!(root[32 + 11], 0x0f);
    assert_eq!(&root[64..72], b"OLD     ");
    root[32] = 0xe5;
    root[64] = 0xe5;
    write_sector(&mut image, root_sector, &root);

    image.commit().unwrap();

    assert!(!dir.path().join("old.txt").exists());
}

#[test]
fn test_commit_rewrites_changed_file() {
    let dir = TestDir::new("commit-modify");
    dir.write_file("data.bin", &[b'a'; 100]);
    let mut image = open_default(dir.path());

    let root_sector = image.offset_to_root_dir() as u64;
    let data_sector = image.offset_to_data() as u64;

    // new content in the file's cluster, new mtime in its entry
    write_sector(&mut image, data_sector, &[b'b'; 512]);

    let mut root = read_sector(&mut image, root_sector);
    assert_eq!(&root[64..72], b"DATA    ");
    let old_mtime = u16::from_le_bytes([root[64 + 22], root[64 + 23]]);
    let new_mtime = old_mtime.wrapping_add(1);
    root[64 + 22..64 + 24].copy_from_slice(&new_mtime.to_le_bytes());
    write_sector(&mut image, root_sector, &root);

    image.commit().unwrap();

    let contents = std::fs::read(dir.path().join("data.bin")).unwrap();
    assert_eq!(contents, vec![b'b'; 100]);
}

#[test]
fn test_commit_unchanged_file_untouched() {
    let dir = TestDir::new("commit-unchanged");
    dir.write_file("keep.txt", b"stays");
    let mut image = open_default(dir.path());

    // a write far away from any mapping raises the modified flag only
    write_sector(&mut image, 4096, &[0xee; 512]);

    image.commit().unwrap();

    assert_eq!(std::fs::read(dir.path().join("keep.txt")).unwrap(), b"stays");
}

#[test]
fn test_commit_renames_moved_file() {
    let dir = TestDir::new("commit-rename");
    dir.write_file("alpha.txt", b"payload");
    let mut image = open_default(dir.path());

    let root_sector = image.offset_to_root_dir() as u64;
    let mut root = read_sector(&mut image, root_sector);

    // drop the long name and give the 8.3 entry a new name, leaving the
    // creation stamp in place
    assert_eq!(root[32 + 11], 0x0f);
    assert_eq!(&root[64..72], b"ALPHA   ");
    root[32] = 0xe5;
    root[64..72].copy_from_slice(b"BETA    ");
    write_sector(&mut image, root_sector, &root);

    image.commit().unwrap();

    assert!(!dir.path().join("alpha.txt").exists());
    assert_eq!(
        std::fs::read(dir.path().join("beta.txt")).unwrap(),
        b"payload"
    );
}

#[test]
fn test_commit_creates_guest_directory() {
    let dir = TestDir::new("commit-mkdir");
    let mut image = open_default(dir.path());

    let root_sector = image.offset_to_root_dir() as u64;
    let fat_sector = image.offset_to_fat() as u64;
    let data_sector = image.offset_to_data() as u64;

    // the guest creates an empty directory at cluster 2: a dot and dotdot
    // entry followed by free space
    let mut root = read_sector(&mut image, root_sector);
    put_entry(
        &mut root,
        1,
        b"SUB     ",
        b"   ",
        0x10,
        2,
        0,
        (0x3d81, 0x6000),
    );
    write_sector(&mut image, root_sector, &root);

    let mut fat = read_sector(&mut image, fat_sector);
    fat[4] = 0xff;
    fat[5] = 0xff;
    write_sector(&mut image, fat_sector, &fat);

    let mut cluster = [0u8; 512];
    put_entry(&mut cluster, 0, b".       ", b"   ", 0x10, 2, 0, (0x3d81, 0x6000));
    put_entry(&mut cluster, 1, b"..      ", b"   ", 0x10, 0, 0, (0x3d81, 0x6000));
    write_sector(&mut image, data_sector, &cluster);

    image.commit().unwrap();

    assert!(dir.path().join("sub").is_dir());
}
