extern crate vvfat;

use std::fs::OpenOptions;
use std::io::SeekFrom;
use vvfat::{create_volatile_file, BlockDevice, Redolog, RedologSubtype, VvfatError};

mod common;
use common::*;

fn volatile_redolog(dir: &TestDir, disk_size: u64) -> Redolog {
    let file = create_volatile_file(&dir.path().join("overlay.dir")).unwrap();

    return Redolog::create(file, RedologSubtype::Volatile, disk_size).unwrap();
}

#[test]
fn test_unwritten_blocks_miss() {
    let dir = TestDir::new("redolog-miss");
    let mut redolog = volatile_redolog(&dir, 10 << 20);

    let mut buffer = [0u8; 512];
    redolog.seek(SeekFrom::Start(4096)).unwrap();

    assert_eq!(redolog.read(&mut buffer).unwrap(), 0);
}

#[test]
fn test_write_then_read_back() {
    let dir = TestDir::new("redolog-rw");
    let mut redolog = volatile_redolog(&dir, 10 << 20);

    redolog.seek(SeekFrom::Start(4096)).unwrap();
    assert_eq!(redolog.write(&[0x5a; 512]).unwrap(), 512);

    let mut buffer = [0u8; 512];
    redolog.seek(SeekFrom::Start(4096)).unwrap();
    assert_eq!(redolog.read(&mut buffer).unwrap(), 512);
    assert_eq!(buffer.to_vec(), vec![0x5a; 512]);

    // the neighbouring block of the same extent is still absent
    redolog.seek(SeekFrom::Start(4608)).unwrap();
    assert_eq!(redolog.read(&mut buffer).unwrap(), 0);
}

#[test]
fn test_cursor_advances_on_success() {
    let dir = TestDir::new("redolog-cursor");
    let mut redolog = volatile_redolog(&dir, 10 << 20);

    redolog.seek(SeekFrom::Start(0)).unwrap();
    redolog.write(&[1u8; 512]).unwrap();
    redolog.write(&[2u8; 512]).unwrap();

    let mut buffer = [0u8; 512];
    redolog.seek(SeekFrom::Start(512)).unwrap();
    redolog.read(&mut buffer).unwrap();

    assert_eq!(buffer.to_vec(), vec![2u8; 512]);
}

#[test]
fn test_misaligned_seek_rejected() {
    let dir = TestDir::new("redolog-align");
    let mut redolog = volatile_redolog(&dir, 10 << 20);

    match redolog.seek(SeekFrom::Start(100)) {
        Err(VvfatError::Misaligned) => (),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_seek_past_disk_rejected() {
    let dir = TestDir::new("redolog-bounds");
    let mut redolog = volatile_redolog(&dir, 1 << 20);

    match redolog.seek(SeekFrom::Start((2 << 20) as u64)) {
        Err(VvfatError::OutOfBounds) => (),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_commit_applies_dirty_blocks() {
    let dir = TestDir::new("redolog-commit");
    let disk_size = 10 << 20;
    let mut redolog = volatile_redolog(&dir, disk_size);

    // scatter writes across two extents
    redolog.seek(SeekFrom::Start(0)).unwrap();
    redolog.write(&[0x11; 512]).unwrap();
    redolog.seek(SeekFrom::Start(9 * 512)).unwrap();
    redolog.write(&[0x22; 512]).unwrap();
    redolog.seek(SeekFrom::Start(5000 * 512)).unwrap();
    redolog.write(&[0x33; 512]).unwrap();

    let mut base = RamDisk::new(disk_size as usize);
    redolog.commit(&mut base).unwrap();

    assert_eq!(base.data[0..512].to_vec(), vec![0x11; 512]);
    assert_eq!(base.data[9 * 512..10 * 512].to_vec(), vec![0x22; 512]);
    assert_eq!(
        base.data[5000 * 512..5001 * 512].to_vec(),
        vec![0x33; 512]
    );

    // untouched blocks stay zero
    assert!(base.data[512..2 * 512].iter().all(|&b| b == 0));
}

#[test]
fn test_growing_reopen() {
    let dir = TestDir::new("redolog-growing");
    let path = dir.path().join("persistent.redolog");

    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let mut redolog = Redolog::create(file, RedologSubtype::Growing, 10 << 20).unwrap();

        redolog.seek(SeekFrom::Start(8192)).unwrap();
        redolog.write(&[0x77; 512]).unwrap();
    }

    let mut reopened = Redolog::open(&path, RedologSubtype::Growing).unwrap();

    assert_eq!(reopened.get_size(), 10 << 20);

    let mut buffer = [0u8; 512];
    reopened.seek(SeekFrom::Start(8192)).unwrap();
    assert_eq!(reopened.read(&mut buffer).unwrap(), 512);
    assert_eq!(buffer.to_vec(), vec![0x77; 512]);

    // a growing log reopened from disk carries a FAT-format timestamp
    assert_ne!(reopened.get_timestamp(), 0);
}

#[test]
fn test_reopen_with_wrong_subtype() {
    let dir = TestDir::new("redolog-subtype");
    let path = dir.path().join("persistent.redolog");

    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        Redolog::create(file, RedologSubtype::Growing, 1 << 20).unwrap();
    }

    match Redolog::open(&path, RedologSubtype::Volatile) {
        Err(VvfatError::BadRedologHeader(_)) => (),
        other => panic!(
            "unexpected result: {:?}",
            other.map(|_| "opened successfully")
        ),
    }
}
