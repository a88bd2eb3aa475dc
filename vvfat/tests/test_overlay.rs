extern crate vvfat;

use std::path::Path;
use vvfat::{VvfatConfig, VvfatImage};

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

fn open_fat32(dir: &Path) -> VvfatImage {
    return VvfatImage::open(
        dir,
        VvfatConfig {
            fallback_chs: Some((4200, 16, 63)),
            ..VvfatConfig::default()
        },
    )
    .unwrap();
}

#[test]
fn test_overlay_hit_and_neighbour() {
    let dir = TestDir::new("overlay");
    let mut image = open_default(dir.path());

    write_sector(&mut image, 2048, &[0xaa; 512]);

    assert!(image.is_modified());
    assert_eq!(read_sector(&mut image, 2048).to_vec(), vec![0xaa; 512]);

    // the neighbouring sector still comes from the synthesized volume
    assert_eq!(read_sector(&mut image, 2049).to_vec(), vec![0u8; 512]);
}

#[test]
fn test_overlay_shadows_synthesized_fat() {
    let dir = TestDir::new("overlay-fat");
    dir.write_file("A.TXT", &[b'x'; 100]);
    let mut image = open_default(dir.path());

    let fat_sector = image.offset_to_fat() as u64;
    let mut mutated = read_sector(&mut image, fat_sector);
    mutated[4] = 0x00;
    mutated[5] = 0x00;
    write_sector(&mut image, fat_sector, &mutated);

    assert_eq!(read_sector(&mut image, fat_sector).to_vec(), mutated.to_vec());

    // the second FAT copy was not touched
    let second_sector = fat_sector + image.sectors_per_fat() as u64;
    let second = read_sector(&mut image, second_sector);
    assert_eq!(u16::from_le_bytes([second[4], second[5]]), 0xffff);
}

#[test]
fn test_write_to_mbr_keeps_partition_table() {
    let dir = TestDir::new("mbr-write");
    let mut image = open_default(dir.path());

    let original = read_sector(&mut image, 0);
    write_sector(&mut image, 0, &[0xbb; 512]);

    let after = read_sector(&mut image, 0);

    // boot code area takes the write, the partition table does not
    assert!(after[..0x1b8].iter().all(|&b| b == 0xbb));
    assert_eq!(after[0x1b8..].to_vec(), original[0x1b8..].to_vec());
    assert_eq!(after[0x1fe], 0x55);
    assert_eq!(after[0x1ff], 0xaa);

    // rewriting boot code alone does not require a commit
    assert!(!image.is_modified());
}

#[test]
fn test_boot_sector_write_mirrored() {
    let dir = TestDir::new("boot-write");
    let mut image = open_default(dir.path());

    let boot_sector = image.offset_to_bootsector() as u64;
    let mut replacement = read_sector(&mut image, boot_sector);
    replacement[43..54].copy_from_slice(b"RELABELLED ");
    write_sector(&mut image, boot_sector, &replacement);

    assert_eq!(
        read_sector(&mut image, boot_sector).to_vec(),
        replacement.to_vec()
    );
    assert!(!image.is_modified());
}

#[test]
fn test_write_to_reserved_area_dropped() {
    let dir = TestDir::new("reserved");
    let mut image = open_fat32(dir.path());

    assert_eq!(image.fat_bits(), 32);

    // the last reserved sector, which is neither boot nor info sector
    let sector = (image.offset_to_bootsector() + 31) as u64;
    let before = read_sector(&mut image, sector);
    write_sector(&mut image, sector, &[0xcc; 512]);

    assert_eq!(read_sector(&mut image, sector).to_vec(), before.to_vec());
    assert!(!image.is_modified());
}

#[test]
fn test_fat32_info_and_backup_sectors() {
    let dir = TestDir::new("fat32");
    let mut image = open_fat32(dir.path());

    let boot_sector = image.offset_to_bootsector() as u64;
    let info = read_sector(&mut image, boot_sector + 1);

    assert_eq!(
        u32::from_le_bytes([info[0], info[1], info[2], info[3]]),
        0x41615252
    );
    assert_eq!(
        u32::from_le_bytes([info[0x1e4], info[0x1e5], info[0x1e6], info[0x1e7]]),
        0x61417272
    );
    assert_eq!(info[0x1fe], 0x55);
    assert_eq!(info[0x1ff], 0xaa);

    // the backup boot sector mirrors the primary
    let primary = read_sector(&mut image, boot_sector);
    let backup = read_sector(&mut image, boot_sector + 6);
    assert_eq!(primary.to_vec(), backup.to_vec());
}

#[test]
fn test_fat32_root_directory_in_data_area() {
    let dir = TestDir::new("fat32-root");
    let mut image = open_fat32(dir.path());

    assert_eq!(image.root_entries(), 0);
    assert_eq!(image.first_cluster_of_root_dir(), 2);
    assert_eq!(image.offset_to_root_dir(), image.offset_to_data());

    // cluster 2 carries the root directory with its volume label
    let root_sector = image.offset_to_data() as u64;
    let root = read_sector(&mut image, root_sector);
    assert_eq!(&root[0..8], b"BOCHS VV");
    assert_eq!(root[11], 0x28);
}

#[test]
fn test_info_sector_write_mirrored() {
    let dir = TestDir::new("fat32-info-write");
    let mut image = open_fat32(dir.path());

    let info_sector = (image.offset_to_bootsector() + 1) as u64;
    let mut replacement = read_sector(&mut image, info_sector);
    replacement[0x1e8..0x1ec].copy_from_slice(&42u32.to_le_bytes());
    write_sector(&mut image, info_sector, &replacement);

    assert_eq!(
        read_sector(&mut image, info_sector).to_vec(),
        replacement.to_vec()
    );
    assert!(!image.is_modified());
}
