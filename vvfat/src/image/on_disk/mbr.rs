use crate::ByteSerializable;
use byteorder::{ByteOrder, LittleEndian};

pub const PARTITION_FAT12: u8 = 0x01;
pub const PARTITION_FAT16: u8 = 0x06;
pub const PARTITION_FAT16_LBA: u8 = 0x0e;
pub const PARTITION_FAT32: u8 = 0x0b;
pub const PARTITION_FAT32_LBA: u8 = 0x0c;

const NT_DISK_ID: u32 = 0xbe1afdfa;

/// A packed cylinder/head/sector address as stored in a partition entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chs {
    pub head: u8,
    pub sector: u8,
    pub cylinder: u8,
}

impl Chs {
    /// Converts an absolute sector number to CHS. Returns the overflow marker
    /// address (0xff/0xff/0xff) and `true` when the position does not fit in
    /// 24-bit CHS; partitions containing such an address are LBA-only.
    pub fn from_sector(spos: u32, heads: u32, spt: u32) -> (Self, bool) {
        let sector = spos % spt;
        let rest = spos / spt;
        let head = rest % heads;
        let cylinder = rest / heads;

        if cylinder > 1023 {
            return (
                Self {
                    head: 0xff,
                    sector: 0xff,
                    cylinder: 0xff,
                },
                true,
            );
        }

        return (
            Self {
                head: head as u8,
                sector: ((sector + 1) | ((cylinder >> 8) << 6)) as u8,
                cylinder: cylinder as u8,
            },
            false,
        );
    }
}

/// One of the four 16-byte slots in the MBR partition table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    /// 0x80 marks the partition bootable.
    pub attributes: u8,
    pub start_chs: Chs,
    pub fs_type: u8,
    pub end_chs: Chs,
    pub start_sector: u32,
    pub sector_count: u32,
}

impl ByteSerializable for PartitionEntry {
    type BytesArrayType = [u8; 16];

    fn to_bytes(&self) -> Self::BytesArrayType {
        let mut bytes = [0u8; 16];

        bytes[0] = self.attributes;
        bytes[1] = self.start_chs.head;
        bytes[2] = self.start_chs.sector;
        bytes[3] = self.start_chs.cylinder;
        bytes[4] = self.fs_type;
        bytes[5] = self.end_chs.head;
        bytes[6] = self.end_chs.sector;
        bytes[7] = self.end_chs.cylinder;
        LittleEndian::write_u32(&mut bytes[8..], self.start_sector);
        LittleEndian::write_u32(&mut bytes[12..], self.sector_count);

        return bytes;
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }

        return Some(Self {
            attributes: bytes[0],
            start_chs: Chs {
                head: bytes[1],
                sector: bytes[2],
                cylinder: bytes[3],
            },
            fs_type: bytes[4],
            end_chs: Chs {
                head: bytes[5],
                sector: bytes[6],
                cylinder: bytes[7],
            },
            start_sector: LittleEndian::read_u32(&bytes[8..]),
            sector_count: LittleEndian::read_u32(&bytes[12..]),
        });
    }
}

/// The master boot record occupying sector 0 when the volume does not start
/// at the beginning of the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mbr {
    pub nt_id: u32,
    pub partitions: [PartitionEntry; 4],
}

impl Mbr {
    /// Builds the MBR for a single bootable FAT partition covering
    /// `[offset_to_bootsector, sector_count)`.
    pub fn for_single_partition(
        offset_to_bootsector: u32,
        sector_count: u32,
        fat_type: u8,
        heads: u32,
        spt: u32,
    ) -> Self {
        let (start_chs, start_lba) = Chs::from_sector(offset_to_bootsector, heads, spt);
        let (end_chs, end_lba) = Chs::from_sector(sector_count - 1, heads, spt);
        let lba = start_lba || end_lba;

        // DOS uses distinct types for LBA partitions so older systems do not
        // attempt CHS access on them.
        let fs_type = match fat_type {
            12 => PARTITION_FAT12,
            16 => {
                if lba {
                    PARTITION_FAT16_LBA
                } else {
                    PARTITION_FAT16
                }
            }
            _ => {
                if lba {
                    PARTITION_FAT32_LBA
                } else {
                    PARTITION_FAT32
                }
            }
        };

        let mut partitions = [PartitionEntry::default(); 4];
        partitions[0] = PartitionEntry {
            attributes: 0x80,
            start_chs,
            fs_type,
            end_chs,
            start_sector: offset_to_bootsector,
            sector_count: sector_count - offset_to_bootsector,
        };

        return Self {
            nt_id: NT_DISK_ID,
            partitions,
        };
    }
}

impl ByteSerializable for Mbr {
    type BytesArrayType = [u8; 512];

    fn to_bytes(&self) -> Self::BytesArrayType {
        let mut bytes = [0u8; 512];

        LittleEndian::write_u32(&mut bytes[0x1b8..], self.nt_id);

        let mut offset = 0x1be;
        for partition in self.partitions.iter() {
            bytes[offset..offset + 16].copy_from_slice(&partition.to_bytes());
            offset += 16;
        }

        bytes[0x1fe] = 0x55;
        bytes[0x1ff] = 0xaa;

        return bytes;
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 512 {
            return None;
        }

        if (bytes[0x1fe] != 0x55) || (bytes[0x1ff] != 0xaa) {
            return None;
        }

        let mut partitions = [PartitionEntry::default(); 4];
        for (i, slot) in partitions.iter_mut().enumerate() {
            *slot = PartitionEntry::from_bytes(&bytes[0x1be + i * 16..])?;
        }

        return Some(Self {
            nt_id: LittleEndian::read_u32(&bytes[0x1b8..]),
            partitions,
        });
    }
}
