use crate::image::fat::FatType;
use crate::image::on_disk::boot_sector::{
    BootSector, FAT12_TYPE_STRING, FAT16_TYPE_STRING, FAT32_TYPE_STRING,
};
use crate::image::on_disk::mbr::{
    Mbr, PARTITION_FAT16, PARTITION_FAT16_LBA, PARTITION_FAT32, PARTITION_FAT32_LBA,
};
use crate::{ByteSerializable, VvfatError};

const FLOPPY_1_44M: u64 = 1_474_560;

/// Everything the synthesizer needs to know about the shape of the virtual
/// disk and its FAT volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub cylinders: u32,
    pub heads: u32,
    pub spt: u32,
    pub sector_count: u32,
    pub offset_to_bootsector: u32,
    pub fat_type: FatType,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub root_entries: u16,
    pub first_cluster_of_root_dir: u32,
    /// From the boot sector file when one is adopted; 0 when the FAT size
    /// is derived from the cluster count instead.
    pub sectors_per_fat: u32,
    /// Geometry and partition table come from a user-supplied MBR sector.
    pub use_mbr_file: bool,
    /// The boot sector is adopted verbatim from a user-supplied file.
    pub use_boot_file: bool,
    pub hd_size: u64,
}

impl Layout {
    pub fn cluster_size(&self) -> u32 {
        return (self.sectors_per_cluster as u32) * 512;
    }

    pub fn media_type(&self) -> u8 {
        return match self.fat_type {
            FatType::Fat12 => 0xf0,
            _ => 0xf8,
        };
    }
}

fn expected_type_string(fat_type: FatType) -> &'static [u8; 8] {
    return match fat_type {
        FatType::Fat12 => FAT12_TYPE_STRING,
        FatType::Fat16 => FAT16_TYPE_STRING,
        FatType::Fat32 => FAT32_TYPE_STRING,
    };
}

/// Chooses the disk geometry and FAT volume layout.
///
/// Priority: a valid `vvfat_mbr.bin` dictates geometry and partition
/// placement; a `vvfat_boot.bin` either stands alone or must agree with the
/// MBR; otherwise the geometry falls back to `fallback_chs`, a 1.44M floppy
/// shape for the matching size, or 1024/16/63.
pub fn plan_layout(
    disk_size: u64,
    fallback_chs: Option<(u32, u32, u32)>,
    mbr_sector: Option<&[u8]>,
    boot_sector: Option<&[u8]>,
) -> Result<Layout, VvfatError> {
    let mut fat_type: Option<FatType> = None;
    let mut sectors_per_cluster: u8 = 0;
    let mut reserved_sectors: u16 = 0;
    let mut root_entries: u16 = 0;
    let mut first_cluster_of_root_dir: u32 = 0;
    let mut sectors_per_fat: u32 = 0;
    let mut use_mbr_file = false;
    let mut use_boot_file = false;

    let mut cylinders: u32 = 0;
    let mut heads: u32 = 0;
    let mut spt: u32 = 0;
    let mut sector_count: u32 = 0;
    let mut offset_to_bootsector: u32 = 0;

    if let Some(bytes) = mbr_sector {
        if let Some(mbr) = Mbr::from_bytes(bytes) {
            let partition = &mbr.partitions[0];
            if (partition.fs_type != 0) && (partition.sector_count > 0) {
                fat_type = match partition.fs_type {
                    PARTITION_FAT16 | PARTITION_FAT16_LBA => Some(FatType::Fat16),
                    PARTITION_FAT32 | PARTITION_FAT32_LBA => Some(FatType::Fat32),
                    other => return Err(VvfatError::UnsupportedPartitionType(other)),
                };

                if partition.start_sector == 0 {
                    return Err(VvfatError::InconsistentLayout);
                }

                sector_count = partition.start_sector + partition.sector_count;
                spt = partition.start_sector;
                heads = if partition.end_chs.head > 15 {
                    16
                } else {
                    (partition.end_chs.head as u32) + 1
                };
                cylinders = sector_count / (heads * spt);
                offset_to_bootsector = spt;
                use_mbr_file = true;
                log::debug!("using MBR from file");
            }
        }
    }

    if let Some(bytes) = boot_sector {
        let parsed = BootSector::from_bytes(bytes);

        if use_mbr_file {
            // the boot sector must agree with the partition table
            let bs = match parsed {
                Some(bs) => bs,
                None => return Err(VvfatError::InconsistentLayout),
            };
            let wanted = fat_type.unwrap();
            let type_ok = match &bs.tail {
                crate::image::on_disk::BootSectorTail::Fat16(ext) => {
                    &ext.fat_type == expected_type_string(wanted)
                }
                crate::image::on_disk::BootSectorTail::Fat32 { extended, .. } => {
                    &extended.fat_type == expected_type_string(wanted)
                }
            };

            if !type_ok
                || (bs.addressed_sector_count() != sector_count)
                || (bs.number_of_fats != 2)
            {
                return Err(VvfatError::InconsistentLayout);
            }

            use_boot_file = true;
            sectors_per_cluster = bs.sectors_per_cluster;
            reserved_sectors = bs.reserved_sectors;
            root_entries = bs.root_entries;
            first_cluster_of_root_dir = bs.first_cluster_of_root_dir();
            sectors_per_fat = bs.sectors_per_fat();
        } else {
            // standalone boot sector supplies the whole geometry
            let bs = match parsed {
                Some(bs) => bs,
                None => return Err(VvfatError::UnsupportedBootSector),
            };

            if bs.number_of_fats != 2 {
                return Err(VvfatError::UnsupportedBootSector);
            }

            fat_type = Some(match bs.fat_type() {
                12 => FatType::Fat12,
                16 => FatType::Fat16,
                _ => FatType::Fat32,
            });

            sector_count = bs.addressed_sector_count();
            spt = bs.sectors_per_track as u32;
            heads = if bs.number_of_heads > 15 {
                16
            } else {
                bs.number_of_heads as u32
            };
            if (spt == 0) || (heads == 0) {
                return Err(VvfatError::UnsupportedBootSector);
            }
            cylinders = sector_count / (heads * spt);
            offset_to_bootsector = bs.hidden_sectors;
            use_boot_file = true;
            sectors_per_cluster = bs.sectors_per_cluster;
            reserved_sectors = bs.reserved_sectors;
            root_entries = bs.root_entries;
            first_cluster_of_root_dir = bs.first_cluster_of_root_dir();
            sectors_per_fat = bs.sectors_per_fat();
        }

        log::debug!("using boot sector from file");
    }

    if !use_mbr_file && !use_boot_file {
        if disk_size == FLOPPY_1_44M {
            cylinders = 80;
            heads = 2;
            spt = 18;
            offset_to_bootsector = 0;
            fat_type = Some(FatType::Fat12);
            sectors_per_cluster = 1;
            first_cluster_of_root_dir = 0;
            root_entries = 224;
            reserved_sectors = 1;
        } else {
            let (c, h, s) = fallback_chs.unwrap_or((1024, 16, 63));
            cylinders = c;
            heads = h;
            spt = s;
            offset_to_bootsector = spt;
        }
        sector_count = cylinders * heads * spt;
    }

    let hd_size = 512u64 * (sector_count as u64);

    if sectors_per_cluster == 0 {
        let size_in_mb = (hd_size >> 20) as u32;

        if (size_in_mb >= 2047) || (fat_type == Some(FatType::Fat32)) {
            fat_type = Some(FatType::Fat32);
            sectors_per_cluster = if size_in_mb >= 32767 {
                64
            } else if size_in_mb >= 16383 {
                32
            } else if size_in_mb >= 8191 {
                16
            } else {
                8
            };
            first_cluster_of_root_dir = 2;
            root_entries = 0;
            reserved_sectors = 32;
        } else {
            fat_type = Some(FatType::Fat16);
            sectors_per_cluster = if size_in_mb >= 1023 {
                64
            } else if size_in_mb >= 511 {
                32
            } else if size_in_mb >= 255 {
                16
            } else if size_in_mb >= 127 {
                8
            } else {
                4
            };
            first_cluster_of_root_dir = 0;
            root_entries = 512;
            reserved_sectors = 1;
        }
    }

    return Ok(Layout {
        cylinders,
        heads,
        spt,
        sector_count,
        offset_to_bootsector,
        fat_type: fat_type.unwrap(),
        sectors_per_cluster,
        reserved_sectors,
        root_entries,
        first_cluster_of_root_dir,
        sectors_per_fat,
        use_mbr_file,
        use_boot_file,
        hd_size,
    });
}
