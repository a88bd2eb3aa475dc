use crate::image::fat::{Fat, FatType};
use crate::image::geometry::Layout;
use crate::image::image::{VvfatImage, VVFAT_ATTR, VVFAT_BOOT, VVFAT_MBR};
use crate::image::mapping::{MappingInfo, MappingKind};
use crate::image::on_disk::boot_sector::{
    BootSector, BootSectorTail, ExtendedFields, FAT12_TYPE_STRING, FAT16_TYPE_STRING,
    FAT32_TYPE_STRING,
};
use crate::image::on_disk::direntry::{
    build_lfn_entries, set_lfn_checksum, ATTR_ARCHIVE, ATTR_DIRECTORY,
};
use crate::image::on_disk::info_sector::InfoSector;
use crate::time::fat_datetime;
use crate::{ByteSerializable, VvfatError};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, UNIX_EPOCH};

const FORBIDDEN_SHORT_NAME_CHARACTERS: &[u8] = b".*?<>|\":/\\[];,+='";

/// FAT timestamps of one host object: creation (status change), access and
/// modification, each as `(date, time)`.
struct FatTimes {
    ctime: (u16, u16),
    adate: u16,
    mtime: (u16, u16),
}

fn fat_times(metadata: &Metadata) -> FatTimes {
    let to_system = |secs: i64| UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64);

    return FatTimes {
        ctime: fat_datetime(to_system(metadata.ctime())),
        adate: fat_datetime(to_system(metadata.atime())).0,
        mtime: fat_datetime(to_system(metadata.mtime())),
    };
}

impl VvfatImage {
    /// Emits the long-name entries followed by a unique 8.3 entry for
    /// `filename`, and returns the index of the 8.3 entry.
    ///
    /// `directory_start` is the first entry index of the directory being
    /// filled; duplicate short names are disambiguated against that range.
    /// `is_dot` entries get a verbatim space-padded name and nothing else.
    pub(crate) fn create_short_and_long_name(
        &mut self,
        directory_start: usize,
        filename: &str,
        is_dot: bool,
    ) -> usize {
        if is_dot {
            let index = self.directory.get_next();
            let entry = self.directory.get_mut(index);
            let mut combined = [0x20u8; 11];
            combined[..filename.len()].copy_from_slice(filename.as_bytes());
            entry.name.copy_from_slice(&combined[0..8]);
            entry.extension.copy_from_slice(&combined[8..11]);

            return index;
        }

        let long_index = self.directory.next();
        for lfn_entry in build_lfn_entries(filename) {
            let index = self.directory.get_next();
            *self.directory.get_mut(index) = lfn_entry;
        }

        // short name base: spaces stripped, split at the last dot
        let stripped: Vec<u8> = filename.bytes().filter(|&b| b != b' ').collect();

        let mut dot = 0;
        for j in (1..stripped.len()).rev() {
            if stripped[j] == b'.' {
                dot = j;
                break;
            }
        }

        let base_len = if dot > 0 {
            dot.min(8)
        } else {
            stripped.len().min(8)
        };

        // whatever the 8.3 squeeze loses, the name gets a ~1 suffix
        let mut lossy = filename.contains(' ');
        if dot > 0 {
            lossy |= (dot > 8) || (stripped.len() - dot - 1 > 3);
        } else {
            lossy |= stripped.len() > 8;
        }

        let mut combined = [0x20u8; 11];
        combined[..base_len].copy_from_slice(&stripped[..base_len]);

        if dot > 0 {
            for i in 0..3 {
                match stripped.get(dot + 1 + i) {
                    Some(&b) => combined[8 + i] = b,
                    None => break,
                }
            }
        }

        // upcase and replace unwanted characters, skipping the space padding
        let mut i: i32 = 10;
        while i >= 0 {
            if (i == 10) || (i == 7) {
                while (i > 0) && (combined[i as usize] == b' ') {
                    i -= 1;
                }
            }

            let c = combined[i as usize];
            if (c < b' ') || (c > 0x7f) || FORBIDDEN_SHORT_NAME_CHARACTERS.contains(&c) {
                combined[i as usize] = b'_';
                lossy = true;
            } else if (b'a'..=b'z').contains(&c) {
                combined[i as usize] = c - b'a' + b'A';
            }

            i -= 1;
        }

        if combined[0] == 0xe5 {
            combined[0] = 0x05;
        }

        if lossy {
            let base_end = combined[0..8]
                .iter()
                .position(|&b| b == b' ')
                .unwrap_or(8);
            let tilde = base_end.min(6);
            combined[tilde] = b'~';
            combined[tilde + 1] = b'1';
        }

        // disambiguate against earlier short names in this directory
        loop {
            let mut duplicate = false;
            for other in directory_start..self.directory.next() {
                let entry = self.directory.get(other);
                if !entry.is_long_name()
                    && (entry.name == combined[0..8])
                    && (entry.extension == combined[8..11])
                {
                    duplicate = true;
                    break;
                }
            }

            if !duplicate {
                break;
            }

            // widen the base with ~ fillers, then bump the numeric suffix
            if combined[7] == b' ' {
                let mut j = 6;
                while (j > 0) && (combined[j] == b' ') {
                    combined[j] = b'~';
                    j -= 1;
                }
            }

            let mut j = 7;
            while (j > 0) && (combined[j] == b'9') {
                combined[j] = b'0';
                j -= 1;
            }
            if j > 0 {
                if !combined[j].is_ascii_digit() {
                    combined[j] = b'0';
                } else {
                    combined[j] += 1;
                }
            }
        }

        let index = self.directory.get_next();
        let entry = self.directory.get_mut(index);
        entry.name.copy_from_slice(&combined[0..8]);
        entry.extension.copy_from_slice(&combined[8..11]);

        let checksum = self.directory.get(index).short_name_checksum();
        for lfn_index in long_index..index {
            let lfn_entry = self.directory.get_mut(lfn_index);
            if lfn_entry.is_long_name() {
                set_lfn_checksum(lfn_entry, checksum);
            }
        }

        return index;
    }

    /// Scans one host directory (identified by its mapping) into the
    /// directory arena, creating mappings for every subdirectory and
    /// non-empty file, and fixes up the directory's own cluster range.
    pub(crate) fn read_directory(&mut self, mapping_index: usize) -> Result<(), VvfatError> {
        let (dirname, first_cluster, parent_index) = {
            let mapping = self.mappings.get(mapping_index);
            let parent = match &mapping.info {
                MappingInfo::Dir {
                    parent_mapping_index,
                    ..
                } => *parent_mapping_index,
                _ => None,
            };

            (mapping.path.clone(), mapping.begin, parent)
        };
        let first_cluster_of_parent = parent_index.map(|p| self.mappings.get(p).begin);
        let is_root = first_cluster == self.first_cluster_of_root_dir;

        let reader = std::fs::read_dir(&dirname)?;

        let first_dir_index = if is_root { 0 } else { self.directory.next() };
        if let MappingInfo::Dir {
            first_dir_index: slot,
            ..
        } = &mut self.mappings.get_mut(mapping_index).info
        {
            *slot = first_dir_index;
        }

        if !is_root {
            // the two top entries of a subdirectory
            let metadata = std::fs::metadata(&dirname).ok();
            let parent_metadata = dirname.parent().and_then(|p| std::fs::metadata(p).ok());

            let dot = self.create_short_and_long_name(first_dir_index, ".", true);
            self.fill_dot_entry(dot, metadata.as_ref(), first_cluster);

            let dotdot = self.create_short_and_long_name(first_dir_index, "..", true);
            self.fill_dot_entry(
                dotdot,
                parent_metadata.as_ref(),
                first_cluster_of_parent.unwrap_or(0),
            );
        }

        for host_entry in reader {
            let host_entry = match host_entry {
                Ok(e) => e,
                Err(_) => continue,
            };

            if (first_cluster == 0)
                && (self.directory.next() >= (self.root_entries as usize).saturating_sub(1))
            {
                log::error!(
                    "vvfat: too many entries in root directory of '{}'",
                    dirname.display()
                );
                return Err(VvfatError::RootDirectoryFull {
                    root_entries: self.root_entries,
                });
            }

            let name = host_entry.file_name().to_string_lossy().into_owned();
            let path = dirname.join(&name);

            let metadata = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };

            // the companion files never show up inside the volume
            if is_root {
                let is_mbr_file = name == VVFAT_MBR;
                let is_boot_file = name == VVFAT_BOOT;
                if (name == VVFAT_ATTR)
                    || ((is_mbr_file || is_boot_file) && (metadata.len() == 512))
                {
                    continue;
                }
            }

            let is_dir = metadata.is_dir();
            if !is_dir && (metadata.len() > 0x7fff_ffff) {
                return Err(VvfatError::FileTooLarge(path.display().to_string()));
            }

            let entry_index = self.create_short_and_long_name(first_dir_index, &name, false);

            let times = fat_times(&metadata);
            let entry = self.directory.get_mut(entry_index);
            entry.attributes = if is_dir { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
            entry.reserved = [0, 0];
            entry.ctime = times.ctime.1;
            entry.cdate = times.ctime.0;
            entry.adate = times.adate;
            entry.begin_hi = 0;
            entry.mtime = times.mtime.1;
            entry.mdate = times.mtime.0;
            entry.begin = 0; // assigned with the cluster runs
            entry.size = if is_dir { 0 } else { metadata.len() as u32 };

            if is_dir || (metadata.len() > 0) {
                let new_index = self.mappings.get_next();
                let mapping = self.mappings.get_mut(new_index);
                mapping.begin = 0;
                mapping.end = if is_dir { 0 } else { metadata.len() as u32 };
                mapping.dir_index = entry_index;
                mapping.first_mapping_index = None;
                if is_dir {
                    mapping.kind = MappingKind::Directory;
                    mapping.info = MappingInfo::Dir {
                        parent_mapping_index: Some(mapping_index),
                        first_dir_index: 0,
                    };
                } else {
                    mapping.kind = MappingKind::Undefined;
                    mapping.info = MappingInfo::File { offset: 0 };
                }
                mapping.path = path;
                mapping.read_only = metadata.permissions().readonly();
            }
        }

        // fill with zeroes up to the end of the cluster
        let entries_per_cluster = 16 * (self.sectors_per_cluster as usize);
        while (self.directory.next() % entries_per_cluster) != 0 {
            self.directory.get_next();
        }

        if (self.fat_type != FatType::Fat32) && is_root {
            if self.directory.next() > (self.root_entries as usize) {
                return Err(VvfatError::RootDirectoryFull {
                    root_entries: self.root_entries,
                });
            }
            if self.directory.next() < (self.root_entries as usize) {
                self.directory.ensure_allocated((self.root_entries as usize) - 1);
            }
        }

        let end_cluster = if first_cluster == 0 {
            2
        } else {
            first_cluster
                + (((self.directory.next() - first_dir_index) * 32) as u32) / self.cluster_size
        };

        let mapping = self.mappings.get_mut(mapping_index);
        mapping.end = end_cluster;
        let dir_index = mapping.dir_index;
        let begin = mapping.begin;
        self.directory.get_mut(dir_index).set_begin_cluster(begin);

        return Ok(());
    }

    fn fill_dot_entry(&mut self, index: usize, metadata: Option<&Metadata>, begin: u32) {
        let entry = self.directory.get_mut(index);
        entry.attributes = ATTR_DIRECTORY;
        entry.reserved = [0, 0];
        entry.size = 0;
        entry.set_begin_cluster(begin);

        if let Some(metadata) = metadata {
            let times = fat_times(metadata);
            entry.ctime = times.ctime.1;
            entry.cdate = times.ctime.0;
            entry.adate = times.adate;
            entry.mtime = times.mtime.1;
            entry.mdate = times.mtime.0;
        }
    }

    /// Builds the whole virtual volume: directory arena, mappings with
    /// their cluster runs, FAT chains and (unless adopted from a file) the
    /// boot sector, plus the FAT32 info and backup sectors.
    pub(crate) fn init_directories(&mut self, layout: &Layout) -> Result<(), VvfatError> {
        let bits = self.fat_type.bits() as u64;

        if !self.use_boot_file {
            let volume_sector_count =
                (self.sector_count - self.offset_to_bootsector) as u64;
            let usable = volume_sector_count
                - (self.reserved_sectors as u64)
                - ((self.root_entries as u64) / 16);

            // each cluster costs its data sectors plus bits/4 bytes across
            // the two FAT copies
            self.cluster_count = ((usable * 512)
                / (((self.sectors_per_cluster as u64) * 512) + bits / 4))
                as u32;

            let fat_bytes = ((self.cluster_count as u64) + 2) * bits / 8;
            self.sectors_per_fat = ((fat_bytes + 511) / 512) as u32;
        } else {
            self.sectors_per_fat = layout.sectors_per_fat;
        }

        self.offset_to_fat = self.offset_to_bootsector + (self.reserved_sectors as u32);
        self.offset_to_root_dir = self.offset_to_fat + self.sectors_per_fat * 2;
        self.offset_to_data = self.offset_to_root_dir + ((self.root_entries as u32) / 16);

        if self.use_boot_file {
            self.cluster_count =
                (self.sector_count - self.offset_to_data) / (self.sectors_per_cluster as u32);
        }

        self.fat = Fat::new(self.fat_type, self.sectors_per_fat);

        // the volume label heads the root directory
        {
            let index = self.directory.get_next();
            let entry = self.directory.get_mut(index);
            entry.attributes = ATTR_ARCHIVE | 0x08;
            entry.mdate = 0x3d81; // 01.12.2010
            entry.mtime = 0x6000; // 12:00:00
            entry.name.copy_from_slice(b"BOCHS VV");
            entry.extension.copy_from_slice(b"FAT");
        }

        {
            let root_index = self.mappings.get_next();
            let root = self.mappings.get_mut(root_index);
            root.begin = 0;
            root.dir_index = 0;
            root.info = MappingInfo::Dir {
                parent_mapping_index: None,
                first_dir_index: 0,
            };
            root.first_mapping_index = None;
            root.path = self.shadow_path.clone();
            root.kind = MappingKind::Directory;
            root.read_only = false;
        }

        let mut cluster = self.first_cluster_of_root_dir;
        let mut i = 0;
        while i < self.mappings.next() {
            // the FAT12/16 root directory owns no clusters and no chain
            let fix_fat = cluster != 0;

            if self.mappings.get(i).kind == MappingKind::Directory {
                self.mappings.get_mut(i).begin = cluster;
                if let Err(e) = self.read_directory(i) {
                    log::error!(
                        "vvfat: could not read directory '{}'",
                        self.mappings.get(i).path.display()
                    );
                    return Err(e);
                }
            } else {
                let mapping = self.mappings.get_mut(i);
                mapping.kind = MappingKind::Normal;
                mapping.begin = cluster;
                // end held the file size until now
                let size = mapping.end;
                mapping.end = cluster + 1 + (size - 1) / self.cluster_size;

                let dir_index = mapping.dir_index;
                self.directory.get_mut(dir_index).set_begin_cluster(cluster);
            }

            let (begin, end) = {
                let mapping = self.mappings.get(i);
                (mapping.begin, mapping.end)
            };
            debug_assert!(begin < end);

            cluster = end;

            if cluster >= self.cluster_count + 2 {
                let capacity_mb = (self.sector_count >> 11) as u64;
                log::error!(
                    "vvfat: directory does not fit in FAT{} (capacity {} MB)",
                    bits,
                    capacity_mb
                );
                return Err(VvfatError::DirectoryTooLarge {
                    fat_type: bits as u8,
                    capacity_mb,
                });
            }

            if fix_fat {
                for j in begin..(end - 1) {
                    self.fat.set(j, j + 1);
                }
                self.fat.set(end - 1, self.max_fat_value);
            }

            i += 1;
        }

        debug_assert!(
            (self.fat_type == FatType::Fat32) || (self.mappings.get(0).end == 2)
        );

        // the FAT signature
        self.fat.set(0, self.max_fat_value);
        self.fat.set(1, self.max_fat_value);

        self.close_current_file();

        if !self.use_boot_file {
            let volume_sector_count = self.sector_count - self.offset_to_bootsector;
            let fat32 = self.fat_type == FatType::Fat32;

            let extended = ExtendedFields {
                drive_number: if self.fat_type == FatType::Fat12 {
                    0
                } else {
                    0x80
                },
                signature: 0x29,
                id: self.volume_id,
                volume_label: *b"BOCHS VVFAT",
                fat_type: match self.fat_type {
                    FatType::Fat12 => *FAT12_TYPE_STRING,
                    FatType::Fat16 => *FAT16_TYPE_STRING,
                    FatType::Fat32 => *FAT32_TYPE_STRING,
                },
            };

            let boot = BootSector {
                jump: [0xeb, if fat32 { 0x58 } else { 0x3e }, 0x90],
                // Win95/98 detect FAT32 only with this OEM name in place
                oem_name: *b"MSWIN4.1",
                sector_size: 512,
                sectors_per_cluster: self.sectors_per_cluster,
                reserved_sectors: self.reserved_sectors,
                number_of_fats: 2,
                root_entries: if fat32 { 0 } else { self.root_entries },
                total_sectors16: if volume_sector_count > 0xffff {
                    0
                } else {
                    volume_sector_count as u16
                },
                media_type: if self.fat_type == FatType::Fat12 {
                    0xf0
                } else {
                    0xf8
                },
                sectors_per_fat16: if fat32 {
                    0
                } else {
                    self.sectors_per_fat as u16
                },
                sectors_per_track: layout.spt as u16,
                number_of_heads: layout.heads as u16,
                hidden_sectors: self.offset_to_bootsector,
                total_sectors32: if volume_sector_count > 0xffff {
                    volume_sector_count
                } else {
                    0
                },
                tail: if fat32 {
                    BootSectorTail::Fat32 {
                        sectors_per_fat: self.sectors_per_fat,
                        first_cluster_of_root_dir: self.first_cluster_of_root_dir,
                        info_sector: 1,
                        backup_boot_sector: 6,
                        extended,
                    }
                } else {
                    BootSectorTail::Fat16(extended)
                },
            };

            let offset = (self.offset_to_bootsector as usize) * 512;
            self.first_sectors[offset..offset + 512].copy_from_slice(&boot.to_bytes());
        }

        // FAT entry 0 carries the media descriptor of the boot sector in
        // place, whether synthesized or adopted
        let media_type = self.first_sectors[(self.offset_to_bootsector as usize) * 512 + 21];
        self.fat.set_media_byte(media_type);

        if self.fat_type == FatType::Fat32 {
            let boot_offset = (self.offset_to_bootsector as usize) * 512;
            let backup_offset = ((self.offset_to_bootsector + 6) as usize) * 512;
            let (head, tail) = self.first_sectors.split_at_mut(backup_offset);
            tail[..512].copy_from_slice(&head[boot_offset..boot_offset + 512]);

            let info = InfoSector {
                free_clusters: self.cluster_count + 2 - cluster,
                mra_cluster: 2,
            };
            let info_offset = ((self.offset_to_bootsector + 1) as usize) * 512;
            self.first_sectors[info_offset..info_offset + 512]
                .copy_from_slice(&info.to_bytes());
        }

        return Ok(());
    }
}
