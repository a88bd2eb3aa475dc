use crate::arena::Arena;
use crate::block_device::{BlockDevice, DiskGeometry, CAP_HAS_GEOMETRY};
use crate::image::fat::{Fat, FatType};
use crate::image::geometry::plan_layout;
use crate::image::mapping::{find_mapping_for_cluster, Mapping, MappingKind};
use crate::image::on_disk::direntry::DirEntry;
use crate::image::on_disk::mbr::Mbr;
use crate::redolog::{create_volatile_file, Redolog, RedologSubtype};
use crate::{ByteSerializable, VvfatError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

pub const VVFAT_MBR: &str = "vvfat_mbr.bin";
pub const VVFAT_BOOT: &str = "vvfat_boot.bin";
pub const VVFAT_ATTR: &str = "vvfat_attr.cfg";

const VOLUME_ID_BASE: u32 = 0xfabe1afd;

static VVFAT_COUNT: AtomicU32 = AtomicU32::new(0);

/// Parameters for `VvfatImage::open`.
#[derive(Debug, Clone)]
pub struct VvfatConfig {
    /// Requested virtual disk size in bytes. 1,474,560 selects the 1.44M
    /// floppy shape; any other value is superseded by the geometry.
    pub disk_size: u64,
    /// Cylinders/heads/sectors-per-track to use when no MBR or boot sector
    /// file dictates them. Defaults to 1024/16/63.
    pub fallback_chs: Option<(u32, u32, u32)>,
    /// Template path for the volatile overlay file. Defaults to
    /// `<directory>/vvfat.dir`.
    pub redolog_template: Option<PathBuf>,
}

impl Default for VvfatConfig {
    fn default() -> Self {
        return Self {
            disk_size: 0,
            fallback_chs: None,
            redolog_template: None,
        };
    }
}

/// A host directory exposed as a raw FAT block device.
///
/// The volume is synthesized once at `open` and is immutable from the
/// guest's point of view; every guest write lands in the volatile redo log.
/// `commit_changes` (or `close` after a write) folds the overlay back into
/// the host directory.
pub struct VvfatImage {
    pub(crate) first_sectors: Vec<u8>,
    pub(crate) offset_to_bootsector: u32,
    pub(crate) offset_to_fat: u32,
    pub(crate) offset_to_root_dir: u32,
    pub(crate) offset_to_data: u32,

    pub(crate) cluster_size: u32,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) sectors_per_fat: u32,
    pub(crate) sector_count: u32,
    pub(crate) cluster_count: u32,
    pub(crate) max_fat_value: u32,
    pub(crate) first_cluster_of_root_dir: u32,
    pub(crate) root_entries: u16,
    pub(crate) reserved_sectors: u16,

    pub(crate) fat_type: FatType,
    pub(crate) fat: Fat,
    pub(crate) directory: Arena<DirEntry>,
    pub(crate) mappings: Arena<Mapping>,

    // single-slot host file cache of the read path
    pub(crate) current_mapping: Option<usize>,
    pub(crate) current_file: Option<File>,
    pub(crate) current_cluster: Option<u32>,
    pub(crate) cluster_buffer: Vec<u8>,

    pub(crate) shadow_path: PathBuf,
    pub(crate) sector_num: u32,

    pub(crate) use_mbr_file: bool,
    pub(crate) use_boot_file: bool,
    pub(crate) volume_id: u32,

    pub(crate) modified: bool,
    pub(crate) redolog: Redolog,

    // open only while a commit is running
    pub(crate) attr_writer: Option<File>,

    cylinders: u32,
    heads: u32,
    spt: u32,
    hd_size: u64,
}

/// Reads one 512-byte sector from `path` and accepts it only with the
/// 0x55 0xaa signature in place.
fn read_sector_from_file(path: &Path) -> Option<[u8; 512]> {
    let mut file = File::open(path).ok()?;
    let mut buffer = [0u8; 512];

    file.read_exact(&mut buffer).ok()?;

    if (buffer[0x1fe] != 0x55) || (buffer[0x1ff] != 0xaa) {
        return None;
    }

    return Some(buffer);
}

impl VvfatImage {
    /// Shadows `dirname` as a FAT volume. Scans the tree, synthesizes the
    /// FAT image and creates the volatile overlay; fails without leaving
    /// any state behind.
    pub fn open(dirname: &Path, config: VvfatConfig) -> Result<Self, VvfatError> {
        let mbr_sector = read_sector_from_file(&dirname.join(VVFAT_MBR));
        let boot_sector = read_sector_from_file(&dirname.join(VVFAT_BOOT));

        let layout = plan_layout(
            config.disk_size,
            config.fallback_chs,
            mbr_sector.as_ref().map(|s| &s[..]),
            boot_sector.as_ref().map(|s| &s[..]),
        )?;

        let first_sector_span =
            ((layout.offset_to_bootsector + (layout.reserved_sectors as u32) + 8) as usize) * 512;
        let mut first_sectors = vec![0u8; first_sector_span.max(0xc000)];

        if layout.use_mbr_file {
            first_sectors[..512].copy_from_slice(mbr_sector.as_ref().unwrap());
        }
        if layout.use_boot_file {
            let offset = (layout.offset_to_bootsector as usize) * 512;
            first_sectors[offset..offset + 512].copy_from_slice(boot_sector.as_ref().unwrap());
        }

        let template = config
            .redolog_template
            .unwrap_or_else(|| dirname.join("vvfat.dir"));
        let backing = create_volatile_file(&template)?;
        let redolog = Redolog::create(backing, RedologSubtype::Volatile, layout.hd_size)?;

        let instance = VVFAT_COUNT.fetch_add(1, Ordering::Relaxed);

        let mut shadow_path = PathBuf::from(dirname);
        // normalize away a trailing separator so path comparison is exact
        if let Some(s) = shadow_path.to_str() {
            if s.ends_with('/') && (s.len() > 1) {
                shadow_path = PathBuf::from(&s[..s.len() - 1]);
            }
        }

        let mut image = Self {
            first_sectors,
            offset_to_bootsector: layout.offset_to_bootsector,
            offset_to_fat: 0,
            offset_to_root_dir: 0,
            offset_to_data: 0,
            cluster_size: layout.cluster_size(),
            sectors_per_cluster: layout.sectors_per_cluster,
            sectors_per_fat: 0,
            sector_count: layout.sector_count,
            cluster_count: 0,
            max_fat_value: layout.fat_type.max_fat_value(),
            first_cluster_of_root_dir: layout.first_cluster_of_root_dir,
            root_entries: layout.root_entries,
            reserved_sectors: layout.reserved_sectors,
            fat_type: layout.fat_type,
            fat: Fat::new(layout.fat_type, 0),
            directory: Arena::new(),
            mappings: Arena::new(),
            current_mapping: None,
            current_file: None,
            current_cluster: None,
            cluster_buffer: vec![0u8; layout.cluster_size() as usize],
            shadow_path,
            sector_num: 0,
            use_mbr_file: layout.use_mbr_file,
            use_boot_file: layout.use_boot_file,
            volume_id: VOLUME_ID_BASE.wrapping_add(instance),
            modified: false,
            redolog,
            attr_writer: None,
            cylinders: layout.cylinders,
            heads: layout.heads,
            spt: layout.spt,
            hd_size: layout.hd_size,
        };

        if !image.use_mbr_file && (image.offset_to_bootsector > 0) {
            image.init_mbr();
        }

        image.init_directories(&layout)?;
        image.set_file_attributes();

        log::debug!(
            "'vvfat' disk opened: directory is '{}', {} sectors",
            image.shadow_path.display(),
            image.sector_count
        );

        return Ok(image);
    }

    pub(crate) fn init_mbr(&mut self) {
        let fat_bits = self.fat_type.bits() as u8;
        let mbr = Mbr::for_single_partition(
            self.offset_to_bootsector,
            self.sector_count,
            fat_bits,
            self.heads,
            self.spt,
        );

        self.first_sectors[..512].copy_from_slice(&mbr.to_bytes());
    }

    pub(crate) fn sector_to_cluster(&self, sector_num: u32) -> u32 {
        return (sector_num - self.offset_to_data) / (self.sectors_per_cluster as u32) + 2;
    }

    pub(crate) fn cluster_to_sector(&self, cluster_num: u32) -> u64 {
        return (self.offset_to_data as u64)
            + ((cluster_num as u64) - 2) * (self.sectors_per_cluster as u64);
    }

    pub(crate) fn close_current_file(&mut self) {
        self.current_mapping = None;
        self.current_file = None;
        self.current_cluster = None;
    }

    /// Serializes 16 directory entries starting at `first_entry_index` into
    /// one sector. Indices past the arena end produce zero bytes.
    fn directory_sector(&self, first_entry_index: usize, out: &mut [u8]) {
        for slot in 0..16 {
            let index = first_entry_index + slot;
            let offset = slot * 32;

            if index < self.directory.next() {
                out[offset..offset + 32].copy_from_slice(&self.directory.get(index).to_bytes());
            } else {
                for b in out[offset..offset + 32].iter_mut() {
                    *b = 0;
                }
            }
        }
    }

    fn open_mapped_file(&mut self, mapping_index: usize) -> Result<(), VvfatError> {
        if (self.current_mapping == Some(mapping_index)) && self.current_file.is_some() {
            return Ok(());
        }

        let path = self.mappings.get(mapping_index).path.clone();
        let file = File::open(&path)?;

        self.close_current_file();
        self.current_file = Some(file);
        self.current_mapping = Some(mapping_index);

        return Ok(());
    }

    /// Loads `cluster_num` into the cluster buffer: directory clusters come
    /// from the directory arena, file clusters from the (cached) host file.
    pub(crate) fn read_cluster(&mut self, cluster_num: u32) -> Result<(), VvfatError> {
        if self.current_cluster == Some(cluster_num) {
            return Ok(());
        }

        let mapping_index = match self.current_mapping {
            Some(index)
                if (self.mappings.get(index).begin <= cluster_num)
                    && (cluster_num < self.mappings.get(index).end) =>
            {
                index
            }
            _ => match find_mapping_for_cluster(&self.mappings, cluster_num) {
                Some(index) => index,
                None => {
                    self.current_cluster = None;
                    return Err(VvfatError::OutOfBounds);
                }
            },
        };

        let mapping = self.mappings.get(mapping_index);
        let begin = mapping.begin;
        let kind = mapping.kind;

        match kind {
            MappingKind::Directory => {
                let first_dir_index = match &mapping.info {
                    crate::image::mapping::MappingInfo::Dir {
                        first_dir_index, ..
                    } => *first_dir_index,
                    _ => 0,
                };

                self.current_file = None;
                self.current_mapping = Some(mapping_index);

                let entries_per_cluster = (self.cluster_size as usize) / 32;
                let base =
                    first_dir_index + ((cluster_num - begin) as usize) * entries_per_cluster;

                let mut buffer = std::mem::replace(&mut self.cluster_buffer, Vec::new());
                for sector in 0..(self.sectors_per_cluster as usize) {
                    let offset = sector * 512;
                    self.directory_sector(base + sector * 16, &mut buffer[offset..offset + 512]);
                }
                self.cluster_buffer = buffer;
            }
            _ => {
                let file_offset = match &mapping.info {
                    crate::image::mapping::MappingInfo::File { offset } => *offset,
                    _ => 0,
                };

                self.open_mapped_file(mapping_index)?;

                let offset =
                    ((cluster_num - begin) as u64) * (self.cluster_size as u64) + (file_offset as u64);
                let file = self.current_file.as_mut().unwrap();
                file.seek(SeekFrom::Start(offset))?;

                // a short read past the end of the file leaves the tail zeroed
                for b in self.cluster_buffer.iter_mut() {
                    *b = 0;
                }
                let mut filled = 0;
                while filled < self.cluster_buffer.len() {
                    match file.read(&mut self.cluster_buffer[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => {
                            self.current_cluster = None;
                            return Err(VvfatError::Io(e));
                        }
                    }
                }
            }
        }

        self.current_cluster = Some(cluster_num);

        return Ok(());
    }

    /// Fills `out` with the synthesized content of `sector_num`.
    fn synthesize_sector(&mut self, sector_num: u32, out: &mut [u8]) {
        if sector_num < self.offset_to_data {
            if sector_num < self.offset_to_bootsector + (self.reserved_sectors as u32) {
                let offset = (sector_num as usize) * 512;
                out.copy_from_slice(&self.first_sectors[offset..offset + 512]);
            } else if (sector_num - self.offset_to_fat) < self.sectors_per_fat {
                let offset = ((sector_num - self.offset_to_fat) as usize) * 512;
                out.copy_from_slice(&self.fat.bytes()[offset..offset + 512]);
            } else if (sector_num - self.offset_to_fat - self.sectors_per_fat)
                < self.sectors_per_fat
            {
                let offset =
                    ((sector_num - self.offset_to_fat - self.sectors_per_fat) as usize) * 512;
                out.copy_from_slice(&self.fat.bytes()[offset..offset + 512]);
            } else {
                let first_entry =
                    ((sector_num - self.offset_to_root_dir) as usize) * 16;
                self.directory_sector(first_entry, out);
            }
        } else {
            let sector = sector_num - self.offset_to_data;
            let sector_offset_in_cluster = sector % (self.sectors_per_cluster as u32);
            let cluster_num = self.sector_to_cluster(sector_num);

            match self.read_cluster(cluster_num) {
                Ok(()) => {
                    let offset = (sector_offset_in_cluster as usize) * 512;
                    out.copy_from_slice(&self.cluster_buffer[offset..offset + 512]);
                }
                Err(_) => {
                    // host I/O trouble degrades to an empty cluster
                    for b in out.iter_mut() {
                        *b = 0;
                    }
                }
            }
        }
    }

    /// Writes the overlay back to the host directory. Public so a consumer
    /// can force a commit (e.g. on a flush request) without closing.
    pub fn commit(&mut self) -> Result<(), VvfatError> {
        if self.modified {
            self.commit_changes()?;
            self.modified = false;
        }

        return Ok(());
    }

    /// Commits pending changes, releases the cached host file and the
    /// overlay. Errors during the final commit are logged, not raised.
    pub fn close(&mut self) {
        if let Err(e) = self.commit() {
            log::error!("vvfat: commit on close failed: {}", e);
        }

        self.close_current_file();
        self.redolog.close();
    }

    pub fn geometry(&self) -> DiskGeometry {
        return DiskGeometry {
            cylinders: self.cylinders,
            heads: self.heads,
            spt: self.spt,
            hd_size: self.hd_size,
        };
    }

    pub fn sector_count(&self) -> u32 {
        return self.sector_count;
    }

    pub fn cluster_size(&self) -> u32 {
        return self.cluster_size;
    }

    pub fn cluster_count(&self) -> u32 {
        return self.cluster_count;
    }

    pub fn fat_bits(&self) -> u32 {
        return self.fat_type.bits();
    }

    pub fn offset_to_bootsector(&self) -> u32 {
        return self.offset_to_bootsector;
    }

    pub fn offset_to_fat(&self) -> u32 {
        return self.offset_to_fat;
    }

    pub fn offset_to_root_dir(&self) -> u32 {
        return self.offset_to_root_dir;
    }

    pub fn offset_to_data(&self) -> u32 {
        return self.offset_to_data;
    }

    pub fn sectors_per_fat(&self) -> u32 {
        return self.sectors_per_fat;
    }

    pub fn root_entries(&self) -> u16 {
        return self.root_entries;
    }

    pub fn first_cluster_of_root_dir(&self) -> u32 {
        return self.first_cluster_of_root_dir;
    }

    pub fn is_modified(&self) -> bool {
        return self.modified;
    }
}

impl BlockDevice for VvfatImage {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, VvfatError> {
        self.redolog.seek(pos)?;

        match pos {
            SeekFrom::Start(offset) => {
                self.sector_num = (offset / 512) as u32;
            }
            SeekFrom::Current(offset) => {
                let target = (self.sector_num as i64) + offset / 512;
                if target < 0 {
                    return Err(VvfatError::OutOfBounds);
                }
                self.sector_num = target as u32;
            }
            SeekFrom::End(_) => return Err(VvfatError::UnsupportedSeek),
        }

        if self.sector_num >= self.sector_count {
            return Err(VvfatError::OutOfBounds);
        }

        return Ok((self.sector_num as u64) * 512);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VvfatError> {
        if (buf.len() % 512) != 0 {
            return Err(VvfatError::Misaligned);
        }

        let mut done = 0;
        while done < buf.len() {
            let chunk = &mut buf[done..done + 512];

            let hit = match self.redolog.read(chunk) {
                Ok(512) => true,
                _ => false,
            };

            if !hit {
                let sector_num = self.sector_num;
                self.synthesize_sector(sector_num, chunk);
                self.redolog
                    .seek(SeekFrom::Start(((sector_num as u64) + 1) * 512))?;
            }

            self.sector_num += 1;
            done += 512;
        }

        return Ok(buf.len());
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, VvfatError> {
        if (buf.len() % 512) != 0 {
            return Err(VvfatError::Misaligned);
        }

        let mut done = 0;
        while done < buf.len() {
            let chunk = &buf[done..done + 512];
            let sector_num = self.sector_num;
            let mut update_position = true;

            if sector_num == 0 {
                // boot code may change, the partition table may not
                log::debug!("vvfat: write mbr code area, sector=0");
                self.first_sectors[..0x1b8].copy_from_slice(&chunk[..0x1b8]);
            } else if sector_num == self.offset_to_bootsector {
                log::debug!("vvfat: write boot sector, sector={}", sector_num);
                let offset = (sector_num as usize) * 512;
                self.first_sectors[offset..offset + 512].copy_from_slice(chunk);
            } else if (self.fat_type == FatType::Fat32)
                && (sector_num == self.offset_to_bootsector + 1)
            {
                log::debug!("vvfat: write FS info sector, sector={}", sector_num);
                let offset = (sector_num as usize) * 512;
                self.first_sectors[offset..offset + 512].copy_from_slice(chunk);
            } else if sector_num < self.offset_to_bootsector + (self.reserved_sectors as u32) {
                log::debug!("vvfat: write ignored, sector={}", sector_num);
            } else {
                self.modified = true;
                update_position = false;
                self.redolog.write(chunk)?;
            }

            self.sector_num += 1;
            done += 512;

            if update_position {
                self.redolog
                    .seek(SeekFrom::Start((self.sector_num as u64) * 512))?;
            }
        }

        return Ok(buf.len());
    }

    fn capabilities(&self) -> u32 {
        return CAP_HAS_GEOMETRY;
    }

    fn close(&mut self) -> Result<(), VvfatError> {
        VvfatImage::close(self);

        return Ok(());
    }
}
