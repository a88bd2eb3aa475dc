use crate::block_device::BlockDevice;
use crate::time::fat_datetime;
use crate::{ByteSerializable, VvfatError};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const STANDARD_HEADER_MAGIC: &[u8] = b"Bochs Virtual HD Image";
const REDOLOG_TYPE: &[u8] = b"Redolog";
const STANDARD_HEADER_VERSION: u32 = 0x0002_0000;
const STANDARD_HEADER_V1: u32 = 0x0001_0000;
const STANDARD_HEADER_SIZE: u32 = 512;

const NOT_ALLOCATED: u32 = 0xffff_ffff;

/// Lifetime of the overlay backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedologSubtype {
    /// Persistent across runs; reopened with `Redolog::open`.
    Growing,
    /// Backing file is unlinked right after creation; the store lives only
    /// as long as the process holds the descriptor.
    Volatile,
}

impl RedologSubtype {
    fn as_bytes(&self) -> &'static [u8] {
        return match self {
            RedologSubtype::Growing => b"Growing",
            RedologSubtype::Volatile => b"Volatile",
        };
    }
}

fn pad_field<const N: usize>(value: &[u8]) -> [u8; N] {
    let mut field = [0u8; N];
    field[..value.len()].copy_from_slice(value);

    return field;
}

fn field_matches(field: &[u8], expected: &[u8]) -> bool {
    // fields are NUL-terminated inside their fixed-size slots
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());

    return &field[..len] == expected;
}

/// The 512-byte header at the start of every redo log file: standard part
/// (magic, type, subtype, version), specific part (catalog geometry), zero
/// padding.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RedologHeader {
    magic: [u8; 32],
    image_type: [u8; 16],
    subtype: [u8; 16],
    version: u32,
    header_size: u32,
    catalog_entries: u32,
    bitmap_size: u32,
    extent_size: u32,
    timestamp: u32,
    disk_size: u64,
}

impl ByteSerializable for RedologHeader {
    type BytesArrayType = [u8; 512];

    fn to_bytes(&self) -> Self::BytesArrayType {
        let mut bytes = [0u8; 512];

        bytes[0..32].copy_from_slice(&self.magic);
        bytes[32..48].copy_from_slice(&self.image_type);
        bytes[48..64].copy_from_slice(&self.subtype);
        LittleEndian::write_u32(&mut bytes[64..], self.version);
        LittleEndian::write_u32(&mut bytes[68..], self.header_size);

        LittleEndian::write_u32(&mut bytes[72..], self.catalog_entries);
        LittleEndian::write_u32(&mut bytes[76..], self.bitmap_size);
        LittleEndian::write_u32(&mut bytes[80..], self.extent_size);
        LittleEndian::write_u32(&mut bytes[84..], self.timestamp);
        LittleEndian::write_u64(&mut bytes[88..], self.disk_size);

        return bytes;
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 512 {
            return None;
        }

        let version = LittleEndian::read_u32(&bytes[64..]);

        // the v1 specific header has no timestamp; the disk size sits where
        // v2 keeps the timestamp
        let (timestamp, disk_size) = if version == STANDARD_HEADER_V1 {
            (0, LittleEndian::read_u64(&bytes[84..]))
        } else {
            (
                LittleEndian::read_u32(&bytes[84..]),
                LittleEndian::read_u64(&bytes[88..]),
            )
        };

        return Some(Self {
            magic: pad_field(&bytes[0..32]),
            image_type: pad_field(&bytes[32..48]),
            subtype: pad_field(&bytes[48..64]),
            version,
            header_size: LittleEndian::read_u32(&bytes[68..]),
            catalog_entries: LittleEndian::read_u32(&bytes[72..]),
            bitmap_size: LittleEndian::read_u32(&bytes[76..]),
            extent_size: LittleEndian::read_u32(&bytes[80..]),
            timestamp,
            disk_size,
        });
    }
}

/// Computes catalog entry count, per-extent bitmap size and extent size for
/// a disk of `disk_size` bytes: start at 512 entries of one-byte bitmaps and
/// alternately double the bitmap and the entry count until the address space
/// is covered.
fn size_parameters(disk_size: u64) -> (u32, u32, u32) {
    let mut entries: u32 = 512;
    let mut bitmap_size: u32 = 1;
    let mut flip = 0u32;

    loop {
        let extent_size = 8 * bitmap_size * 512;
        let maxsize = (entries as u64) * (extent_size as u64);

        if maxsize >= disk_size {
            return (entries, bitmap_size, extent_size);
        }

        flip += 1;
        if (flip & 1) != 0 {
            bitmap_size *= 2;
        } else {
            entries *= 2;
        }
    }
}

/// Creates the overlay backing file from `template` the way `mkstemp` would
/// (unique suffix, exclusive create), then unlinks it immediately so the
/// inode is reclaimed when the descriptor closes.
pub fn create_volatile_file(template: &Path) -> std::io::Result<File> {
    let pid = std::process::id() as u64;

    for attempt in 0..100u64 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let suffix = (nanos ^ (pid << 16) ^ attempt) & 0xff_ffff;

        let mut path = PathBuf::from(template);
        path.set_extension(format!("{:06x}", suffix));

        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                // legal on unix: the open descriptor keeps the inode alive
                let _ = std::fs::remove_file(&path);
                return Ok(file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    return Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "could not create a unique volatile file",
    ));
}

/// Sparse copy-on-write sector store over a backing file.
///
/// The virtual address space is covered by a catalog of extents; each
/// allocated extent stores a presence bitmap (one bit per 512-byte block)
/// followed by the block data. A block exists iff its extent is catalogued
/// and its bitmap bit is set.
pub struct Redolog {
    file: File,
    header: RedologHeader,
    catalog: Vec<u32>,
    bitmap: Vec<u8>,
    bitmap_update: bool,
    extent_index: u32,
    extent_offset: u32,
    extent_next: u32,
    bitmap_blocks: u32,
    extent_blocks: u32,
    imagepos: u64,
}

impl Redolog {
    /// Lays out a fresh redo log on `file` sized for `disk_size` bytes.
    pub fn create(
        mut file: File,
        subtype: RedologSubtype,
        disk_size: u64,
    ) -> Result<Self, VvfatError> {
        let (entries, bitmap_size, extent_size) = size_parameters(disk_size);

        let header = RedologHeader {
            magic: pad_field(STANDARD_HEADER_MAGIC),
            image_type: pad_field(REDOLOG_TYPE),
            subtype: pad_field(subtype.as_bytes()),
            version: STANDARD_HEADER_VERSION,
            header_size: STANDARD_HEADER_SIZE,
            catalog_entries: entries,
            bitmap_size,
            extent_size,
            timestamp: 0,
            disk_size,
        };

        log::debug!(
            "redolog: #entries={}, bitmap size={}, extent size={}, disk size={}",
            entries,
            bitmap_size,
            extent_size,
            disk_size
        );

        let catalog = vec![NOT_ALLOCATED; entries as usize];

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;

        let mut catalog_bytes = vec![0u8; (entries as usize) * 4];
        for (i, slot) in catalog.iter().enumerate() {
            LittleEndian::write_u32(&mut catalog_bytes[i * 4..], *slot);
        }
        file.write_all(&catalog_bytes)?;

        return Ok(Self {
            file,
            bitmap: vec![0u8; bitmap_size as usize],
            bitmap_update: true,
            extent_index: 0,
            extent_offset: 0,
            extent_next: 0,
            bitmap_blocks: 1 + (bitmap_size - 1) / 512,
            extent_blocks: 1 + (extent_size - 1) / 512,
            imagepos: 0,
            catalog,
            header,
        });
    }

    /// Reopens a persistent redo log, validating the header against the
    /// expected subtype.
    pub fn open(path: &Path, subtype: RedologSubtype) -> Result<Self, VvfatError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mtime = file.metadata()?.modified().ok();

        let mut header_bytes = [0u8; 512];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header_bytes)?;

        let header = match RedologHeader::from_bytes(&header_bytes) {
            Some(h) => h,
            None => return Err(VvfatError::BadRedologHeader("short header")),
        };

        if !field_matches(&header.magic, STANDARD_HEADER_MAGIC) {
            return Err(VvfatError::BadRedologHeader("bad magic"));
        }
        if !field_matches(&header.image_type, REDOLOG_TYPE)
            || !field_matches(&header.subtype, subtype.as_bytes())
        {
            return Err(VvfatError::BadRedologHeader("bad type or subtype"));
        }
        if (header.version != STANDARD_HEADER_VERSION) && (header.version != STANDARD_HEADER_V1) {
            return Err(VvfatError::BadRedologHeader("bad version"));
        }

        log::debug!(
            "redolog: opened, #entries={}, bitmap size={}, extent size={}, disk size={}",
            header.catalog_entries,
            header.bitmap_size,
            header.extent_size,
            header.disk_size
        );

        let entries = header.catalog_entries as usize;
        let mut catalog_bytes = vec![0u8; entries * 4];
        file.seek(SeekFrom::Start(header.header_size as u64))?;
        file.read_exact(&mut catalog_bytes)?;

        let mut catalog = vec![NOT_ALLOCATED; entries];
        for (i, slot) in catalog.iter_mut().enumerate() {
            *slot = LittleEndian::read_u32(&catalog_bytes[i * 4..]);
        }

        // recover the next free physical extent slot
        let mut extent_next = 0;
        for &slot in catalog.iter() {
            if (slot != NOT_ALLOCATED) && (slot >= extent_next) {
                extent_next = slot + 1;
            }
        }

        let bitmap_size = header.bitmap_size;
        let extent_size = header.extent_size;

        let mut redolog = Self {
            file,
            bitmap: vec![0u8; bitmap_size as usize],
            bitmap_update: true,
            extent_index: 0,
            extent_offset: 0,
            extent_next,
            bitmap_blocks: 1 + (bitmap_size - 1) / 512,
            extent_blocks: 1 + (extent_size - 1) / 512,
            imagepos: 0,
            catalog,
            header,
        };

        if subtype == RedologSubtype::Growing {
            if let Some(mtime) = mtime {
                let (date, time) = fat_datetime(mtime);
                redolog.set_timestamp((time as u32) | ((date as u32) << 16))?;
            }
        }

        return Ok(redolog);
    }

    pub fn get_size(&self) -> u64 {
        return self.header.disk_size;
    }

    pub fn get_timestamp(&self) -> u32 {
        return self.header.timestamp;
    }

    pub fn set_timestamp(&mut self, timestamp: u32) -> Result<(), VvfatError> {
        self.header.timestamp = timestamp;
        self.write_at(0, &self.header.to_bytes())?;

        return Ok(());
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), VvfatError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;

        return Ok(());
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), VvfatError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;

        return Ok(());
    }

    /// Byte offset of the bitmap of the physical extent backing
    /// `extent_index`.
    fn bitmap_offset(&self, extent_index: u32) -> u64 {
        let data_start =
            (STANDARD_HEADER_SIZE as u64) + (self.header.catalog_entries as u64) * 4;

        return data_start
            + 512u64
                * (self.catalog[extent_index as usize] as u64)
                * ((self.extent_blocks + self.bitmap_blocks) as u64);
    }

    fn load_bitmap(&mut self) -> Result<(), VvfatError> {
        if self.bitmap_update {
            let offset = self.bitmap_offset(self.extent_index);
            let mut bitmap = std::mem::replace(&mut self.bitmap, Vec::new());
            let result = self.read_at(offset, &mut bitmap);
            self.bitmap = bitmap;
            result?;
            self.bitmap_update = false;
        }

        return Ok(());
    }

    fn commit_one_extent(
        &mut self,
        extent_index: u32,
        base: &mut dyn BlockDevice,
    ) -> Result<(), VvfatError> {
        let bitmap_offset = self.bitmap_offset(extent_index);

        let mut bitmap = vec![0u8; self.header.bitmap_size as usize];
        self.read_at(bitmap_offset, &mut bitmap)?;

        let mut buffer = [0u8; 512];
        for (byte_index, &byte) in bitmap.iter().enumerate() {
            for bit in 0..8 {
                if (byte & (1 << bit)) == 0 {
                    continue;
                }

                let block = (byte_index * 8 + bit) as u64;
                let block_offset =
                    bitmap_offset + 512 * ((self.bitmap_blocks as u64) + block);
                self.read_at(block_offset, &mut buffer)?;

                let base_offset =
                    (extent_index as u64) * (self.header.extent_size as u64) + 512 * block;
                base.seek(SeekFrom::Start(base_offset))?;
                base.write(&buffer)?;
            }
        }

        return Ok(());
    }

    /// Applies every present block to `base` at its home offset.
    pub fn commit(&mut self, base: &mut dyn BlockDevice) -> Result<(), VvfatError> {
        for extent_index in 0..self.header.catalog_entries {
            if self.catalog[extent_index as usize] != NOT_ALLOCATED {
                self.commit_one_extent(extent_index, base)?;
            }
        }

        return Ok(());
    }

    pub fn close(&mut self) {}
}

impl BlockDevice for Redolog {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, VvfatError> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => (self.imagepos as i64) + offset,
            SeekFrom::End(_) => return Err(VvfatError::UnsupportedSeek),
        };

        if (target % 512) != 0 {
            log::error!("redolog: seek offset not multiple of 512");
            return Err(VvfatError::Misaligned);
        }
        if (target < 0) || (target as u64 > self.header.disk_size) {
            return Err(VvfatError::OutOfBounds);
        }

        self.imagepos = target as u64;

        let old_extent_index = self.extent_index;
        self.extent_index = (self.imagepos / (self.header.extent_size as u64)) as u32;
        if self.extent_index != old_extent_index {
            self.bitmap_update = true;
        }
        self.extent_offset =
            ((self.imagepos % (self.header.extent_size as u64)) / 512) as u32;

        return Ok(self.imagepos);
    }

    /// `Ok(0)` signals that the block at the cursor was never written; the
    /// caller substitutes synthesized content.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VvfatError> {
        if buf.len() != 512 {
            return Err(VvfatError::Misaligned);
        }

        if (self.extent_index as usize) >= self.catalog.len() {
            return Ok(0);
        }
        if self.catalog[self.extent_index as usize] == NOT_ALLOCATED {
            return Ok(0);
        }

        self.load_bitmap()?;

        let offset = self.extent_offset as usize;
        if ((self.bitmap[offset / 8] >> (offset % 8)) & 0x01) == 0 {
            return Ok(0);
        }

        let block_offset = self.bitmap_offset(self.extent_index)
            + 512 * ((self.bitmap_blocks as u64) + (self.extent_offset as u64));
        self.read_at(block_offset, buf)?;
        self.seek(SeekFrom::Current(512))?;

        return Ok(512);
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, VvfatError> {
        if buf.len() != 512 {
            return Err(VvfatError::Misaligned);
        }

        if (self.extent_index as usize) >= self.catalog.len() {
            return Err(VvfatError::OutOfBounds);
        }

        let mut update_catalog = false;

        if self.catalog[self.extent_index as usize] == NOT_ALLOCATED {
            if self.extent_next >= self.header.catalog_entries {
                log::error!("redolog: can't allocate new extent, catalog is full");
                return Err(VvfatError::CatalogFull);
            }

            log::debug!("redolog: allocating new extent at {}", self.extent_next);

            self.catalog[self.extent_index as usize] = self.extent_next;
            self.extent_next += 1;

            // zero-fill the bitmap and extent regions of the new slot
            let zeroes = [0u8; 512];
            let region_start = self.bitmap_offset(self.extent_index);
            for block in 0..(self.bitmap_blocks + self.extent_blocks) as u64 {
                self.write_at(region_start + 512 * block, &zeroes)?;
            }

            update_catalog = true;
        }

        let bitmap_offset = self.bitmap_offset(self.extent_index);
        let block_offset =
            bitmap_offset + 512 * ((self.bitmap_blocks as u64) + (self.extent_offset as u64));

        self.write_at(block_offset, buf)?;

        self.load_bitmap()?;

        let offset = self.extent_offset as usize;
        if ((self.bitmap[offset / 8] >> (offset % 8)) & 0x01) == 0 {
            self.bitmap[offset / 8] |= 1 << (offset % 8);
            let bitmap = std::mem::replace(&mut self.bitmap, Vec::new());
            let result = self.write_at(bitmap_offset, &bitmap);
            self.bitmap = bitmap;
            result?;
        }

        if update_catalog {
            let catalog_offset =
                (STANDARD_HEADER_SIZE as u64) + (self.extent_index as u64) * 4;
            let mut slot = [0u8; 4];
            LittleEndian::write_u32(&mut slot, self.catalog[self.extent_index as usize]);
            self.write_at(catalog_offset, &slot)?;
        }

        self.seek(SeekFrom::Current(512))?;

        return Ok(512);
    }

    fn close(&mut self) -> Result<(), VvfatError> {
        self.close();

        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_parameters_small() {
        // the starting point already covers 2 MiB
        assert_eq!(size_parameters(1_474_560), (512, 1, 4096));
    }

    #[test]
    fn test_size_parameters_alternating() {
        // doubling alternates bitmap first, then entries
        assert_eq!(size_parameters(3 << 20), (512, 2, 8192));
        assert_eq!(size_parameters(5 << 20), (1024, 2, 8192));
        assert_eq!(size_parameters(516 << 20), (8192, 32, 131072));
    }

    #[test]
    fn test_size_parameters_cover_disk() {
        for &size in &[1u64 << 20, 100 << 20, 2 << 30, 50 << 30] {
            let (entries, bitmap, extent) = size_parameters(size);

            assert_eq!(extent, 8 * bitmap * 512);
            assert!((entries as u64) * (extent as u64) >= size);
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = RedologHeader {
            magic: pad_field(STANDARD_HEADER_MAGIC),
            image_type: pad_field(REDOLOG_TYPE),
            subtype: pad_field(b"Volatile"),
            version: STANDARD_HEADER_VERSION,
            header_size: 512,
            catalog_entries: 512,
            bitmap_size: 1,
            extent_size: 4096,
            timestamp: 0x12345678,
            disk_size: 1_474_560,
        };

        let parsed = RedologHeader::from_bytes(&header.to_bytes()).unwrap();

        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_v1_disk_size() {
        let mut bytes = [0u8; 512];
        bytes[..STANDARD_HEADER_MAGIC.len()].copy_from_slice(STANDARD_HEADER_MAGIC);
        bytes[32..32 + REDOLOG_TYPE.len()].copy_from_slice(REDOLOG_TYPE);
        bytes[48..56].copy_from_slice(b"Growing\0");
        LittleEndian::write_u32(&mut bytes[64..], STANDARD_HEADER_V1);
        LittleEndian::write_u32(&mut bytes[68..], 512);
        LittleEndian::write_u32(&mut bytes[72..], 512); // catalog
        LittleEndian::write_u32(&mut bytes[76..], 1); // bitmap
        LittleEndian::write_u32(&mut bytes[80..], 4096); // extent
        LittleEndian::write_u64(&mut bytes[84..], 99 << 20); // v1: disk right after extent

        let header = RedologHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.version, STANDARD_HEADER_V1);
        assert_eq!(header.disk_size, 99 << 20);
        assert_eq!(header.timestamp, 0);
    }

    #[test]
    fn test_volatile_file_is_unlinked() {
        let template = std::env::temp_dir().join("vvfat-volatile-test");
        let file = create_volatile_file(&template).unwrap();

        // the descriptor is live but no path under the temp dir names it
        assert!(file.metadata().unwrap().is_file());

        let entries: Vec<_> = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("vvfat-volatile-test")
            })
            .collect();
        assert!(entries.is_empty());
    }
}
