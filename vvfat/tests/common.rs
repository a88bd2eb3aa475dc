extern crate vvfat;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use vvfat::{BlockDevice, VvfatError};

static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A unique directory under the system temp dir, removed on drop.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vvfat-test-{}-{}-{}",
            tag,
            std::process::id(),
            DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path).unwrap();

        return Self { path };
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) {
        std::fs::write(self.path.join(name), contents).unwrap();
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// An in-memory block device, the commit target counterpart of the real
/// image file.
pub struct RamDisk {
    pub data: Vec<u8>,
    position: u64,
}

impl RamDisk {
    pub fn new(size: usize) -> Self {
        return Self {
            data: vec![0u8; size],
            position: 0,
        };
    }
}

impl BlockDevice for RamDisk {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, VvfatError> {
        match pos {
            SeekFrom::Start(offset) => self.position = offset,
            SeekFrom::Current(offset) => {
                self.position = ((self.position as i64) + offset) as u64
            }
            SeekFrom::End(_) => return Err(VvfatError::UnsupportedSeek),
        }

        return Ok(self.position);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VvfatError> {
        let start = self.position as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        self.position += buf.len() as u64;

        return Ok(buf.len());
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, VvfatError> {
        let start = self.position as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        self.position += buf.len() as u64;

        return Ok(buf.len());
    }
}

/// Reads one sector of `device` at `sector_num`.
pub fn read_sector(device: &mut dyn BlockDevice, sector_num: u64) -> [u8; 512] {
    let mut buffer = [0u8; 512];
    device.seek(SeekFrom::Start(sector_num * 512)).unwrap();
    device.read(&mut buffer).unwrap();

    return buffer;
}

/// Writes one sector of `device` at `sector_num`.
pub fn write_sector(device: &mut dyn BlockDevice, sector_num: u64, contents: &[u8; 512]) {
    device.seek(SeekFrom::Start(sector_num * 512)).unwrap();
    device.write(contents).unwrap();
}
