use crate::error::ToolError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use vvfat::{BlockDevice, VvfatError};

/// A flat image file usable as the base device of a redo log commit or as
/// the target of an export.
pub struct RawImage {
    file: File,
}

impl RawImage {
    /// Creates a new zero-filled image of `size` bytes, overwriting any
    /// existing file.
    pub fn new_create(path: &str, size: u64) -> Result<Self, ToolError> {
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => {
                return Err(ToolError::new(&format!(
                    "Failed to create {}. Error: {}",
                    path, e
                )))
            }
        };

        // write the zeroes in bounded chunks
        let chunk = vec![0u8; 1 << 20];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            match file.write_all(&chunk[..n]) {
                Ok(_) => (),
                Err(e) => {
                    return Err(ToolError::new(&format!(
                        "Failed to write null bytes. Error: {}",
                        e
                    )))
                }
            }
            remaining -= n as u64;
        }

        return Ok(Self { file });
    }

    /// Opens an existing image file.
    pub fn new(path: &str) -> Result<Self, ToolError> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => {
                return Err(ToolError::new(&format!(
                    "Failed to open file {}. Error: {}",
                    path, e
                )))
            }
        };

        return Ok(Self { file });
    }

    pub fn size(&self) -> Result<u64, ToolError> {
        return match self.file.metadata() {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) => Err(ToolError::new(&format!(
                "Could not determine file size. Error: {}",
                e
            ))),
        };
    }
}

impl BlockDevice for RawImage {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, VvfatError> {
        return Ok(self.file.seek(pos)?);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VvfatError> {
        self.file.read_exact(buf)?;

        return Ok(buf.len());
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, VvfatError> {
        self.file.write_all(buf)?;

        return Ok(buf.len());
    }
}
