use crate::VvfatError;
use std::io::SeekFrom;

/// The device reports a fixed CHS geometry through `geometry()`.
pub const CAP_HAS_GEOMETRY: u32 = 0x02;

/// Cylinders, heads and sectors per track of a virtual disk, plus its total
/// size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub spt: u32,
    pub hd_size: u64,
}

/// Capability set shared by every sector store: a seekable, sector-granular
/// byte space. `SeekFrom::End` is not supported; only `Start` and `Current`.
///
/// `read` may legitimately return `Ok(0)` when the store has no bytes for the
/// current position (a sparse store signalling a miss); callers substitute
/// their own content. `write` returns the byte count absorbed.
pub trait BlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, VvfatError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, VvfatError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, VvfatError>;

    /// Releases the store. Infallible for most implementations.
    fn close(&mut self) -> Result<(), VvfatError> {
        return Ok(());
    }

    fn capabilities(&self) -> u32 {
        return 0;
    }
}
