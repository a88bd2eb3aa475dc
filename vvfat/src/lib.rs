//! Shadow a host directory as a raw FAT12/FAT16/FAT32 block device.
//!
//! Sector reads are synthesized from the directory contents; sector writes
//! are absorbed by a volatile, bitmap-backed redo log and folded back into
//! the host directory on commit.

mod arena;
mod block_device;
mod byte_serializable;
mod error;
pub mod image;
pub mod redolog;
mod time;

pub use arena::Arena;
pub use block_device::{BlockDevice, DiskGeometry, CAP_HAS_GEOMETRY};
pub use byte_serializable::ByteSerializable;
pub use error::VvfatError;
pub use image::{VvfatConfig, VvfatImage};
pub use redolog::{create_volatile_file, Redolog, RedologSubtype};
pub use time::{fat_date, fat_datetime, fat_time, system_time_from_fat};
