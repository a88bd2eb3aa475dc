// The virtual FAT volume: layout planning, host directory scan, sector
// serving, the guest write router and the commit walk.

mod attributes;
mod commit;
pub mod fat;
pub mod geometry;
mod image;
pub mod mapping;
pub mod on_disk;
mod scanner;

pub use fat::{Fat, FatType};
pub use geometry::{plan_layout, Layout};
pub use image::{VvfatConfig, VvfatImage, VVFAT_ATTR, VVFAT_BOOT, VVFAT_MBR};
pub use mapping::{Mapping, MappingInfo, MappingKind};
