// Bit-exact on-disk structures of the virtual volume. Nothing in here is
// `#[repr(packed)]`; every structure serializes field-at-offset through
// `ByteSerializable`.

pub mod boot_sector;
pub mod direntry;
pub mod info_sector;
pub mod mbr;

pub use boot_sector::{BootSector, BootSectorTail, ExtendedFields};
pub use direntry::DirEntry;
pub use info_sector::InfoSector;
pub use mbr::{Chs, Mbr, PartitionEntry};
