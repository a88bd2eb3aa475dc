use std::fmt::{self, Formatter};
use std::io;

#[derive(Debug)]
pub enum VvfatError {
    /// The boot sector file does not describe a FAT12/FAT16/FAT32 volume.
    UnsupportedBootSector,
    /// The MBR file carries a partition type this implementation cannot shadow.
    UnsupportedPartitionType(u8),
    /// The boot sector file contradicts the MBR file.
    InconsistentLayout,
    /// The shadowed tree needs more clusters than the chosen FAT can address.
    DirectoryTooLarge { fat_type: u8, capacity_mb: u64 },
    /// The FAT12/FAT16 root directory holds at most `root_entries` entries.
    RootDirectoryFull { root_entries: u16 },
    /// A file in the shadowed tree exceeds the 2 GiB FAT limit.
    FileTooLarge(String),
    /// All redo log catalog slots are in use; the write cannot be absorbed.
    CatalogFull,
    /// A redo log file failed header validation on open.
    BadRedologHeader(&'static str),
    /// Seek or read/write request not aligned to a 512-byte sector.
    Misaligned,
    /// Only `SeekFrom::Start` and `SeekFrom::Current` are supported.
    UnsupportedSeek,
    /// Seek past the end of the virtual disk.
    OutOfBounds,
    Io(io::Error),
}

impl fmt::Display for VvfatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        return match self {
            VvfatError::UnsupportedBootSector => {
                write!(f, "boot sector file: unsupported filesystem type")
            }
            VvfatError::UnsupportedPartitionType(t) => {
                write!(f, "MBR file: unsupported FS type = {:#04x}", t)
            }
            VvfatError::InconsistentLayout => {
                write!(f, "boot sector file does not match the MBR file")
            }
            VvfatError::DirectoryTooLarge { fat_type, capacity_mb } => write!(
                f,
                "directory does not fit in FAT{} (capacity {} MB)",
                fat_type, capacity_mb
            ),
            VvfatError::RootDirectoryFull { root_entries } => {
                write!(f, "too many entries in root directory (limit {})", root_entries)
            }
            VvfatError::FileTooLarge(path) => write!(f, "file '{}' is larger than 2GB", path),
            VvfatError::CatalogFull => {
                write!(f, "can't allocate new extent: redo log catalog is full")
            }
            VvfatError::BadRedologHeader(what) => write!(f, "redo log header: {}", what),
            VvfatError::Misaligned => write!(f, "request is not sector aligned"),
            VvfatError::UnsupportedSeek => write!(f, "seek mode not supported"),
            VvfatError::OutOfBounds => write!(f, "seek beyond the end of the virtual disk"),
            VvfatError::Io(e) => write!(f, "I/O error: {}", e),
        };
    }
}

impl std::error::Error for VvfatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        return match self {
            VvfatError::Io(e) => Some(e),
            _ => None,
        };
    }
}

impl From<io::Error> for VvfatError {
    fn from(e: io::Error) -> Self {
        return VvfatError::Io(e);
    }
}
