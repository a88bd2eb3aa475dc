use crate::ByteSerializable;
use byteorder::{ByteOrder, LittleEndian};

const SIGNATURE_1: u32 = 0x41615252;
const SIGNATURE_2: u32 = 0x61417272;

/// The FAT32 FS information sector (follows the boot sector).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoSector {
    pub free_clusters: u32,
    /// Most recently allocated cluster.
    pub mra_cluster: u32,
}

impl ByteSerializable for InfoSector {
    type BytesArrayType = [u8; 512];

    fn to_bytes(&self) -> Self::BytesArrayType {
        let mut bytes = [0u8; 512];

        LittleEndian::write_u32(&mut bytes[0..], SIGNATURE_1);
        LittleEndian::write_u32(&mut bytes[0x1e4..], SIGNATURE_2);
        LittleEndian::write_u32(&mut bytes[0x1e8..], self.free_clusters);
        LittleEndian::write_u32(&mut bytes[0x1ec..], self.mra_cluster);
        bytes[0x1fe] = 0x55;
        bytes[0x1ff] = 0xaa;

        return bytes;
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 512 {
            return None;
        }

        if (LittleEndian::read_u32(&bytes[0..]) != SIGNATURE_1)
            || (LittleEndian::read_u32(&bytes[0x1e4..]) != SIGNATURE_2)
        {
            return None;
        }

        return Some(Self {
            free_clusters: LittleEndian::read_u32(&bytes[0x1e8..]),
            mra_cluster: LittleEndian::read_u32(&bytes[0x1ec..]),
        });
    }
}
