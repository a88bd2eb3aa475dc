/// Implemented by every structure that appears bit-exact on the virtual disk.
/// All multi-byte fields are little-endian regardless of host endianness;
/// implementations serialize field by field at explicit offsets.
pub trait ByteSerializable {
    type BytesArrayType;

    fn to_bytes(&self) -> Self::BytesArrayType;

    /// Returns `None` if the buffer is too short or fails structural checks.
    fn from_bytes(bytes: &[u8]) -> Option<Self>
    where
        Self: core::marker::Sized;
}
