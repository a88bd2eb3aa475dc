mod error;
mod raw_image;

pub use error::ToolError;
pub use raw_image::RawImage;

use byte_unit::Byte;

pub fn sized_string_to_u64(string: &str) -> Option<u64> {
    return match Byte::from_str(string) {
        Ok(b) => Some(b.get_bytes() as u64),
        Err(_) => None,
    };
}

pub fn u64_to_sized_string(n: u64) -> String {
    return Byte::from_bytes(n.into()).get_appropriate_unit(false).to_string();
}
