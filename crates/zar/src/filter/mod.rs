//! Membership filters over the paths contained in an image.
//!
//! A filter answers "definitely absent" or "maybe present" for a path
//! without touching the entry stream.  The encoded filter blob is located
//! by a [`FilterDescriptor`] trailer whose `name` field tags the algorithm;
//! only one concrete algorithm ships, so readers dispatch on the tag rather
//! than through open-ended trait objects.

pub mod bloom;

pub use bloom::BloomFilter;

use serde::{Deserialize, Serialize};

/// Algorithm tag of the shipped filter.
pub const BLOOM_FILTER_NAME: &str = "BloomFilter";

/// Self-locating description of the encoded filter blob, serialized as the
/// final trailer of the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    /// Whether a filter is enforced for this image.
    pub active: bool,
    /// Name of the filter algorithm; [`BLOOM_FILTER_NAME`] by default.
    pub name: String,
    /// Byte offset of the encoded filter blob.
    pub filter_loc: i64,
    /// Byte length of the encoded filter blob.
    pub filter_size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_serde_roundtrip() {
        let descriptor = FilterDescriptor {
            active: true,
            name: BLOOM_FILTER_NAME.to_owned(),
            filter_loc: 8258,
            filter_size: 1044,
        };
        let encoded = serde_json::to_vec(&descriptor).unwrap();
        let decoded: FilterDescriptor = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, descriptor);
    }
}
