//! Block compression codecs
//!
//! Every sorted-table data block is compressed independently with the codec
//! configured when the table was written. The codec tag is stored with the
//! block and in the table footer, so tables keep their original codec after
//! the configuration changes.

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compression algorithm applied to new data blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    /// Store blocks as-is
    None = 0,
    /// LZ4 block format
    #[default]
    Lz4 = 1,
    /// Snappy raw format
    Snappy = 2,
}

impl Compression {
    /// On-disk tag
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Decode from the on-disk tag
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Snappy),
            _ => Err(StrataError::Corruption(format!(
                "Unknown compression tag: {}",
                tag
            ))),
        }
    }

    /// Compress a raw block
    pub fn compress(self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(raw.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress(raw)),
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(raw)
                .map_err(|e| StrataError::Compression(e.to_string())),
        }
    }

    /// Decompress a block whose uncompressed length is `raw_len`
    pub fn decompress(self, payload: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let raw = match self {
            Compression::None => payload.to_vec(),
            Compression::Lz4 => lz4_flex::decompress(payload, raw_len)
                .map_err(|e| StrataError::Compression(e.to_string()))?,
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(payload)
                .map_err(|e| StrataError::Compression(e.to_string()))?,
        };

        if raw.len() != raw_len {
            return Err(StrataError::Compression(format!(
                "Decompressed {} bytes, expected {}",
                raw.len(),
                raw_len
            )));
        }
        Ok(raw)
    }
}

impl FromStr for Compression {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" | "" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "snappy" => Ok(Compression::Snappy),
            other => Err(StrataError::Config(format!(
                "Unsupported compression algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..200)
            .map(|i| format!("electronics|{}.50|Product {}\n", i % 50, i))
            .collect::<String>()
            .into_bytes()
    }

    #[test]
    fn test_codecs_shrink_repetitive_blocks() {
        let raw = sample();
        for codec in [Compression::Lz4, Compression::Snappy] {
            let packed = codec.compress(&raw).unwrap();
            assert!(packed.len() < raw.len(), "{} did not compress", codec);
            assert_eq!(codec.decompress(&packed, raw.len()).unwrap(), raw);
        }
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let raw = sample();
        let packed = Compression::Snappy.compress(&raw).unwrap();
        let err = Compression::Snappy.decompress(&packed, raw.len() + 1).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("snappy".parse::<Compression>().unwrap(), Compression::Snappy);
        assert_eq!("LZ4".parse::<Compression>().unwrap(), Compression::Lz4);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert!("zstd".parse::<Compression>().is_err());
        assert_eq!(Compression::from_tag(2).unwrap(), Compression::Snappy);
        assert!(Compression::from_tag(7).is_err());
    }
}
