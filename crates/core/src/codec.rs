//! Record payload codecs
//!
//! Payloads are serialized with bincode and optionally compressed. Every
//! encoded payload starts with a one-byte tag naming the codec that wrote it,
//! so bytes from one codec are rejected by another instead of misread.

use crate::error::{CodecError, OptionsError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::str::FromStr;

const TAG_BINCODE: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;
const TAG_GZIP: u8 = 0x03;

/// Supported payload codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Codec {
    /// Plain bincode
    Bincode,
    /// bincode + zstd
    Zstd { level: i32 },
    /// bincode + gzip
    Gzip { level: u32 },
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Zstd { level: 3 }
    }
}

impl Codec {
    /// Codec name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Bincode => "bincode",
            Codec::Zstd { .. } => "zstd",
            Codec::Gzip { .. } => "gzip",
        }
    }

    /// Build a codec from its configuration name and optional level
    pub fn from_name(name: &str, level: Option<i32>) -> Result<Self, OptionsError> {
        match name.to_ascii_lowercase().as_str() {
            "bincode" => Ok(Codec::Bincode),
            "zstd" => Ok(Codec::Zstd {
                level: level.unwrap_or(3),
            }),
            "gzip" => Ok(Codec::Gzip {
                level: level.map(|l| l.clamp(0, 9) as u32).unwrap_or(6),
            }),
            other => Err(OptionsError::Unknown {
                kind: "codec",
                name: other.to_string(),
            }),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Codec::Bincode => TAG_BINCODE,
            Codec::Zstd { .. } => TAG_ZSTD,
            Codec::Gzip { .. } => TAG_GZIP,
        }
    }

    /// Encode a value into tagged bytes
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let serialized =
            bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;

        let mut out = Vec::with_capacity(serialized.len() + 1);
        out.push(self.tag());

        match *self {
            Codec::Bincode => out.extend_from_slice(&serialized),
            Codec::Zstd { level } => {
                let compressed = zstd::encode_all(serialized.as_slice(), level)?;
                out.extend_from_slice(&compressed);
            }
            Codec::Gzip { level } => {
                let mut encoder = GzEncoder::new(out, Compression::new(level));
                encoder.write_all(&serialized)?;
                out = encoder.finish()?;
            }
        }

        Ok(out)
    }

    /// Decode tagged bytes produced by `encode`
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let (&tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        if tag != self.tag() {
            return Err(CodecError::FormatMismatch {
                expected: self.name(),
                found: tag_name(tag),
            });
        }

        let serialized = match self {
            Codec::Bincode => return deserialize(body),
            Codec::Zstd { .. } => zstd::decode_all(body)?,
            Codec::Gzip { .. } => {
                let mut decoder = GzDecoder::new(body);
                let mut buf = Vec::new();
                decoder.read_to_end(&mut buf)?;
                buf
            }
        };

        deserialize(&serialized)
    }
}

impl FromStr for Codec {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Codec::from_name(s, None)
    }
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

fn tag_name(tag: u8) -> String {
    match tag {
        TAG_BINCODE => "bincode".to_string(),
        TAG_ZSTD => "zstd".to_string(),
        TAG_GZIP => "gzip".to_string(),
        other => format!("unknown(0x{other:02x})"),
    }
}
