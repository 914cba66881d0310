//! Byte layouts for sled keys
//!
//! ```text
//! meta:     <timeline>
//! records:  <len:u32be><timeline><generation:u64be><record key>
//! waiting:  <score:8><timeline>
//! ready:    <score:8><timeline>
//! ```
//!
//! Scores are encoded so that byte order equals numeric order, which lets
//! index trees be range-scanned by due time.

use crate::store::StoreError;
use smallvec::SmallVec;

/// Stack buffer sized for typical timeline ids and record keys
pub type KeyBuf = SmallVec<[u8; 64]>;

const SIGN_BIT: u64 = 1 << 63;

/// Order-preserving big-endian encoding of an f64
pub fn encode_score(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let ordered = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    };
    ordered.to_be_bytes()
}

/// Inverse of `encode_score`
pub fn decode_score(bytes: [u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(bytes);
    let bits = if ordered & SIGN_BIT != 0 {
        ordered & !SIGN_BIT
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

/// Index row key: score then timeline id
pub fn index_key(score: f64, timeline: &str) -> KeyBuf {
    let mut key = KeyBuf::new();
    key.extend_from_slice(&encode_score(score));
    key.extend_from_slice(timeline.as_bytes());
    key
}

/// Split an index row key into (score, timeline)
pub fn parse_index_key(key: &[u8]) -> Result<(f64, String), StoreError> {
    if key.len() < 8 {
        return Err(StoreError::corrupt("index key", "shorter than a score"));
    }
    let (score, timeline) = key.split_at(8);
    let mut score_bytes = [0u8; 8];
    score_bytes.copy_from_slice(score);
    let timeline = std::str::from_utf8(timeline)
        .map_err(|e| StoreError::corrupt("index key", e))?
        .to_string();
    Ok((decode_score(score_bytes), timeline))
}

/// Prefix covering every record of a timeline, across generations
pub fn timeline_prefix(timeline: &str) -> KeyBuf {
    let mut key = KeyBuf::new();
    key.extend_from_slice(&(timeline.len() as u32).to_be_bytes());
    key.extend_from_slice(timeline.as_bytes());
    key
}

/// Prefix covering one generation of a timeline's records
pub fn generation_prefix(timeline: &str, generation: u64) -> KeyBuf {
    let mut key = timeline_prefix(timeline);
    key.extend_from_slice(&generation.to_be_bytes());
    key
}

/// Full record key
pub fn record_key(timeline: &str, generation: u64, record: &str) -> KeyBuf {
    let mut key = generation_prefix(timeline, generation);
    key.extend_from_slice(record.as_bytes());
    key
}

/// Generation of a record key found under `timeline_prefix(timeline)`
pub fn record_generation(timeline: &str, key: &[u8]) -> Result<u64, StoreError> {
    let start = 4 + timeline.len();
    let bytes = key
        .get(start..start + 8)
        .ok_or_else(|| StoreError::corrupt("record key", "missing generation"))?;
    let mut generation = [0u8; 8];
    generation.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(generation))
}
