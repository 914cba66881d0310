//! Leaf error types shared by every digest crate

use thiserror::Error;

/// Failure to encode or decode a record payload.
///
/// Decoding failures are isolated to a single record: the backend skips the
/// record and keeps digesting the rest of the timeline.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("payload is empty")]
    Empty,

    #[error("payload was written by codec '{found}', expected '{expected}'")]
    FormatMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Invalid backend option values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptionsError {
    #[error("timeline capacity must be at least 1 if used")]
    Capacity,

    #[error("truncation chance must be in (0, 1], got {0}")]
    TruncationChance(f64),

    #[error("{name} must be a finite, non-negative number of seconds, got {value}")]
    NegativeDelay { name: &'static str, value: f64 },

    #[error("minimum delay ({minimum}s) exceeds maximum delay ({maximum}s)")]
    DelayOrder { minimum: f64, maximum: f64 },

    #[error("record ttl must be positive, got {0}")]
    Ttl(f64),

    #[error("record ttl ({ttl}s) must exceed the retry window of {window}s")]
    TtlWithinRetryWindow { ttl: f64, window: f64 },

    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
}
