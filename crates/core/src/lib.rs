//! Digest Core - shared primitives for the digest scheduler
//!
//! This crate provides the leaf building blocks:
//! - Record, schedule entry and timeline state types
//! - Payload codecs (bincode + optional compression)
//! - Backoff strategies for rescheduling timelines
//! - Delay/capacity options and their validation
//! - Timeline id helpers and clock utilities

pub mod backoff;
pub mod codec;
pub mod error;
pub mod options;
pub mod record;
pub mod time;

// Re-export main types for convenience
pub use backoff::Backoff;
pub use codec::Codec;
pub use error::{CodecError, OptionsError};
pub use options::{BackendOptions, Delays, Overrides};
pub use record::{
    project_of, project_timeline, RawRecord, Record, ScheduleEntry, ScheduleIndex, TimelineState,
};
pub use time::now_secs;
