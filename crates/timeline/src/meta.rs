//! Per-timeline metadata kept by the sled store

use crate::store::StoreError;
use digest_core::{RawRecord, TimelineState};
use serde::{Deserialize, Serialize};

/// Everything about a timeline except its records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineMeta {
    /// Schedule state (exactly one index)
    pub state: TimelineState,
    /// Generation new records are written to
    pub live_gen: u64,
    /// Records in the live generation
    pub live_count: u64,
    /// Highest generation frozen by the in-flight digest attempt
    pub digest_gen: Option<u64>,
    /// When the timeline was last digested successfully
    pub last_processed: Option<f64>,
}

impl TimelineMeta {
    /// Metadata for a timeline created by its first record
    pub fn new(live_gen: u64, due: f64) -> Self {
        Self {
            state: TimelineState::Waiting { due },
            live_gen,
            live_count: 0,
            digest_gen: None,
            last_processed: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::corrupt("timeline meta", e))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::corrupt("timeline meta", e))
    }
}

pub fn encode_record(record: &RawRecord) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(record).map_err(|e| StoreError::corrupt("record", e))
}

pub fn decode_record(bytes: &[u8]) -> Result<RawRecord, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::corrupt("record", e))
}
