//! The storage contract shared by every timeline store

use crate::Result;
use digest_core::{Backoff, Delays, RawRecord, ScheduleEntry, ScheduleIndex, TimelineState};
use thiserror::Error;

/// Errors raised by timeline stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation not valid for the timeline's current state
    #[error("timeline '{timeline}' {reason}")]
    InvalidState { timeline: String, reason: String },

    /// Underlying database failure
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Stored bytes could not be interpreted
    #[error("corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    /// A timeline kept changing underneath a multi-step operation
    #[error("timeline '{timeline}' kept changing; gave up after {attempts} attempts")]
    Contended { timeline: String, attempts: usize },
}

impl StoreError {
    pub fn invalid_state(timeline: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidState {
            timeline: timeline.to_string(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(what: &'static str, detail: impl ToString) -> Self {
        StoreError::Corrupt {
            what,
            detail: detail.to_string(),
        }
    }

    /// Whether a caller may retry the same operation later
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Storage(_) | StoreError::Contended { .. })
    }
}

impl From<sled::transaction::TransactionError<StoreError>> for StoreError {
    fn from(err: sled::transaction::TransactionError<StoreError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => StoreError::Storage(e),
        }
    }
}

/// Inputs for computing a timeline's next due time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicy {
    /// Reference time for the operation, unix seconds
    pub timestamp: f64,
    /// Delays in effect for this timeline
    pub delays: Delays,
    /// Strategy turning additions into delay
    pub backoff: Backoff,
}

/// Result of one atomic schedule or maintenance batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Timelines moved by this batch
    pub entries: Vec<ScheduleEntry>,
    /// Index rows examined; fewer than the limit means the index is drained
    pub scanned: usize,
}

impl Batch {
    pub fn is_exhausted(&self, limit: usize) -> bool {
        self.scanned < limit
    }
}

/// Records frozen for one digest attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DigestSnapshot {
    /// Identifies the attempt; only the latest attempt may commit
    pub token: u64,
    /// Snapshot records in delivery order (most recent first)
    pub records: Vec<RawRecord>,
}

/// What happened to a timeline when its digest committed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DigestOutcome {
    /// Records arrived during the digest; timeline is waiting again
    Rescheduled { due: f64 },
    /// Nothing left; timeline removed
    Deleted,
}

/// Durable per-timeline record sets plus the waiting/ready schedule
///
/// Every method is atomic with respect to other mutations of the same
/// timeline. A timeline's schedule state lives in exactly one index.
pub trait TimelineStore: Send + Sync {
    /// Upsert a record (by key) and create or update the timeline's schedule.
    ///
    /// Returns true when the timeline was absent and is now waiting with
    /// `due = policy.timestamp`.
    fn add(&self, timeline: &str, record: &RawRecord, policy: &SchedulePolicy) -> Result<bool>;

    /// Drop the oldest live records above `capacity`. Returns how many were dropped.
    fn truncate(&self, timeline: &str, capacity: usize) -> Result<usize>;

    /// Move up to `limit` waiting timelines due at or before `deadline` to
    /// ready, marking them ready since `timestamp`.
    fn schedule_batch(&self, deadline: f64, timestamp: f64, limit: usize) -> Result<Batch>;

    /// Move up to `limit` timelines ready since before `deadline` back to
    /// waiting, due at `timestamp`.
    fn maintenance_batch(&self, deadline: f64, timestamp: f64, limit: usize) -> Result<Batch>;

    /// Freeze the live records of a ready timeline into a digest snapshot,
    /// merged with any snapshot left by an earlier failed attempt.
    fn begin_digest(&self, timeline: &str) -> Result<DigestSnapshot>;

    /// Discard a snapshot after successful delivery, then reschedule or
    /// delete the timeline depending on whether records arrived meanwhile.
    fn commit_digest(
        &self,
        timeline: &str,
        token: u64,
        policy: &SchedulePolicy,
    ) -> Result<DigestOutcome>;

    /// Remove a timeline's records and schedule entry
    fn delete(&self, timeline: &str) -> Result<()>;

    /// Current schedule state, or None if the timeline does not exist
    fn state(&self, timeline: &str) -> Result<Option<TimelineState>>;

    /// Number of live (not yet snapshotted) records
    fn live_len(&self, timeline: &str) -> Result<usize>;

    /// All entries of one schedule index, ordered by score
    fn entries(&self, index: ScheduleIndex) -> Result<Vec<ScheduleEntry>>;

    /// Persist buffered writes
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
