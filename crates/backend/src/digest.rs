//! Scoped digest handle
//!
//! A `Digest` holds the decoded snapshot of one ready timeline. Nothing is
//! removed from the store until `commit()`; `abort()` or dropping the handle
//! leaves the snapshot in place so the next attempt delivers it again along
//! with anything added meanwhile.

use crate::backend::Clock;
use crate::Result;
use digest_core::{Backoff, Delays, Record};
use timeline::{DigestOutcome, SchedulePolicy, TimelineStore};
use tracing::{debug, info};
use ulid::Ulid;

/// Store-side state needed to finish an attempt
pub(crate) struct Pending<'a> {
    pub store: &'a dyn TimelineStore,
    pub token: u64,
    pub delays: Delays,
    pub backoff: Backoff,
    pub clock: Clock,
}

/// One in-flight digest attempt
pub struct Digest<'a, T> {
    id: Ulid,
    timeline: String,
    records: Vec<Record<T>>,
    skipped: usize,
    pending: Option<Pending<'a>>,
}

impl<'a, T> Digest<'a, T> {
    pub(crate) fn new(
        timeline: &str,
        records: Vec<Record<T>>,
        skipped: usize,
        pending: Pending<'a>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            timeline: timeline.to_string(),
            records,
            skipped,
            pending: Some(pending),
        }
    }

    /// A digest with no records and nothing to commit
    pub fn empty(timeline: &str) -> Self {
        Self {
            id: Ulid::new(),
            timeline: timeline.to_string(),
            records: Vec::new(),
            skipped: 0,
            pending: None,
        }
    }

    /// Unique id of this attempt, for logs and notification payloads
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn timeline(&self) -> &str {
        &self.timeline
    }

    /// Snapshot records, most recent first
    pub fn records(&self) -> &[Record<T>] {
        &self.records
    }

    /// Records dropped because they failed to decode or had expired
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Acknowledge delivery using the backend clock for rescheduling
    pub fn commit(mut self) -> Result<DigestOutcome> {
        let Some(pending) = self.pending.take() else {
            return Ok(DigestOutcome::Deleted);
        };
        let now = (pending.clock)();
        self.finish(pending, now)
    }

    /// Acknowledge delivery, rescheduling relative to `timestamp`
    pub fn commit_at(mut self, timestamp: f64) -> Result<DigestOutcome> {
        let Some(pending) = self.pending.take() else {
            return Ok(DigestOutcome::Deleted);
        };
        self.finish(pending, timestamp)
    }

    fn finish(&self, pending: Pending<'_>, timestamp: f64) -> Result<DigestOutcome> {
        let policy = SchedulePolicy {
            timestamp,
            delays: pending.delays,
            backoff: pending.backoff,
        };
        let outcome = pending
            .store
            .commit_digest(&self.timeline, pending.token, &policy)?;

        info!(
            timeline = %self.timeline,
            digest = %self.id,
            records = self.records.len(),
            skipped = self.skipped,
            ?outcome,
            "digest committed"
        );
        Ok(outcome)
    }

    /// Give up on this attempt; the records stay queued
    pub fn abort(mut self) {
        if self.pending.take().is_some() {
            debug!(timeline = %self.timeline, digest = %self.id, "digest aborted");
        }
    }
}

impl<T> Drop for Digest<'_, T> {
    fn drop(&mut self) {
        if self.pending.take().is_some() {
            debug!(
                timeline = %self.timeline,
                digest = %self.id,
                "digest dropped without commit, records stay queued"
            );
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Digest<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Digest")
            .field("id", &self.id)
            .field("timeline", &self.timeline)
            .field("records", &self.records)
            .field("skipped", &self.skipped)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}
