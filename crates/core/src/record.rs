//! Records, schedule entries and timeline state

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A notification-worthy item queued on a timeline.
///
/// `key` is unique within a timeline: adding the same key again replaces the
/// value and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    /// Unique key within the timeline
    pub key: String,
    /// Decoded payload
    pub value: T,
    /// Unix seconds
    pub timestamp: f64,
}

impl<T> Record<T> {
    /// Create a new record
    pub fn new(key: impl Into<String>, value: T, timestamp: f64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
        }
    }
}

/// A record whose payload is still codec-encoded, as held by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: f64,
}

impl RawRecord {
    pub fn new(key: impl Into<String>, value: Vec<u8>, timestamp: f64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
        }
    }

    /// Digest delivery order: most recent first, ties broken by key (descending).
    pub fn digest_order(a: &RawRecord, b: &RawRecord) -> Ordering {
        b.timestamp
            .total_cmp(&a.timestamp)
            .then_with(|| b.key.cmp(&a.key))
    }

    /// Age order: oldest first, ties broken by key. Truncation drops from the front.
    pub fn age_order(a: &RawRecord, b: &RawRecord) -> Ordering {
        a.timestamp
            .total_cmp(&b.timestamp)
            .then_with(|| a.key.cmp(&b.key))
    }
}

/// A timeline's position in one of the two schedule indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Timeline id
    pub timeline: String,
    /// Due time (waiting) or ready-since time (ready), unix seconds
    pub timestamp: f64,
}

impl ScheduleEntry {
    pub fn new(timeline: impl Into<String>, timestamp: f64) -> Self {
        Self {
            timeline: timeline.into(),
            timestamp,
        }
    }
}

/// The two global schedule indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleIndex {
    Waiting,
    Ready,
}

impl ScheduleIndex {
    /// Whether a row scored `score` is moved by a pass with `deadline`.
    ///
    /// Waiting timelines due exactly at the deadline are due; ready
    /// timelines must be strictly older than it.
    pub fn selects(self, score: f64, deadline: f64) -> bool {
        match self {
            ScheduleIndex::Waiting => score <= deadline,
            ScheduleIndex::Ready => score < deadline,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleIndex::Waiting => "waiting",
            ScheduleIndex::Ready => "ready",
        }
    }
}

/// Schedule state of an existing timeline.
///
/// A timeline holds exactly one of these, so it can never sit in both
/// indexes at once. An absent timeline has no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimelineState {
    /// Waiting to become due
    Waiting { due: f64 },
    /// Moved to ready by `schedule`, awaiting digestion
    Ready { since: f64 },
}

impl TimelineState {
    /// Index this state is filed under
    pub fn index(&self) -> ScheduleIndex {
        match self {
            TimelineState::Waiting { .. } => ScheduleIndex::Waiting,
            TimelineState::Ready { .. } => ScheduleIndex::Ready,
        }
    }

    /// Score within that index
    pub fn score(&self) -> f64 {
        match *self {
            TimelineState::Waiting { due } => due,
            TimelineState::Ready { since } => since,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, TimelineState::Ready { .. })
    }
}

const PROJECT_MARKER: &str = ":p:";

/// Build the timeline id for a project: `<namespace>:p:<project>`
pub fn project_timeline(namespace: &str, project: &str) -> String {
    format!("{namespace}{PROJECT_MARKER}{project}")
}

/// Extract the project from a `<namespace>:p:<project>` timeline id
pub fn project_of(timeline: &str) -> Option<&str> {
    let (_, project) = timeline.split_once(PROJECT_MARKER)?;
    if project.is_empty() {
        None
    } else {
        Some(project)
    }
}
