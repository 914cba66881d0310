//! In-process timeline store
//!
//! A single mutex guards all state, which makes every operation trivially
//! atomic. Useful for tests and for embedding a backend that does not need
//! to survive restarts.

use crate::store::{Batch, DigestOutcome, DigestSnapshot, SchedulePolicy, StoreError, TimelineStore};
use crate::Result;
use ahash::AHashMap;
use digest_core::{RawRecord, ScheduleEntry, ScheduleIndex, TimelineState};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// f64 with a total order, for use in ordered sets
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug)]
struct Timeline {
    state: TimelineState,
    live: AHashMap<String, RawRecord>,
    /// Token and records of the latest digest attempt
    digesting: Option<(u64, AHashMap<String, RawRecord>)>,
    last_processed: Option<f64>,
}

#[derive(Debug, Default)]
struct Inner {
    timelines: AHashMap<String, Timeline>,
    waiting: BTreeSet<(Score, String)>,
    ready: BTreeSet<(Score, String)>,
    next_token: u64,
}

impl Inner {
    fn index_mut(&mut self, index: ScheduleIndex) -> &mut BTreeSet<(Score, String)> {
        match index {
            ScheduleIndex::Waiting => &mut self.waiting,
            ScheduleIndex::Ready => &mut self.ready,
        }
    }

    fn file(&mut self, timeline: &str, state: &TimelineState) {
        self.index_mut(state.index())
            .insert((Score(state.score()), timeline.to_string()));
    }

    fn unfile(&mut self, timeline: &str, state: &TimelineState) {
        self.index_mut(state.index())
            .remove(&(Score(state.score()), timeline.to_string()));
    }

    fn set_state(&mut self, timeline: &str, next: TimelineState) {
        let Some(current) = self.timelines.get(timeline).map(|t| t.state) else {
            return;
        };
        self.unfile(timeline, &current);
        self.file(timeline, &next);
        if let Some(t) = self.timelines.get_mut(timeline) {
            t.state = next;
        }
    }

    fn move_due(
        &mut self,
        from: ScheduleIndex,
        deadline: f64,
        timestamp: f64,
        limit: usize,
    ) -> Batch {
        let due: Vec<(Score, String)> = self
            .index_mut(from)
            .iter()
            .take_while(|(score, _)| from.selects(score.0, deadline))
            .take(limit)
            .cloned()
            .collect();

        let mut entries = Vec::with_capacity(due.len());
        for (score, timeline) in &due {
            let next = match from {
                ScheduleIndex::Waiting => {
                    entries.push(ScheduleEntry::new(timeline.clone(), score.0));
                    TimelineState::Ready { since: timestamp }
                }
                ScheduleIndex::Ready => {
                    entries.push(ScheduleEntry::new(timeline.clone(), timestamp));
                    TimelineState::Waiting { due: timestamp }
                }
            };
            self.set_state(timeline, next);
        }

        Batch {
            entries,
            scanned: due.len(),
        }
    }
}

/// Timeline store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timelines currently stored
    pub fn timeline_count(&self) -> usize {
        self.inner.lock().timelines.len()
    }
}

impl TimelineStore for MemoryStore {
    fn add(&self, timeline: &str, record: &RawRecord, policy: &SchedulePolicy) -> Result<bool> {
        let mut inner = self.inner.lock();

        let created = !inner.timelines.contains_key(timeline);
        if created {
            let state = TimelineState::Waiting {
                due: policy.timestamp,
            };
            inner.timelines.insert(
                timeline.to_string(),
                Timeline {
                    state,
                    live: AHashMap::new(),
                    digesting: None,
                    last_processed: None,
                },
            );
            inner.file(timeline, &state);
        } else if let Some(t) = inner.timelines.get(timeline) {
            if let TimelineState::Waiting { due } = t.state {
                let next =
                    policy
                        .backoff
                        .extend(&policy.delays, due, policy.timestamp, t.last_processed);
                if next != due {
                    inner.set_state(timeline, TimelineState::Waiting { due: next });
                }
            }
        }

        if let Some(t) = inner.timelines.get_mut(timeline) {
            t.live.insert(record.key.clone(), record.clone());
        }
        Ok(created)
    }

    fn truncate(&self, timeline: &str, capacity: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let Some(t) = inner.timelines.get_mut(timeline) else {
            return Ok(0);
        };

        let excess = t.live.len().saturating_sub(capacity);
        if excess == 0 {
            return Ok(0);
        }

        let mut by_age: Vec<&RawRecord> = t.live.values().collect();
        by_age.sort_by(|a, b| RawRecord::age_order(a, b));
        let victims: Vec<String> = by_age.iter().take(excess).map(|r| r.key.clone()).collect();
        for key in &victims {
            t.live.remove(key);
        }
        Ok(victims.len())
    }

    fn schedule_batch(&self, deadline: f64, timestamp: f64, limit: usize) -> Result<Batch> {
        Ok(self
            .inner
            .lock()
            .move_due(ScheduleIndex::Waiting, deadline, timestamp, limit))
    }

    fn maintenance_batch(&self, deadline: f64, timestamp: f64, limit: usize) -> Result<Batch> {
        Ok(self
            .inner
            .lock()
            .move_due(ScheduleIndex::Ready, deadline, timestamp, limit))
    }

    fn begin_digest(&self, timeline: &str) -> Result<DigestSnapshot> {
        let mut inner = self.inner.lock();
        inner.next_token += 1;
        let token = inner.next_token;

        let Some(t) = inner.timelines.get_mut(timeline) else {
            return Err(StoreError::invalid_state(timeline, "does not exist"));
        };
        if !t.state.is_ready() {
            return Err(StoreError::invalid_state(
                timeline,
                "is not in the ready state",
            ));
        }

        let mut snapshot = t.digesting.take().map(|(_, r)| r).unwrap_or_default();
        for (key, record) in t.live.drain() {
            let keep_existing = snapshot
                .get(&key)
                .map(|existing| existing.timestamp > record.timestamp)
                .unwrap_or(false);
            if !keep_existing {
                snapshot.insert(key, record);
            }
        }

        let mut records: Vec<RawRecord> = snapshot.values().cloned().collect();
        records.sort_by(RawRecord::digest_order);
        t.digesting = Some((token, snapshot));

        Ok(DigestSnapshot { token, records })
    }

    fn commit_digest(
        &self,
        timeline: &str,
        token: u64,
        policy: &SchedulePolicy,
    ) -> Result<DigestOutcome> {
        let mut inner = self.inner.lock();
        let Some(t) = inner.timelines.get_mut(timeline) else {
            return Ok(DigestOutcome::Deleted);
        };
        if t.digesting.as_ref().map(|(current, _)| *current) != Some(token) {
            return Err(StoreError::invalid_state(
                timeline,
                "digest was superseded by a newer attempt",
            ));
        }
        t.digesting = None;

        if t.live.is_empty() {
            let state = t.state;
            inner.timelines.remove(timeline);
            inner.unfile(timeline, &state);
            return Ok(DigestOutcome::Deleted);
        }

        let due = policy.timestamp + policy.backoff.delay(&policy.delays, t.live.len() as u64);
        t.last_processed = Some(policy.timestamp);
        inner.set_state(timeline, TimelineState::Waiting { due });
        Ok(DigestOutcome::Rescheduled { due })
    }

    fn delete(&self, timeline: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(t) = inner.timelines.remove(timeline) {
            inner.unfile(timeline, &t.state);
        }
        Ok(())
    }

    fn state(&self, timeline: &str) -> Result<Option<TimelineState>> {
        Ok(self.inner.lock().timelines.get(timeline).map(|t| t.state))
    }

    fn live_len(&self, timeline: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .timelines
            .get(timeline)
            .map(|t| t.live.len())
            .unwrap_or(0))
    }

    fn entries(&self, index: ScheduleIndex) -> Result<Vec<ScheduleEntry>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .index_mut(index)
            .iter()
            .map(|(score, timeline)| ScheduleEntry::new(timeline.clone(), score.0))
            .collect())
    }
}
