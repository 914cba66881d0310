//! Durable timeline store on sled
//!
//! Four trees back the store: `meta` (schedule state and counters per
//! timeline), `records`, and the `waiting`/`ready` score indexes. Every
//! mutation is a multi-tree sled transaction. Range scans happen outside the
//! transaction and are re-validated against `meta` inside it.
//!
//! Records are grouped into generations. Beginning a digest freezes the live
//! generation and opens a new one, so records added during delivery land in
//! the next digest instead of this one.

use crate::keys::{
    generation_prefix, index_key, parse_index_key, record_generation, record_key,
    timeline_prefix,
};
use crate::meta::{decode_record, encode_record, TimelineMeta};
use crate::store::{Batch, DigestOutcome, DigestSnapshot, SchedulePolicy, StoreError, TimelineStore};
use crate::Result;
use ahash::AHashMap;
use digest_core::{RawRecord, ScheduleEntry, ScheduleIndex, TimelineState};
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use tracing::{debug, trace};

/// Attempts before `delete` gives up on a timeline that keeps changing
const DELETE_ATTEMPTS: usize = 8;

const EMPTY: &[u8] = &[];

type TxResult<T> = ConflictableTransactionResult<T, StoreError>;

/// Timeline store backed by a sled database
pub struct SledStore {
    db: Db,
    meta: Tree,
    records: Tree,
    waiting: Tree,
    ready: Tree,
}

impl SledStore {
    /// Open or create a store at the given directory. sled locks the
    /// database, so a second process opening the same directory fails.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path.join("timelines.db"))?;
        Self::from_db(db)
    }

    /// Open a throwaway store that is removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            meta: db.open_tree("meta")?,
            records: db.open_tree("records")?,
            waiting: db.open_tree("waiting")?,
            ready: db.open_tree("ready")?,
            db,
        })
    }

    fn load_meta(&self, timeline: &str) -> Result<Option<TimelineMeta>> {
        match self.meta.get(timeline.as_bytes())? {
            Some(bytes) => Ok(Some(TimelineMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn index_tree(&self, index: ScheduleIndex) -> &Tree {
        match index {
            ScheduleIndex::Waiting => &self.waiting,
            ScheduleIndex::Ready => &self.ready,
        }
    }

    /// Index rows selected by `deadline`, oldest first, at most `limit`
    fn scan_due(&self, index: ScheduleIndex, deadline: f64, limit: usize) -> Result<Vec<(f64, String)>> {
        let mut due = Vec::new();
        for item in self.index_tree(index).iter() {
            if due.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let (score, timeline) = parse_index_key(&key)?;
            if !index.selects(score, deadline) {
                break;
            }
            due.push((score, timeline));
        }
        Ok(due)
    }

    /// Keys of every record in generations up to and including `max_gen`
    fn frozen_keys(&self, timeline: &str, max_gen: Option<u64>) -> Result<Vec<IVec>> {
        let mut keys = Vec::new();
        for item in self.records.scan_prefix(timeline_prefix(timeline).as_slice()) {
            let (key, _) = item?;
            let keep = match max_gen {
                Some(max_gen) => record_generation(timeline, &key)? <= max_gen,
                None => true,
            };
            if keep {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Oldest live records above `capacity`, with the bytes they were read with
    fn truncation_victims(
        &self,
        timeline: &str,
        capacity: usize,
    ) -> Result<Option<(u64, Vec<(IVec, IVec)>)>> {
        let Some(before) = self.load_meta(timeline)? else {
            return Ok(None);
        };
        if before.live_count as usize <= capacity {
            return Ok(None);
        }

        let mut live = Vec::new();
        for item in self
            .records
            .scan_prefix(generation_prefix(timeline, before.live_gen).as_slice())
        {
            let (key, value) = item?;
            live.push((decode_record(&value)?, key, value));
        }
        live.sort_by(|a, b| RawRecord::age_order(&a.0, &b.0));

        let excess = live.len().saturating_sub(capacity);
        if excess == 0 {
            return Ok(None);
        }
        let victims = live
            .into_iter()
            .take(excess)
            .map(|(_, key, value)| (key, value))
            .collect();
        Ok(Some((before.live_gen, victims)))
    }

    /// Remove victims still holding the bytes they were chosen with
    fn remove_victims(
        &self,
        timeline: &str,
        live_gen: u64,
        victims: &[(IVec, IVec)],
    ) -> Result<usize> {
        let removed = (&self.meta, &self.records).transaction(|(meta, records)| -> TxResult<usize> {
            let Some(mut m) = read_meta(meta, timeline)? else {
                return Ok(0);
            };
            if m.live_gen != live_gen {
                // A digest froze this generation meanwhile
                return Ok(0);
            }

            let mut removed = 0u64;
            for (key, scanned) in victims {
                // Re-added since the scan: no longer among the oldest
                if records.get(key)?.as_ref() != Some(scanned) {
                    continue;
                }
                records.remove(key.clone())?;
                removed += 1;
            }
            m.live_count = m.live_count.saturating_sub(removed);
            write_meta(meta, timeline, &m)?;
            Ok(removed as usize)
        })?;
        Ok(removed)
    }

    /// Move every due row of `from` into the other index, one transaction
    fn move_batch(
        &self,
        from: ScheduleIndex,
        deadline: f64,
        timestamp: f64,
        limit: usize,
    ) -> Result<Batch> {
        let candidates = self.scan_due(from, deadline, limit)?;
        if candidates.is_empty() {
            return Ok(Batch::default());
        }

        let entries = (&self.meta, &self.waiting, &self.ready).transaction(
            |(meta, waiting, ready)| -> TxResult<Vec<ScheduleEntry>> {
                let mut moved = Vec::new();
                let tree = if from == ScheduleIndex::Waiting { waiting } else { ready };
                for (score, timeline) in &candidates {
                    let current = read_meta(meta, timeline)?;
                    let Some(mut m) = current.filter(|m| {
                        m.state.index() == from && m.state.score() == *score
                    }) else {
                        // Row outlived the state it was filed for
                        tree.remove(index_key(*score, timeline).as_slice())?;
                        continue;
                    };

                    let next = match m.state {
                        TimelineState::Waiting { due } => {
                            moved.push(ScheduleEntry::new(timeline.clone(), due));
                            TimelineState::Ready { since: timestamp }
                        }
                        TimelineState::Ready { .. } => {
                            moved.push(ScheduleEntry::new(timeline.clone(), timestamp));
                            TimelineState::Waiting { due: timestamp }
                        }
                    };

                    unfile(waiting, ready, timeline, &m.state)?;
                    file(waiting, ready, timeline, &next)?;
                    m.state = next;
                    write_meta(meta, timeline, &m)?;
                }
                Ok(moved)
            },
        )?;

        Ok(Batch {
            entries,
            scanned: candidates.len(),
        })
    }
}

fn read_meta(meta: &TransactionalTree, timeline: &str) -> TxResult<Option<TimelineMeta>> {
    match meta.get(timeline.as_bytes())? {
        Some(bytes) => TimelineMeta::decode(&bytes)
            .map(Some)
            .map_err(ConflictableTransactionError::Abort),
        None => Ok(None),
    }
}

fn write_meta(
    meta: &TransactionalTree,
    timeline: &str,
    m: &TimelineMeta,
) -> TxResult<()> {
    let bytes = m.encode().map_err(ConflictableTransactionError::Abort)?;
    meta.insert(timeline.as_bytes(), bytes)?;
    Ok(())
}

/// Add the index row for a state
fn file(
    waiting: &TransactionalTree,
    ready: &TransactionalTree,
    timeline: &str,
    state: &TimelineState,
) -> TxResult<()> {
    let tree = match state.index() {
        ScheduleIndex::Waiting => waiting,
        ScheduleIndex::Ready => ready,
    };
    tree.insert(index_key(state.score(), timeline).as_slice(), EMPTY)?;
    Ok(())
}

/// Remove the index row for a state
fn unfile(
    waiting: &TransactionalTree,
    ready: &TransactionalTree,
    timeline: &str,
    state: &TimelineState,
) -> TxResult<()> {
    let tree = match state.index() {
        ScheduleIndex::Waiting => waiting,
        ScheduleIndex::Ready => ready,
    };
    tree.remove(index_key(state.score(), timeline).as_slice())?;
    Ok(())
}

impl TimelineStore for SledStore {
    fn add(&self, timeline: &str, record: &RawRecord, policy: &SchedulePolicy) -> Result<bool> {
        let value = encode_record(record)?;
        let fresh_gen = self.db.generate_id()?;

        let created = (&self.meta, &self.records, &self.waiting, &self.ready).transaction(
            |(meta, records, waiting, ready)| -> TxResult<bool> {
                let (mut m, created) = match read_meta(meta, timeline)? {
                    Some(m) => (m, false),
                    None => (TimelineMeta::new(fresh_gen, policy.timestamp), true),
                };

                if created {
                    file(waiting, ready, timeline, &m.state)?;
                } else if let TimelineState::Waiting { due } = m.state {
                    let next = policy.backoff.extend(
                        &policy.delays,
                        due,
                        policy.timestamp,
                        m.last_processed,
                    );
                    if next != due {
                        let next = TimelineState::Waiting { due: next };
                        unfile(waiting, ready, timeline, &m.state)?;
                        file(waiting, ready, timeline, &next)?;
                        m.state = next;
                    }
                }

                let key = record_key(timeline, m.live_gen, &record.key);
                if records.insert(key.as_slice(), value.as_slice())?.is_none() {
                    m.live_count += 1;
                }

                write_meta(meta, timeline, &m)?;
                Ok(created)
            },
        )?;

        trace!(timeline, key = %record.key, created, "record added");
        Ok(created)
    }

    fn truncate(&self, timeline: &str, capacity: usize) -> Result<usize> {
        let Some((live_gen, victims)) = self.truncation_victims(timeline, capacity)? else {
            return Ok(0);
        };
        let removed = self.remove_victims(timeline, live_gen, &victims)?;
        debug!(timeline, removed, capacity, "timeline truncated");
        Ok(removed)
    }

    fn schedule_batch(&self, deadline: f64, timestamp: f64, limit: usize) -> Result<Batch> {
        self.move_batch(ScheduleIndex::Waiting, deadline, timestamp, limit)
    }

    fn maintenance_batch(&self, deadline: f64, timestamp: f64, limit: usize) -> Result<Batch> {
        self.move_batch(ScheduleIndex::Ready, deadline, timestamp, limit)
    }

    fn begin_digest(&self, timeline: &str) -> Result<DigestSnapshot> {
        let next_gen = self.db.generate_id()?;

        let token = self.meta.transaction(|meta| -> TxResult<u64> {
            let Some(mut m) = read_meta(meta, timeline)? else {
                return abort(StoreError::invalid_state(timeline, "does not exist"));
            };
            if !m.state.is_ready() {
                return abort(StoreError::invalid_state(
                    timeline,
                    "is not in the ready state",
                ));
            }

            // Earlier failed attempts left lower generations in place; the
            // new snapshot covers them too.
            let token = m.live_gen;
            m.digest_gen = Some(token);
            m.live_gen = next_gen;
            m.live_count = 0;
            write_meta(meta, timeline, &m)?;
            Ok(token)
        })?;

        // Frozen generations no longer change, so a plain scan is stable
        let mut latest: AHashMap<String, (u64, RawRecord)> = AHashMap::new();
        for item in self.records.scan_prefix(timeline_prefix(timeline).as_slice()) {
            let (key, value) = item?;
            let generation = record_generation(timeline, &key)?;
            if generation > token {
                continue;
            }
            let record = decode_record(&value)?;
            let newer = match latest.get(&record.key) {
                Some((seen_gen, seen)) => {
                    (record.timestamp, generation) > (seen.timestamp, *seen_gen)
                }
                None => true,
            };
            if newer {
                latest.insert(record.key.clone(), (generation, record));
            }
        }

        let mut records: Vec<RawRecord> = latest.into_iter().map(|(_, (_, r))| r).collect();
        records.sort_by(RawRecord::digest_order);

        debug!(timeline, token, records = records.len(), "digest snapshot taken");
        Ok(DigestSnapshot { token, records })
    }

    fn commit_digest(
        &self,
        timeline: &str,
        token: u64,
        policy: &SchedulePolicy,
    ) -> Result<DigestOutcome> {
        let frozen = self.frozen_keys(timeline, Some(token))?;

        let outcome = (&self.meta, &self.records, &self.waiting, &self.ready).transaction(
            |(meta, records, waiting, ready)| -> TxResult<DigestOutcome> {
                let Some(mut m) = read_meta(meta, timeline)? else {
                    // Deleted while the digest was in flight
                    for key in &frozen {
                        records.remove(key.clone())?;
                    }
                    return Ok(DigestOutcome::Deleted);
                };
                if m.digest_gen != Some(token) {
                    return abort(StoreError::invalid_state(
                        timeline,
                        "digest was superseded by a newer attempt",
                    ));
                }

                for key in &frozen {
                    records.remove(key.clone())?;
                }
                unfile(waiting, ready, timeline, &m.state)?;

                if m.live_count > 0 {
                    let due = policy.timestamp + policy.backoff.delay(&policy.delays, m.live_count);
                    m.state = TimelineState::Waiting { due };
                    m.digest_gen = None;
                    m.last_processed = Some(policy.timestamp);
                    file(waiting, ready, timeline, &m.state)?;
                    write_meta(meta, timeline, &m)?;
                    Ok(DigestOutcome::Rescheduled { due })
                } else {
                    meta.remove(timeline.as_bytes())?;
                    Ok(DigestOutcome::Deleted)
                }
            },
        )?;

        debug!(timeline, token, ?outcome, removed = frozen.len(), "digest committed");
        Ok(outcome)
    }

    fn delete(&self, timeline: &str) -> Result<()> {
        for attempt in 1..=DELETE_ATTEMPTS {
            let before = self.load_meta(timeline)?;
            let keys = self.frozen_keys(timeline, None)?;

            let result = (&self.meta, &self.records, &self.waiting, &self.ready).transaction(
                |(meta, records, waiting, ready)| -> TxResult<()> {
                    let current = read_meta(meta, timeline)?;
                    if current != before {
                        return abort(StoreError::Contended {
                            timeline: timeline.to_string(),
                            attempts: attempt,
                        });
                    }
                    for key in &keys {
                        records.remove(key.clone())?;
                    }
                    if let Some(m) = current {
                        unfile(waiting, ready, timeline, &m.state)?;
                        meta.remove(timeline.as_bytes())?;
                    }
                    Ok(())
                },
            );

            match result.map_err(StoreError::from) {
                Ok(()) => {
                    debug!(timeline, records = keys.len(), "timeline deleted");
                    return Ok(());
                }
                Err(StoreError::Contended { .. }) => {
                    trace!(timeline, attempt, "timeline changed during delete, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Contended {
            timeline: timeline.to_string(),
            attempts: DELETE_ATTEMPTS,
        })
    }

    fn state(&self, timeline: &str) -> Result<Option<TimelineState>> {
        Ok(self.load_meta(timeline)?.map(|m| m.state))
    }

    fn live_len(&self, timeline: &str) -> Result<usize> {
        Ok(self
            .load_meta(timeline)?
            .map(|m| m.live_count as usize)
            .unwrap_or(0))
    }

    fn entries(&self, index: ScheduleIndex) -> Result<Vec<ScheduleEntry>> {
        let mut entries = Vec::new();
        for item in self.index_tree(index).iter() {
            let (key, _) = item?;
            let (score, timeline) = parse_index_key(&key)?;
            entries.push(ScheduleEntry::new(timeline, score));
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
