//! The digest backend: producers add records, schedulers digest timelines
//!
//! `Backend` composes a `TimelineStore` with the configured codec, backoff
//! strategy and per-project overrides. All state lives in the store; the
//! backend itself is cheap to clone and share across threads.

use crate::digest::{Digest, Pending};
use crate::error::BackendError;
use crate::project::{AllProjects, ProjectConfig};
use crate::schedule::Schedule;
use crate::Result;
use digest_core::{
    now_secs, project_of, BackendOptions, Delays, RawRecord, Record, ScheduleIndex,
    TimelineState,
};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use timeline::{MemoryStore, SchedulePolicy, SledStore, TimelineStore};
use tracing::{debug, info, warn};

/// Source of "now" in unix seconds
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Per-call scheduling overrides for `add`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AddOptions {
    /// Overrides the project/backend increment delay
    pub increment_delay: Option<f64>,
    /// Overrides the project/backend maximum delay
    pub maximum_delay: Option<f64>,
    /// Reference time for scheduling; defaults to the record's timestamp
    pub timestamp: Option<f64>,
}

/// Operations every digest backend offers
pub trait Digests {
    /// Whether digests are delivered for `project`
    fn enabled(&self, project: &str) -> bool;

    /// Queue a record on a timeline.
    ///
    /// Returns true when the timeline did not exist and is now waiting,
    /// due at the add's timestamp.
    fn add<T: Serialize>(
        &self,
        timeline: &str,
        record: &Record<T>,
        options: AddOptions,
    ) -> Result<bool>;

    /// Move every waiting timeline due by `deadline` to ready, lazily in batches
    fn schedule(&self, deadline: f64, timestamp: Option<f64>) -> Schedule<'_>;

    /// Return timelines ready since before `deadline` to waiting.
    /// Returns how many were moved.
    fn maintenance(&self, deadline: f64, timestamp: Option<f64>) -> Result<usize>;

    /// Snapshot a ready timeline for delivery
    fn begin_digest<T: DeserializeOwned>(
        &self,
        timeline: &str,
        minimum_delay: Option<f64>,
    ) -> Result<Digest<'_, T>>;

    /// Run `deliver` over a ready timeline's records, committing only if it
    /// returns `Ok`. An error leaves every record queued for the next attempt.
    fn digest<T, R, E, F>(
        &self,
        timeline: &str,
        minimum_delay: Option<f64>,
        deliver: F,
    ) -> std::result::Result<R, E>
    where
        T: DeserializeOwned,
        F: FnOnce(&[Record<T>]) -> std::result::Result<R, E>,
        E: From<BackendError>,
    {
        let digest = self.begin_digest::<T>(timeline, minimum_delay)?;
        match deliver(digest.records()) {
            Ok(value) => {
                digest.commit()?;
                Ok(value)
            }
            Err(e) => {
                digest.abort();
                Err(e)
            }
        }
    }

    /// Remove a timeline and all of its records
    fn delete(&self, timeline: &str) -> Result<()>;
}

/// Digest backend over a timeline store
#[derive(Clone)]
pub struct Backend {
    store: Arc<dyn TimelineStore>,
    options: BackendOptions,
    projects: Arc<dyn ProjectConfig>,
    clock: Clock,
}

impl Backend {
    /// Create a backend, validating its options
    pub fn new(store: Arc<dyn TimelineStore>, options: BackendOptions) -> Result<Self> {
        Ok(Self {
            store,
            options: options.validated()?,
            projects: Arc::new(AllProjects),
            clock: Arc::new(now_secs),
        })
    }

    /// Backend over a sled store in `dir`
    pub fn open(dir: &Path, options: BackendOptions) -> Result<Self> {
        let store = SledStore::open(dir)?;
        Self::new(Arc::new(store), options)
    }

    /// Backend over a fresh in-memory store
    pub fn in_memory(options: BackendOptions) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), options)
    }

    pub fn with_projects(mut self, projects: Arc<dyn ProjectConfig>) -> Self {
        self.projects = projects;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    pub fn store(&self) -> &dyn TimelineStore {
        self.store.as_ref()
    }

    pub fn now(&self) -> f64 {
        (self.clock)()
    }

    /// Schedule state of a timeline, if it exists
    pub fn state(&self, timeline: &str) -> Result<Option<TimelineState>> {
        Ok(self.store.state(timeline)?)
    }

    /// Delays and capacity for a timeline after project overrides
    fn resolve(&self, timeline: &str) -> Result<(Delays, Option<usize>)> {
        let Some(project) = project_of(timeline) else {
            return Ok((self.options.delays, self.options.capacity));
        };

        let overrides = self.projects.overrides(project);
        if overrides.is_empty() {
            return Ok((self.options.delays, self.options.capacity));
        }

        let delays = self.options.delays.with_overrides(&overrides);
        delays.validate()?;
        let capacity = overrides.capacity.or(self.options.capacity);
        if capacity == Some(0) {
            return Err(digest_core::OptionsError::Capacity.into());
        }
        Ok((delays, capacity))
    }

    fn maybe_truncate(&self, timeline: &str, capacity: usize) -> Result<()> {
        let chance = self.options.truncation_chance_for(capacity);
        if rand::thread_rng().gen::<f64>() >= chance {
            return Ok(());
        }

        let removed = self.store.truncate(timeline, capacity)?;
        if removed > 0 {
            debug!(timeline, removed, capacity, "dropped oldest records over capacity");
        }
        Ok(())
    }
}

impl Digests for Backend {
    fn enabled(&self, project: &str) -> bool {
        self.projects.enabled(project)
    }

    fn add<T: Serialize>(
        &self,
        timeline: &str,
        record: &Record<T>,
        options: AddOptions,
    ) -> Result<bool> {
        let (mut delays, capacity) = self.resolve(timeline)?;
        if let Some(increment) = options.increment_delay {
            delays.increment_delay = increment;
        }
        if let Some(maximum) = options.maximum_delay {
            delays.maximum_delay = maximum;
        }
        delays.validate()?;

        let raw = RawRecord::new(
            record.key.clone(),
            self.options.codec.encode(&record.value)?,
            record.timestamp,
        );
        let policy = SchedulePolicy {
            timestamp: options.timestamp.unwrap_or(record.timestamp),
            delays,
            backoff: self.options.backoff,
        };

        let created = self.store.add(timeline, &raw, &policy)?;
        if let Some(capacity) = capacity {
            self.maybe_truncate(timeline, capacity)?;
        }
        Ok(created)
    }

    fn schedule(&self, deadline: f64, timestamp: Option<f64>) -> Schedule<'_> {
        let timestamp = timestamp.unwrap_or_else(|| self.now());
        Schedule::new(
            self.store.as_ref(),
            deadline,
            timestamp,
            self.options.batch_size,
        )
    }

    fn maintenance(&self, deadline: f64, timestamp: Option<f64>) -> Result<usize> {
        let timestamp = timestamp.unwrap_or_else(|| self.now());
        let limit = self.options.batch_size;

        let mut moved = 0;
        loop {
            let batch = self.store.maintenance_batch(deadline, timestamp, limit)?;
            for entry in &batch.entries {
                warn!(timeline = %entry.timeline, "timeline stuck in ready, returned to waiting");
            }
            moved += batch.entries.len();
            if batch.is_exhausted(limit) {
                break;
            }
        }

        if moved > 0 {
            info!(moved, deadline, "maintenance recovered timelines");
        }
        Ok(moved)
    }

    fn begin_digest<T: DeserializeOwned>(
        &self,
        timeline: &str,
        minimum_delay: Option<f64>,
    ) -> Result<Digest<'_, T>> {
        let (mut delays, _) = self.resolve(timeline)?;
        if let Some(minimum) = minimum_delay {
            delays.minimum_delay = minimum;
        }

        let snapshot = self.store.begin_digest(timeline)?;
        let expired_before = match self.options.ttl {
            Some(ttl) => self.now() - ttl,
            None => f64::NEG_INFINITY,
        };

        let mut records = Vec::with_capacity(snapshot.records.len());
        let mut skipped = 0;
        for raw in snapshot.records {
            if raw.timestamp < expired_before {
                skipped += 1;
                warn!(timeline, key = %raw.key, timestamp = raw.timestamp, "skipping expired record");
                continue;
            }
            match self.options.codec.decode::<T>(&raw.value) {
                Ok(value) => records.push(Record::new(raw.key, value, raw.timestamp)),
                Err(e) => {
                    skipped += 1;
                    warn!(timeline, key = %raw.key, error = %e, "skipping undecodable record");
                }
            }
        }

        debug!(timeline, records = records.len(), skipped, "digest started");
        Ok(Digest::new(
            timeline,
            records,
            skipped,
            Pending {
                store: self.store.as_ref(),
                token: snapshot.token,
                delays,
                backoff: self.options.backoff,
                clock: Arc::clone(&self.clock),
            },
        ))
    }

    fn delete(&self, timeline: &str) -> Result<()> {
        self.store.delete(timeline)?;
        debug!(timeline, "timeline deleted");
        Ok(())
    }
}

impl Backend {
    /// Entries of one schedule index, for inspection
    pub fn entries(&self, index: ScheduleIndex) -> Result<Vec<digest_core::ScheduleEntry>> {
        Ok(self.store.entries(index)?)
    }

    /// Persist buffered store writes
    pub fn flush(&self) -> Result<()> {
        Ok(self.store.flush()?)
    }
}
