//! Lazy, batched schedule iteration

use crate::Result;
use digest_core::ScheduleEntry;
use timeline::TimelineStore;
use tracing::debug;

/// Iterator over timelines moved from waiting to ready.
///
/// Each batch of up to `batch_size` timelines is moved atomically when the
/// iterator runs out of buffered entries, so memory stays bounded no matter
/// how many timelines are due. Stops after the first error.
pub struct Schedule<'a> {
    store: Option<&'a dyn TimelineStore>,
    deadline: f64,
    timestamp: f64,
    batch_size: usize,
    buffered: std::vec::IntoIter<ScheduleEntry>,
    exhausted: bool,
}

impl<'a> Schedule<'a> {
    pub(crate) fn new(
        store: &'a dyn TimelineStore,
        deadline: f64,
        timestamp: f64,
        batch_size: usize,
    ) -> Self {
        Self {
            store: Some(store),
            deadline,
            timestamp,
            batch_size: batch_size.max(1),
            buffered: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    /// A schedule that yields nothing
    pub fn empty() -> Self {
        Self {
            store: None,
            deadline: 0.0,
            timestamp: 0.0,
            batch_size: 1,
            buffered: Vec::new().into_iter(),
            exhausted: true,
        }
    }
}

impl Iterator for Schedule<'_> {
    type Item = Result<ScheduleEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.next() {
                return Some(Ok(entry));
            }
            if self.exhausted {
                return None;
            }
            let store = self.store?;

            match store.schedule_batch(self.deadline, self.timestamp, self.batch_size) {
                Ok(batch) => {
                    self.exhausted = batch.is_exhausted(self.batch_size);
                    debug!(
                        moved = batch.entries.len(),
                        scanned = batch.scanned,
                        deadline = self.deadline,
                        "schedule batch"
                    );
                    self.buffered = batch.entries.into_iter();
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}
