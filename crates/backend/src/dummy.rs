//! A backend that never delivers anything

use crate::backend::{AddOptions, Digests};
use crate::digest::Digest;
use crate::schedule::Schedule;
use crate::Result;
use digest_core::Record;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Disabled backend: reports every project as disabled, stores nothing,
/// never schedules and digests to an empty record set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyBackend;

impl Digests for DummyBackend {
    fn enabled(&self, _project: &str) -> bool {
        false
    }

    fn add<T: Serialize>(
        &self,
        _timeline: &str,
        _record: &Record<T>,
        _options: AddOptions,
    ) -> Result<bool> {
        Ok(false)
    }

    fn schedule(&self, _deadline: f64, _timestamp: Option<f64>) -> Schedule<'_> {
        Schedule::empty()
    }

    fn maintenance(&self, _deadline: f64, _timestamp: Option<f64>) -> Result<usize> {
        Ok(0)
    }

    fn begin_digest<T: DeserializeOwned>(
        &self,
        timeline: &str,
        _minimum_delay: Option<f64>,
    ) -> Result<Digest<'_, T>> {
        Ok(Digest::empty(timeline))
    }

    fn delete(&self, _timeline: &str) -> Result<()> {
        Ok(())
    }
}
