//! Backoff strategies for rescheduling timelines
//!
//! A quiet timeline flushes after `minimum_delay`; bursts of activity while a
//! timeline is waiting widen the digest window, never past `maximum_delay`
//! after the last digest.

use crate::error::OptionsError;
use crate::options::Delays;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported backoff strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Each addition adds `increment_delay`, capped at `maximum_delay`
    #[default]
    Linear,
    /// Always `minimum_delay`; additions never move a scheduled timeline
    Constant,
}

impl Backoff {
    pub fn name(&self) -> &'static str {
        match self {
            Backoff::Linear => "linear",
            Backoff::Constant => "constant",
        }
    }

    /// Delay in seconds before a timeline that received `additions` records
    /// since its last digest becomes due again.
    pub fn delay(&self, delays: &Delays, additions: u64) -> f64 {
        let floor = delays.minimum_delay.min(delays.maximum_delay);
        match self {
            Backoff::Linear => {
                let grown = delays.minimum_delay + delays.increment_delay * additions as f64;
                grown.min(delays.maximum_delay).max(floor)
            }
            Backoff::Constant => floor,
        }
    }

    /// New due time for a waiting timeline that just received a record at
    /// `timestamp`.
    ///
    /// A timeline that has never been digested is never pushed later than it
    /// already is. Otherwise the linear strategy extends the due time by one
    /// increment, bounded by `maximum_delay` past the last digest.
    pub fn extend(
        &self,
        delays: &Delays,
        due: f64,
        timestamp: f64,
        last_processed: Option<f64>,
    ) -> f64 {
        let Some(last_processed) = last_processed else {
            return due.min(timestamp);
        };

        match self {
            Backoff::Linear => {
                (due + delays.increment_delay).min(last_processed + delays.maximum_delay)
            }
            Backoff::Constant => due,
        }
    }
}

impl FromStr for Backoff {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Backoff::Linear),
            "constant" => Ok(Backoff::Constant),
            other => Err(OptionsError::Unknown {
                kind: "backoff",
                name: other.to_string(),
            }),
        }
    }
}
