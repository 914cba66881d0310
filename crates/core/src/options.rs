//! Delay, capacity and codec options for a digest backend

use crate::backoff::Backoff;
use crate::codec::Codec;
use crate::error::OptionsError;
use serde::{Deserialize, Serialize};

/// Scheduling delays, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Delays {
    /// Delay after a digest when nothing else arrived (default: 5 min)
    pub minimum_delay: f64,
    /// Upper bound on the delay after a digest (default: 30 min)
    pub maximum_delay: f64,
    /// Extra delay per record received while waiting (default: 5 min)
    pub increment_delay: f64,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            minimum_delay: 60.0 * 5.0,
            maximum_delay: 60.0 * 30.0,
            increment_delay: 60.0 * 5.0,
        }
    }
}

impl Delays {
    /// Check every delay is a finite, non-negative value and the bounds are ordered
    pub fn validate(&self) -> Result<(), OptionsError> {
        for (name, value) in [
            ("minimum_delay", self.minimum_delay),
            ("maximum_delay", self.maximum_delay),
            ("increment_delay", self.increment_delay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(OptionsError::NegativeDelay { name, value });
            }
        }

        if self.minimum_delay > self.maximum_delay {
            return Err(OptionsError::DelayOrder {
                minimum: self.minimum_delay,
                maximum: self.maximum_delay,
            });
        }

        Ok(())
    }

    /// Apply per-project or per-call overrides
    pub fn with_overrides(&self, overrides: &Overrides) -> Self {
        Self {
            minimum_delay: overrides.minimum_delay.unwrap_or(self.minimum_delay),
            maximum_delay: overrides.maximum_delay.unwrap_or(self.maximum_delay),
            increment_delay: overrides.increment_delay.unwrap_or(self.increment_delay),
        }
    }
}

/// Optional overrides, typically looked up per project
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub minimum_delay: Option<f64>,
    pub maximum_delay: Option<f64>,
    pub increment_delay: Option<f64>,
    pub capacity: Option<usize>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        *self == Overrides::default()
    }
}

/// Backend-wide options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Payload codec
    pub codec: Codec,
    /// Reschedule strategy
    pub backoff: Backoff,
    /// Default delays
    pub delays: Delays,
    /// Soft limit on records per timeline (None = unbounded)
    pub capacity: Option<usize>,
    /// Chance that an add runs truncation (default: 1 / capacity)
    pub truncation_chance: Option<f64>,
    /// Records older than this many seconds are skipped at digest time.
    /// None keeps records until delivered.
    pub ttl: Option<f64>,
    /// Timelines moved per schedule/maintenance batch (default: 1000)
    pub batch_size: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            backoff: Backoff::default(),
            delays: Delays::default(),
            capacity: None,
            truncation_chance: None,
            ttl: None,
            batch_size: 1000,
        }
    }
}

impl BackendOptions {
    /// Validate options and fill in derived defaults
    pub fn validated(mut self) -> Result<Self, OptionsError> {
        self.delays.validate()?;

        if let Some(capacity) = self.capacity {
            if capacity < 1 {
                return Err(OptionsError::Capacity);
            }
            if self.truncation_chance.is_none() {
                self.truncation_chance = Some(1.0 / capacity as f64);
            }
        }

        if let Some(chance) = self.truncation_chance {
            if !(chance > 0.0 && chance <= 1.0) {
                return Err(OptionsError::TruncationChance(chance));
            }
        }

        self.validate_ttl(0.0)?;

        if self.batch_size == 0 {
            self.batch_size = 1;
        }

        Ok(self)
    }

    /// Check the ttl outlives a timeline's worst-case wait.
    ///
    /// A record can wait `maximum_delay` before its timeline is due, then
    /// `ready_timeout` more if a delivery fails and maintenance has to
    /// requeue it. A ttl inside that window would expire records that are
    /// still owed a retry.
    pub fn validate_ttl(&self, ready_timeout: f64) -> Result<(), OptionsError> {
        let Some(ttl) = self.ttl else {
            return Ok(());
        };
        if !(ttl.is_finite() && ttl > 0.0) {
            return Err(OptionsError::Ttl(ttl));
        }
        let window = ready_timeout + self.delays.maximum_delay;
        if ttl <= window {
            return Err(OptionsError::TtlWithinRetryWindow { ttl, window });
        }
        Ok(())
    }

    /// Truncation chance for a capacity, falling back to `1 / capacity`
    pub fn truncation_chance_for(&self, capacity: usize) -> f64 {
        match (self.capacity, self.truncation_chance) {
            (Some(configured), Some(chance)) if configured == capacity => chance,
            _ => 1.0 / capacity.max(1) as f64,
        }
    }
}
