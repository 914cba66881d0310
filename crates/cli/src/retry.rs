//! Exponential retry policy for transient backend failures

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Total attempts, including the first
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let bounded = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `retriable` decides which errors are worth another attempt.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        retriable: impl Fn(&E) -> bool,
        mut on_retry: impl FnMut(u32, &E, Duration),
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.attempts && retriable(&e) => {
                    let delay = self.delay_for_attempt(attempt);
                    on_retry(attempt + 1, &e, delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 250, 5_000)
    }
}
