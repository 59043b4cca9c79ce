//! Reconnect delay bookkeeping

use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_FLOOR: Duration = Duration::from_secs(1);
/// Default upper bound on the retry delay
pub const DEFAULT_CEILING: Duration = Duration::from_secs(30);

/// Exponential reconnect backoff.
///
/// The delay handed out for the retry that follows `n` earlier consecutive
/// failures is `min(floor * 2^n, ceiling)`. A successful open calls
/// [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
            consecutive_failures: 0,
        }
    }

    /// Delay for the next scheduled retry; doubles the stored delay afterwards
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
        self.consecutive_failures = 0;
    }

    /// Delay the next retry would wait, without consuming it
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Closed form of the delay after `failures` earlier consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.floor.saturating_mul(factor).min(self.ceiling)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CEILING)
    }
}
