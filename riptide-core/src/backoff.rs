//! Reconnection backoff.
//!
//! Tracks dial attempts for the client and computes the exponential delay
//! before the next one. The interval doubles per attempt up to a cap, and
//! the whole policy is bounded by a maximum number of tries; once exhausted
//! the client transitions to closed.

use std::time::Duration;

/// Backoff state for one connection lifecycle.
///
/// # Example
///
/// ```
/// use riptide_core::backoff::BackoffState;
/// use std::time::Duration;
///
/// let mut backoff = BackoffState::new(Duration::from_secs(2), Duration::from_secs(60), 10);
///
/// assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
///
/// // Reset after a successful dial
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffState {
    base_interval: Duration,
    max_interval: Duration,
    max_tries: u32,
    attempt: u32,
    current_interval: Duration,
}

impl BackoffState {
    pub const fn new(base_interval: Duration, max_interval: Duration, max_tries: u32) -> Self {
        Self {
            base_interval,
            max_interval,
            max_tries,
            attempt: 0,
            current_interval: base_interval,
        }
    }

    /// Delay before the next attempt, or `None` once `max_tries` attempts
    /// have been handed out since the last reset.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_tries {
            return None;
        }
        let delay = self.current_interval;

        self.attempt += 1;
        self.current_interval = self
            .base_interval
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max_interval);

        Some(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    /// Attempts handed out since the last reset.
    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.attempt >= self.max_tries
    }
}
