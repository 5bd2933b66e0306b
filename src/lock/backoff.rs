//! Retry schedule for advisory lock acquisition.
//!
//! The shared lock on an input file is probed without blocking. When the probe
//! fails the guard sleeps and tries again, doubling the delay each time up to a
//! cap. An optional overall ceiling bounds the cumulative wait.

use std::time::Duration;

/// First sleep after a failed probe.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(300);

/// Upper bound for a single sleep.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

/// Default cumulative wait before giving up.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Cap for any single delay
    pub max_delay: Duration,

    /// Ceiling on the sum of all delays, `None` retries forever
    pub max_wait: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_wait: Some(DEFAULT_MAX_WAIT),
        }
    }
}

impl BackoffPolicy {
    /// Policy that never gives up.
    pub fn unbounded() -> Self {
        Self {
            max_wait: None,
            ..Self::default()
        }
    }

    /// Set the cumulative ceiling.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Iterator over the sleeps to perform between attempts.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max_delay: self.max_delay,
            remaining: self.max_wait,
        }
    }
}

/// Sequence of delays produced by a [`BackoffPolicy`].
///
/// Ends when the cumulative ceiling is used up; infinite otherwise.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max_delay: Duration,
    remaining: Option<Duration>,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = match self.remaining {
            Some(remaining) if remaining.is_zero() => return None,
            Some(remaining) => {
                let delay = self.next.min(remaining);
                self.remaining = Some(remaining - delay);
                delay
            }
            None => self.next,
        };
        self.next = (self.next * 2).min(self.max_delay);
        Some(delay)
    }
}
