//! Reconnect scheduling.
//!
//! A [`RetrySchedule`] is an immutable, ordered list of delays. Every connection
//! lifecycle consumes a fresh [`RetryCursor`] cloned from it: each failed attempt pops
//! the next delay, a successful connection resets the cursor. What happens once the
//! cursor runs dry is decided by the [`ExhaustionPolicy`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;

use crate::Result;
use crate::error::Error;

/// Delays (in seconds) used when no schedule is configured.
const DEFAULT_SCHEDULE_SECS: [u64; 30] = [
    1, 1, 1, 1, 1, 5, 5, 5, 5, 5, 10, 10, 10, 10, 10, 30, 30, 30, 30, 30, 60, 60, 60, 60, 60, 300,
    300, 300, 300, 300,
];

/// Ordered, finite sequence of reconnect delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Arc<[Duration]>,
}

impl RetrySchedule {
    /// Build a schedule from explicit delays. The schedule must not be empty.
    pub fn new<I: IntoIterator<Item = Duration>>(delays: I) -> Result<Self> {
        let delays: Arc<[Duration]> = delays.into_iter().collect();
        if delays.is_empty() {
            return Err(Error::configuration(
                "retry schedule must contain at least one delay",
            ));
        }

        Ok(Self { delays })
    }

    /// Build a schedule from whole seconds.
    pub fn from_secs(secs: &[u64]) -> Result<Self> {
        Self::new(secs.iter().copied().map(Duration::from_secs))
    }

    /// Build a schedule from fractional seconds; values below one are sub-second delays.
    pub fn from_secs_f64(secs: &[f64]) -> Result<Self> {
        let delays = secs
            .iter()
            .map(|s| {
                Duration::try_from_secs_f64(*s).map_err(|e| {
                    Error::configuration(format!("invalid retry delay {s}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(delays)
    }

    #[must_use]
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// The final entry, repeated forever under [`ExhaustionPolicy::RepeatLast`].
    #[must_use]
    pub fn last(&self) -> Option<Duration> {
        self.delays.last().copied()
    }

    /// A fresh cursor positioned at the first delay.
    #[must_use]
    pub fn cursor(&self, policy: ExhaustionPolicy) -> RetryCursor {
        RetryCursor {
            schedule: self.clone(),
            remaining: self.delays.iter().copied().collect(),
            policy,
            attempts: 0,
        }
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: DEFAULT_SCHEDULE_SECS
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

/// What a [`RetryCursor`] does once every scheduled delay has been used.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Keep retrying with the last delay of the schedule
    #[default]
    RepeatLast,
    /// Stop reconnecting and surface [`crate::error::RetriesExhausted`]
    Fail,
}

impl ExhaustionPolicy {
    #[must_use]
    pub const fn from_retry_indefinitely(retry_indefinitely: bool) -> Self {
        if retry_indefinitely {
            Self::RepeatLast
        } else {
            Self::Fail
        }
    }
}

/// The consumable, per-lifecycle copy of a [`RetrySchedule`].
#[derive(Debug, Clone)]
pub struct RetryCursor {
    schedule: RetrySchedule,
    remaining: VecDeque<Duration>,
    policy: ExhaustionPolicy,
    attempts: u32,
}

impl RetryCursor {
    /// Failed attempts recorded since the cursor was last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Scheduled delays left before the exhaustion policy applies.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    #[must_use]
    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    #[must_use]
    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }
}

impl Backoff for RetryCursor {
    fn reset(&mut self) {
        self.remaining = self.schedule.delays.iter().copied().collect();
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        match self.remaining.pop_front() {
            Some(delay) => Some(delay),
            None => match self.policy {
                ExhaustionPolicy::RepeatLast => self.schedule.last(),
                ExhaustionPolicy::Fail => None,
            },
        }
    }
}

/// Human readable rendering of a reconnect delay: `500 millis`, `1 second`, `5 seconds`.
pub(crate) struct DelayDisplay(pub Duration);

impl fmt::Display for DelayDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delay = self.0;
        if delay < Duration::from_secs(1) {
            write!(f, "{} millis", delay.as_millis())
        } else if delay.subsec_nanos() == 0 {
            let secs = delay.as_secs();
            write!(f, "{secs} second{}", if secs == 1 { "" } else { "s" })
        } else {
            write!(f, "{:.3} seconds", delay.as_secs_f64())
        }
    }
}
