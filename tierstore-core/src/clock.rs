//! Wall-clock source.
//!
//! Expiration, sweep cutoffs and sweep budgets all read time through a
//! [`Clock`] so tests can move time explicitly.

use chrono::Utc;

use crate::identity::Timestamp;

/// A source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}
