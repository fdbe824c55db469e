//! Time source for certificate validity and cache expiry.

use time::OffsetDateTime;

/// Source of the current time.
///
/// The authority never reads the system clock directly so expiry behaviour
/// can be exercised without waiting a day.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
