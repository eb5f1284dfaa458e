//! Test clock: deterministic `Clock` implementation for tests.

use chrono::{DateTime, TimeZone, Utc};
use keel_core::clock::Clock;

/// A clock that always returns a fixed point in time.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// A clock fixed at midnight UTC on the given date.
    ///
    /// # Panics
    ///
    /// Panics if the date is invalid.
    #[must_use]
    pub fn on(year: i32, month: u32, day: u32) -> Self {
        Self(
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
                .single()
                .expect("valid calendar date"),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
