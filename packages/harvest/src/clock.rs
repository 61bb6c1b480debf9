//! Time source abstraction.

use chrono::{DateTime, NaiveDate, Utc};

/// Source of the current time.
///
/// Cooldowns, lock staleness, status derivation and prediction validation
/// all read time through this trait.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
