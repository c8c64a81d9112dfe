//! Clock and calendar helpers mapping UTC instants into market-local time.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;

/// Source of the current instant. Injected so scheduling decisions are testable.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convert a UTC instant into the given zone.
pub fn to_market_local(instant: DateTime<Utc>, zone: Tz) -> DateTime<Tz> {
    instant.with_timezone(&zone)
}

/// Minutes since local midnight, truncating seconds.
pub fn minute_of_day<T: Timelike>(local: &T) -> u32 {
    local.hour() * 60 + local.minute()
}

pub fn is_weekend<T: Datelike>(local: &T) -> bool {
    matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
}
