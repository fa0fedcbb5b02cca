use chrono::{FixedOffset, Local, NaiveDateTime, Timelike, Utc};
use std::sync::Mutex;

/// Source of "now" on the recorders' local naive clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock {
    offset: Option<FixedOffset>,
}

impl SystemClock {
    pub fn new(utc_offset_minutes: Option<i32>) -> Self {
        Self {
            offset: utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)),
        }
    }

    /// Offset used to turn CMS UTC milliseconds into local naive time.
    pub fn offset(&self) -> FixedOffset {
        self.offset.unwrap_or_else(|| *Local::now().offset())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now = Utc::now().with_timezone(&self.offset()).naive_local();
        // second precision everywhere
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// Settable clock for tests.
#[cfg(test)]
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_truncates_to_seconds() {
        let clock = SystemClock::new(Some(180));
        assert_eq!(clock.now().nanosecond(), 0);
        assert_eq!(clock.offset().local_minus_utc(), 180 * 60);
    }

    #[test]
    fn fixed_clock_can_move() {
        let t0 = chrono::NaiveDate::from_ymd_opt(2025, 10, 15)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let clock = FixedClock::new(t0);
        assert_eq!(clock.now(), t0);
        clock.set(t0 + chrono::Duration::minutes(5));
        assert_eq!(clock.now(), t0 + chrono::Duration::minutes(5));
    }
}
