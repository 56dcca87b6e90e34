// ===============================
// src/clock.rs
// ===============================
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
#[cfg(test)]
use chrono::Duration;
#[cfg(test)]
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// Terminal server time, e.g. "2025.12.04 18:11:10"; the other separators
// show up after the time has been reformatted downstream.
const LOCAL_FORMATS: [&str; 4] = [
    "%Y.%m.%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
];

/// Normalize an originating-platform timestamp to UTC. Strings without an
/// explicit offset are read as local time at `utc_offset_hours`.
pub fn parse_origin_time(raw: &str, utc_offset_hours: i32) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let offset = FixedOffset::east_opt(utc_offset_hours.checked_mul(3600)?)?;
    LOCAL_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_time_is_shifted_by_offset() {
        let utc = parse_origin_time("2025.12.04 18:11:10", 2).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2025, 12, 4, 16, 11, 10).unwrap());

        // same instant written in UTC+8
        let utc8 = parse_origin_time("2025/12/05 00:11:10", 8).unwrap();
        assert_eq!(utc8, utc);
    }

    #[test]
    fn rfc3339_keeps_its_own_offset() {
        let t = parse_origin_time("2025-12-04T16:11:10Z", 2).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2025, 12, 4, 16, 11, 10).unwrap());
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse_origin_time("yesterday-ish", 2).is_none());
        assert!(parse_origin_time("   ", 2).is_none());
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
