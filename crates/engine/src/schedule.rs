//! Weekly watering window: a time span on selected days of the week.
//!
//! A window whose end is earlier than its start runs past midnight; the part
//! after midnight belongs to the day it started on.

use time::{Duration, OffsetDateTime, Time, UtcOffset, Weekday};

use crate::capability::ScheduleProvider;
use crate::error::EngineError;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyWindow {
    /// Enabled days, Monday first.
    days: [bool; 7],
    start: Time,
    end: Time,
    /// Local offset the window is expressed in.
    offset: UtcOffset,
}

impl WeeklyWindow {
    pub fn new(days: [bool; 7], start: Time, end: Time, offset: UtcOffset) -> Result<Self, EngineError> {
        if start == end {
            return Err(EngineError::InvalidConfig {
                reason: format!("schedule window start and end are both {start}"),
            });
        }
        if !days.iter().any(|d| *d) {
            return Err(EngineError::InvalidConfig {
                reason: "schedule window has no enabled days".to_string(),
            });
        }
        Ok(Self {
            days,
            start,
            end,
            offset,
        })
    }

    /// Builds the day mask from weekday names such as `"mon"` or `"Saturday"`.
    pub fn days_from_names<S: AsRef<str>>(names: &[S]) -> Result<[bool; 7], EngineError> {
        let mut days = [false; 7];
        for name in names {
            let wd = parse_weekday(name.as_ref())?;
            days[wd.number_days_from_monday() as usize] = true;
        }
        Ok(days)
    }

    fn overnight(&self) -> bool {
        self.end < self.start
    }

    fn enabled(&self, wd: Weekday) -> bool {
        self.days[wd.number_days_from_monday() as usize]
    }
}

impl ScheduleProvider for WeeklyWindow {
    fn is_within_window(&self, now: OffsetDateTime) -> bool {
        let local = now.to_offset(self.offset);
        let t = local.time();
        let today = local.weekday();
        if !self.overnight() {
            return self.enabled(today) && t >= self.start && t < self.end;
        }
        if t >= self.start {
            self.enabled(today)
        } else if t < self.end {
            self.enabled(today.previous())
        } else {
            false
        }
    }

    fn remaining(&self, now: OffsetDateTime) -> Option<Duration> {
        if !self.is_within_window(now) {
            return Some(Duration::ZERO);
        }
        let t = secs_of_day(now.to_offset(self.offset).time());
        let end = secs_of_day(self.end);
        let left = if end > t { end - t } else { SECS_PER_DAY - t + end };
        Some(Duration::seconds(left))
    }
}

fn secs_of_day(t: Time) -> i64 {
    let (h, m, s) = t.as_hms();
    i64::from(h) * 3600 + i64::from(m) * 60 + i64::from(s)
}

/// Parses `"HH:MM"`.
pub fn parse_hhmm(s: &str) -> Result<Time, EngineError> {
    let bad = || EngineError::InvalidConfig {
        reason: format!("invalid time '{s}', expected HH:MM"),
    };
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let h: u8 = h.parse().map_err(|_| bad())?;
    let m: u8 = m.parse().map_err(|_| bad())?;
    Time::from_hms(h, m, 0).map_err(|_| bad())
}

pub fn parse_weekday(s: &str) -> Result<Weekday, EngineError> {
    let lower = s.trim().to_ascii_lowercase();
    let wd = match lower.get(..3) {
        Some("mon") => Weekday::Monday,
        Some("tue") => Weekday::Tuesday,
        Some("wed") => Weekday::Wednesday,
        Some("thu") => Weekday::Thursday,
        Some("fri") => Weekday::Friday,
        Some("sat") => Weekday::Saturday,
        Some("sun") => Weekday::Sunday,
        _ => {
            return Err(EngineError::InvalidConfig {
                reason: format!("unknown weekday '{s}'"),
            })
        }
    };
    Ok(wd)
}
