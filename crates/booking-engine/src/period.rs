//! Time periods in a named time zone, and how wall-clock times resolve to UTC.
//!
//! A [`TimePeriod`] keeps its start/end as local date and time parts plus an
//! IANA zone. Comparisons between periods go through UTC so that periods in
//! different zones order correctly.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Policy for wall-clock times that fall into a DST transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DstPolicy {
    /// Times inside a spring-forward gap do not exist and resolve to nothing.
    Skip,
    /// Times inside a gap move to the first valid instant after it; ambiguous
    /// times take the later offset.
    ShiftForward,
    /// Keep the wall-clock reading: gaps shift forward, ambiguous times take
    /// the earlier (pre-transition) offset.
    #[default]
    WallClock,
}

impl DstPolicy {
    /// Resolve a local datetime in `tz` to UTC under this policy.
    pub fn resolve(self, tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(early, late) => match self {
                DstPolicy::ShiftForward => Some(late.with_timezone(&Utc)),
                DstPolicy::Skip | DstPolicy::WallClock => Some(early.with_timezone(&Utc)),
            },
            LocalResult::None => match self {
                DstPolicy::Skip => None,
                DstPolicy::ShiftForward | DstPolicy::WallClock => shift_out_of_gap(tz, local),
            },
        }
    }
}

// Gaps are at most a couple of hours in practice; probe in 15 minute steps.
fn shift_out_of_gap(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    (1..=12).find_map(|step| {
        tz.from_local_datetime(&(local + Duration::minutes(15 * step)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn resolve_or_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    DstPolicy::WallClock
        .resolve(tz, local)
        .unwrap_or_else(|| local.and_utc())
}

/// Parse an IANA zone name.
pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.parse()
        .map_err(|_| EngineError::InvalidTimezone(name.to_string()))
}

/// A start/end pair in local time with its time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub time_zone: Tz,
}

impl TimePeriod {
    /// Build a period from local start/end datetimes.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidPeriod` when `end` is before `start`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime, time_zone: Tz) -> Result<Self> {
        if end < start {
            return Err(EngineError::InvalidPeriod(format!(
                "end {end} is before start {start}"
            )));
        }
        Ok(Self {
            start_date: start.date(),
            end_date: end.date(),
            start_time: start.time(),
            end_time: end.time(),
            time_zone,
        })
    }

    /// Same-day period from a date and two times.
    pub fn on_day(date: NaiveDate, start: NaiveTime, end: NaiveTime, time_zone: Tz) -> Result<Self> {
        Self::new(date.and_time(start), date.and_time(end), time_zone)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start_date.and_time(self.start_time)
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end_date.and_time(self.end_time)
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        resolve_or_utc(self.time_zone, self.start())
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        resolve_or_utc(self.time_zone, self.end())
    }

    /// Elapsed time between start and end (absolute, across DST changes).
    pub fn duration(&self) -> Duration {
        self.end_utc() - self.start_utc()
    }

    /// Number of calendar days the period spans beyond its start date.
    pub fn day_span(&self) -> i64 {
        (self.end_date - self.start_date).num_days()
    }

    /// True when `other` lies entirely within this period.
    pub fn contains(&self, other: &TimePeriod) -> bool {
        self.start_utc() <= other.start_utc() && other.end_utc() <= self.end_utc()
    }

    /// Two periods overlap when `a.start < b.end && b.start < a.end`.
    /// Adjacent periods do not overlap.
    pub fn overlaps(&self, other: &TimePeriod) -> bool {
        self.start_utc() < other.end_utc() && other.start_utc() < self.end_utc()
    }

    /// Move the period onto `date`, keeping its times of day and day span.
    pub fn on_date(&self, date: NaiveDate) -> TimePeriod {
        TimePeriod {
            start_date: date,
            end_date: date + Duration::days(self.day_span()),
            ..*self
        }
    }

    /// Shift both ends by `delta` of local time.
    pub fn shifted(&self, delta: Duration) -> TimePeriod {
        let start = self.start() + delta;
        let end = self.end() + delta;
        TimePeriod {
            start_date: start.date(),
            end_date: end.date(),
            start_time: start.time(),
            end_time: end.time(),
            time_zone: self.time_zone,
        }
    }

    /// Extend the period outward: `before` earlier start, `after` later end.
    pub fn padded(&self, before: Duration, after: Duration) -> TimePeriod {
        let start = self.start() - before;
        let end = self.end() + after;
        TimePeriod {
            start_date: start.date(),
            end_date: end.date(),
            start_time: start.time(),
            end_time: end.time(),
            time_zone: self.time_zone,
        }
    }

    /// Drop the time parts (both times become midnight).
    pub fn clear_time(&self) -> TimePeriod {
        TimePeriod {
            start_time: NaiveTime::MIN,
            end_time: NaiveTime::MIN,
            ..*self
        }
    }

    /// Drop the date parts, keeping times of day and the day span relative to
    /// the Unix epoch date.
    pub fn clear_date(&self) -> TimePeriod {
        self.on_date(NaiveDate::default())
    }

    /// Same instant range in another zone.
    pub fn in_time_zone(&self, tz: Tz) -> TimePeriod {
        let start = self.start_utc().with_timezone(&tz).naive_local();
        let end = self.end_utc().with_timezone(&tz).naive_local();
        TimePeriod {
            start_date: start.date(),
            end_date: end.date(),
            start_time: start.time(),
            end_time: end.time(),
            time_zone: tz,
        }
    }
}
