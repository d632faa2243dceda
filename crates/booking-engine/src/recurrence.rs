//! Recurrence patterns and their iteration.
//!
//! A pattern is turned into an RFC 5545 rule and expanded with the `rrule`
//! crate. Dates come out strictly increasing; each one is offered to an
//! [`OccurrenceHandler`] until the handler says stop or the end condition is
//! reached.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Weekday};
use rrule::RRuleSet;
use serde::{Deserialize, Serialize};

use crate::actions::OccurrenceHandler;
use crate::error::{EngineError, Result};
use crate::period::TimePeriod;

/// Cap used for end-date patterns when no other limit is configured.
pub const DEFAULT_MAX_OCCURRENCES: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn as_rrule(self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekOfMonth {
    First,
    Second,
    Third,
    Fourth,
    Last,
}

impl WeekOfMonth {
    fn ordinal(self) -> i8 {
        match self {
            WeekOfMonth::First => 1,
            WeekOfMonth::Second => 2,
            WeekOfMonth::Third => 3,
            WeekOfMonth::Fourth => 4,
            WeekOfMonth::Last => -1,
        }
    }
}

/// Which day of the month a monthly pattern lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthlyRule {
    DayOfMonth(u32),
    NthWeekday { week: WeekOfMonth, weekday: Weekday },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCondition {
    /// Total occurrences, cancelled ones included.
    Count(u32),
    /// Last date that may carry an occurrence (inclusive).
    Until(NaiveDate),
}

/// A per-date deviation from the pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exception {
    Cancelled,
    /// The occurrence happens at a different time.
    Modified(TimePeriod),
}

/// Abstract description of how a booking repeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub frequency: Frequency,
    pub interval: u32,
    /// Weekly only; empty means the start date's weekday.
    pub weekdays: Vec<Weekday>,
    /// Monthly only; `None` means the start date's day of month.
    pub monthly: Option<MonthlyRule>,
    pub end: EndCondition,
    /// Keyed by the date the pattern itself produces.
    pub exceptions: BTreeMap<NaiveDate, Exception>,
    pub max_occurrences: u16,
}

/// One date produced by a pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occurrence {
    /// 1-based position in the pattern, counting cancelled dates.
    pub index: u32,
    pub date: NaiveDate,
    pub exception: Option<Exception>,
}

impl Occurrence {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.exception, Some(Exception::Cancelled))
    }

    pub fn overridden_period(&self) -> Option<&TimePeriod> {
        match &self.exception {
            Some(Exception::Modified(period)) => Some(period),
            _ => None,
        }
    }

    /// The period this occurrence takes, given the series' template period.
    pub fn period(&self, template: &TimePeriod) -> TimePeriod {
        match self.overridden_period() {
            Some(period) => *period,
            None => template.on_date(self.date),
        }
    }
}

/// What happened during one [`RecurrencePattern::iterate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationSummary {
    /// Dates offered to the handler, cancelled ones included.
    pub visited: u32,
    /// Normal occurrence callbacks.
    pub normal: u32,
    /// Cancelled dates seen (the skip counter).
    pub cancelled: u32,
    pub stopped_early: bool,
    /// Index of the last date visited; 0 when nothing was visited.
    pub last_index: u32,
}

impl RecurrencePattern {
    fn with_frequency(frequency: Frequency, interval: u32) -> Self {
        Self {
            frequency,
            interval,
            weekdays: Vec::new(),
            monthly: None,
            end: EndCondition::Count(1),
            exceptions: BTreeMap::new(),
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
        }
    }

    pub fn daily(interval: u32) -> Self {
        Self::with_frequency(Frequency::Daily, interval)
    }

    pub fn weekly(interval: u32, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            weekdays: weekdays.into_iter().collect(),
            ..Self::with_frequency(Frequency::Weekly, interval)
        }
    }

    pub fn monthly(interval: u32, rule: MonthlyRule) -> Self {
        Self {
            monthly: Some(rule),
            ..Self::with_frequency(Frequency::Monthly, interval)
        }
    }

    pub fn yearly(interval: u32) -> Self {
        Self::with_frequency(Frequency::Yearly, interval)
    }

    pub fn count(mut self, count: u32) -> Self {
        self.end = EndCondition::Count(count);
        self
    }

    pub fn until(mut self, last: NaiveDate) -> Self {
        self.end = EndCondition::Until(last);
        self
    }

    pub fn cancel(mut self, date: NaiveDate) -> Self {
        self.exceptions.insert(date, Exception::Cancelled);
        self
    }

    pub fn modify(mut self, date: NaiveDate, period: TimePeriod) -> Self {
        self.exceptions.insert(date, Exception::Modified(period));
        self
    }

    pub fn with_max_occurrences(mut self, max: u16) -> Self {
        self.max_occurrences = max;
        self
    }

    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }

    /// True when both patterns produce the same dates, ignoring exceptions.
    pub fn same_rule(&self, other: &RecurrencePattern) -> bool {
        self.frequency == other.frequency
            && self.interval == other.interval
            && self.weekdays == other.weekdays
            && self.monthly == other.monthly
            && self.end == other.end
    }

    fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(EngineError::InvalidPattern(
                "interval must be at least 1".to_string(),
            ));
        }
        if let EndCondition::Count(count) = self.end {
            count_limit(count)?;
        }
        if let Some(MonthlyRule::DayOfMonth(day)) = self.monthly {
            if !(1..=31).contains(&day) {
                return Err(EngineError::InvalidPattern(format!(
                    "day of month {day} out of range"
                )));
            }
        }
        if self.monthly.is_some() && self.frequency != Frequency::Monthly {
            return Err(EngineError::InvalidPattern(
                "monthly rule on a non-monthly pattern".to_string(),
            ));
        }
        if !self.weekdays.is_empty() && self.frequency != Frequency::Weekly {
            return Err(EngineError::InvalidPattern(
                "weekday set on a non-weekly pattern".to_string(),
            ));
        }
        Ok(())
    }

    /// RFC 5545 text for this pattern anchored at `start`.
    ///
    /// Dates are expanded at midnight UTC: only the calendar date matters here,
    /// the time of day comes from the booking.
    fn rrule_text(&self, start: NaiveDate) -> String {
        let mut rule = format!(
            "FREQ={};INTERVAL={}",
            self.frequency.as_rrule(),
            self.interval
        );

        if self.frequency == Frequency::Weekly && !self.weekdays.is_empty() {
            let days: Vec<&str> = self.weekdays.iter().map(|d| weekday_code(*d)).collect();
            rule.push_str(&format!(";BYDAY={}", days.join(",")));
        }

        match self.monthly {
            Some(MonthlyRule::DayOfMonth(day)) => rule.push_str(&format!(";BYMONTHDAY={day}")),
            Some(MonthlyRule::NthWeekday { week, weekday }) => rule.push_str(&format!(
                ";BYDAY={}{}",
                week.ordinal(),
                weekday_code(weekday)
            )),
            None => {}
        }

        match self.end {
            EndCondition::Count(count) => rule.push_str(&format!(";COUNT={count}")),
            // The rrule crate requires UNTIL in the same zone as DTSTART (UTC).
            EndCondition::Until(last) => {
                rule.push_str(&format!(";UNTIL={}T235959Z", last.format("%Y%m%d")))
            }
        }

        format!("DTSTART:{}T000000Z\nRRULE:{}", start.format("%Y%m%d"), rule)
    }

    /// All occurrence dates from `start`, cancelled ones included.
    ///
    /// Dates are strictly increasing and never before `start`. Indices are
    /// 1-based and count cancelled dates. End-date patterns stop after
    /// `max_occurrences` dates.
    ///
    /// # Arguments
    /// - `start` -- first date of the series (the anchor of the rule)
    ///
    /// # Errors
    /// Returns `EngineError::InvalidPattern` when the pattern is malformed
    /// (zero interval, a count above 65535, a rule on the wrong frequency) or
    /// the rule cannot be parsed.
    pub fn expand(&self, start: NaiveDate) -> Result<Vec<Occurrence>> {
        self.validate()?;

        let limit: u16 = match self.end {
            EndCondition::Count(0) => return Ok(Vec::new()),
            EndCondition::Count(count) => count_limit(count)?,
            EndCondition::Until(last) if last < start => return Ok(Vec::new()),
            EndCondition::Until(_) => self.max_occurrences,
        };

        let text = self.rrule_text(start);
        let rrule_set: RRuleSet = text
            .parse()
            .map_err(|e| EngineError::InvalidPattern(format!("{e}")))?;

        let result = rrule_set.all(limit);
        if result.limited && matches!(self.end, EndCondition::Until(_)) {
            tracing::warn!(
                limit,
                start = %start,
                "recurrence expansion capped before reaching its end date"
            );
        }

        let mut occurrences = Vec::with_capacity(result.dates.len());
        let mut previous: Option<NaiveDate> = None;
        for dt in result.dates {
            let date = dt.date_naive();
            if previous.is_some_and(|p| date <= p) || date < start {
                continue;
            }
            previous = Some(date);
            occurrences.push(Occurrence {
                index: occurrences.len() as u32 + 1,
                date,
                exception: self.exceptions.get(&date).copied(),
            });
        }

        Ok(occurrences)
    }

    /// Offer each occurrence from `start` to `handler`.
    ///
    /// Cancelled dates go to `handle_cancelled_occurrence`, every other date to
    /// `handle_occurrence`. Iteration ends when a handler call returns
    /// `Ok(false)` or the end condition is reached; handler errors abort it.
    ///
    /// # Arguments
    /// - `start` -- first date of the series
    /// - `handler` -- action invoked once per visited date
    ///
    /// # Errors
    /// Returns the errors of [`RecurrencePattern::expand`], and the first error
    /// a handler call returns.
    pub fn iterate<H>(&self, start: NaiveDate, handler: &mut H) -> Result<IterationSummary>
    where
        H: OccurrenceHandler + ?Sized,
    {
        let mut summary = IterationSummary::default();

        for occurrence in self.expand(start)? {
            summary.visited += 1;
            summary.last_index = occurrence.index;

            let keep_going = if occurrence.is_cancelled() {
                summary.cancelled += 1;
                handler.handle_cancelled_occurrence(&occurrence)?
            } else {
                summary.normal += 1;
                handler.handle_occurrence(&occurrence)?
            };

            if !keep_going {
                tracing::debug!(
                    index = occurrence.index,
                    date = %occurrence.date,
                    "occurrence handler stopped iteration"
                );
                summary.stopped_early = true;
                break;
            }
        }

        Ok(summary)
    }

    /// Last date the pattern produces from `start`, if any.
    pub fn last_date(&self, start: NaiveDate) -> Result<Option<NaiveDate>> {
        Ok(self.expand(start)?.last().map(|o| o.date))
    }
}

fn count_limit(count: u32) -> Result<u16> {
    u16::try_from(count).map_err(|_| {
        EngineError::InvalidPattern(format!(
            "occurrence count {count} exceeds {}",
            u16::MAX
        ))
    })
}

fn weekday_code(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MO",
        Weekday::Tue => "TU",
        Weekday::Wed => "WE",
        Weekday::Thu => "TH",
        Weekday::Fri => "FR",
        Weekday::Sat => "SA",
        Weekday::Sun => "SU",
    }
}
