//! Compares a booking with the calendar's copy of its meeting and decides how
//! much of the meeting must be rewritten.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::booking::Booking;
use crate::ports::NotifyMode;
use crate::recurrence::RecurrencePattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingKind {
    #[default]
    Single,
    Occurrence,
    /// An occurrence that was modified on the calendar side.
    Exception,
    RecurringMaster,
}

/// The calendar's current view of a meeting. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSnapshot {
    pub uid: String,
    pub subject: String,
    pub body: String,
    pub location: String,
    pub attendees: BTreeSet<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// IANA zone the meeting was created in, when the calendar reports one.
    pub time_zone: Option<String>,
    pub kind: MeetingKind,
    pub recurrence: Option<RecurrencePattern>,
    /// Pattern dates that were modified or deleted on the calendar side.
    pub exceptions: Vec<NaiveDate>,
}

impl CalendarSnapshot {
    /// The meeting as the booking wants it to be.
    pub fn from_booking(booking: &Booking, recurrence: Option<&RecurrencePattern>) -> Self {
        Self {
            uid: booking.external_uid.clone(),
            subject: booking.subject.clone(),
            body: booking.body.clone(),
            location: booking.location.clone(),
            attendees: booking.attendees.clone(),
            start: booking.period.start_utc(),
            end: booking.period.end_utc(),
            time_zone: Some(booking.period.time_zone.name().to_string()),
            kind: match (recurrence.is_some(), booking.is_recurring()) {
                (true, _) => MeetingKind::RecurringMaster,
                (false, true) => MeetingKind::Occurrence,
                (false, false) => MeetingKind::Single,
            },
            recurrence: recurrence.cloned(),
            exceptions: Vec::new(),
        }
    }

    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }
}

/// How much of the calendar meeting must be rewritten. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDecision {
    #[default]
    None,
    AttendeesOnly,
    SubjectLocationBody,
    /// Time, zone or recurrence changed; everything is reapplied.
    Full,
}

impl UpdateDecision {
    pub fn combine(self, other: UpdateDecision) -> UpdateDecision {
        self.max(other)
    }

    /// Who is notified when the decision is applied.
    pub fn notify_mode(self) -> NotifyMode {
        match self {
            UpdateDecision::None => NotifyMode::None,
            UpdateDecision::AttendeesOnly => NotifyMode::ChangedAttendees,
            UpdateDecision::SubjectLocationBody | UpdateDecision::Full => NotifyMode::AllAttendees,
        }
    }
}

impl fmt::Display for UpdateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateDecision::None => write!(f, "none"),
            UpdateDecision::AttendeesOnly => write!(f, "attendees"),
            UpdateDecision::SubjectLocationBody => write!(f, "subject/location/body"),
            UpdateDecision::Full => write!(f, "full"),
        }
    }
}

/// Attendees present on one side only, normalized to lowercase addresses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttendeeDelta {
    /// In the booking, missing from the calendar.
    pub added: BTreeSet<String>,
    /// In the calendar, no longer in the booking.
    pub removed: BTreeSet<String>,
}

impl AttendeeDelta {
    pub fn between(booking: &BTreeSet<String>, calendar: &BTreeSet<String>) -> Self {
        let ours = normalize_attendees(booking);
        let theirs = normalize_attendees(calendar);
        Self {
            added: ours.difference(&theirs).cloned().collect(),
            removed: theirs.difference(&ours).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn normalize_attendees(attendees: &BTreeSet<String>) -> BTreeSet<String> {
    attendees
        .iter()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Field-by-field result of comparing a booking with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Comparison {
    pub subject: bool,
    pub body: bool,
    pub location: bool,
    pub time: bool,
    pub time_zone: bool,
    pub recurrence: bool,
    pub attendees: AttendeeDelta,
}

impl Comparison {
    pub fn decision(&self) -> UpdateDecision {
        let mut decision = UpdateDecision::None;
        if !self.attendees.is_empty() {
            decision = decision.combine(UpdateDecision::AttendeesOnly);
        }
        if self.subject || self.body || self.location {
            decision = decision.combine(UpdateDecision::SubjectLocationBody);
        }
        if self.time || self.time_zone || self.recurrence {
            decision = decision.combine(UpdateDecision::Full);
        }
        decision
    }

    pub fn is_equivalent(&self) -> bool {
        self.decision() == UpdateDecision::None
    }
}

/// Compare `booking` (and its pattern, for a series) with `snapshot`.
///
/// Subject is compared exactly; body after [`normalize_body`]; location only
/// when the booking holds a room; attendees as a case-insensitive set.
pub fn compare(
    booking: &Booking,
    pattern: Option<&RecurrencePattern>,
    snapshot: &CalendarSnapshot,
) -> Comparison {
    let time_zone = snapshot
        .time_zone
        .as_deref()
        .is_some_and(|tz| tz != booking.period.time_zone.name());
    let recurrence = match (pattern, &snapshot.recurrence) {
        (None, _) => false,
        (Some(ours), Some(theirs)) => !ours.same_rule(theirs),
        (Some(_), None) => true,
    };

    Comparison {
        subject: booking.subject != snapshot.subject,
        body: normalize_body(&booking.body) != normalize_body(&snapshot.body),
        location: booking.has_rooms() && booking.location != snapshot.location,
        time: booking.period.start_utc() != snapshot.start
            || booking.period.end_utc() != snapshot.end,
        time_zone,
        recurrence,
        attendees: AttendeeDelta::between(&booking.attendees, &snapshot.attendees),
    }
}

/// The update a single booking needs to match `snapshot`.
pub fn decide_update(booking: &Booking, snapshot: &CalendarSnapshot) -> UpdateDecision {
    compare(booking, None, snapshot).decision()
}

/// The update a recurring series needs, recurrence rule included.
pub fn decide_series_update(
    booking: &Booking,
    pattern: &RecurrencePattern,
    snapshot: &CalendarSnapshot,
) -> UpdateDecision {
    compare(booking, Some(pattern), snapshot).decision()
}

// ---------------------------------------------------------------------------
// Body normalization
// ---------------------------------------------------------------------------

const HTML_MARKERS: &[&str] = &["<html", "<body", "<div", "<p>", "<p ", "<br", "<span"];

// Wide enough that rendering never wraps inside a word.
const RENDER_WIDTH: usize = 10_000;

/// Strip the formatting a calendar server adds to a plain-text body.
///
/// HTML bodies are rendered to plain text with `html2text` (entities decoded,
/// `head`, `style` and `script` content dropped); line endings and whitespace
/// runs are then collapsed on both kinds of body.
pub fn normalize_body(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let plain = if HTML_MARKERS.iter().any(|m| lower.contains(m)) {
        html_to_text(text)
    } else {
        text.to_string()
    };
    plain.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn html_to_text(html: &str) -> String {
    match html2text::config::plain().string_from_read(html.as_bytes(), RENDER_WIDTH) {
        Ok(rendered) => rendered,
        Err(err) => {
            tracing::debug!(error = %err, "body not rendered as html, compared verbatim");
            html.to_string()
        }
    }
}
