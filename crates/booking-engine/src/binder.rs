//! Matching bookings to their calendar meetings, and keeping a recurring
//! series in step with its calendar master.
//!
//! A missing occurrence or master is an expected outcome and comes back as
//! [`Binding::NotFound`] or `None`. It only becomes an error where no fallback
//! exists: a series whose master is gone cannot be recreated automatically.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::actions::{ExternalTimes, VerifyExternalOccurrences};
use crate::booking::Booking;
use crate::config::SyncConfig;
use crate::equivalence::{compare, decide_update, CalendarSnapshot, UpdateDecision};
use crate::error::{EngineError, OccurrenceFailure, Result};
use crate::ports::{BookingStore, CalendarTransport, MeetingHandle, NotifyMode};
use crate::recurrence::RecurrencePattern;

/// Result of binding a booking to a calendar meeting.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Found(MeetingHandle),
    NotFound,
}

impl Binding {
    pub fn is_found(&self) -> bool {
        matches!(self, Binding::Found(_))
    }

    pub fn into_option(self) -> Option<MeetingHandle> {
        match self {
            Binding::Found(handle) => Some(handle),
            Binding::NotFound => None,
        }
    }
}

/// Resolves bookings to meetings in one calendar account.
pub struct OccurrenceBinder<'a> {
    transport: &'a dyn CalendarTransport,
    account: String,
}

impl<'a> OccurrenceBinder<'a> {
    pub fn new(transport: &'a dyn CalendarTransport, account: impl Into<String>) -> Self {
        Self {
            transport,
            account: account.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// The recurrence master carrying the booking's calendar uid.
    pub fn resolve_master(&self, booking: &Booking) -> Result<Option<MeetingHandle>> {
        if !booking.is_synchronized() {
            return Ok(None);
        }
        Ok(self
            .transport
            .bind_by_uid(&self.account, &booking.external_uid)?)
    }

    /// Find the meeting for `booking`.
    ///
    /// Single bookings are looked up by their UTC time window. Occurrences
    /// are bound by index on `master` (resolved by uid when not supplied).
    /// An occurrence already removed from the calendar series yields
    /// `Binding::NotFound`; callers detach the booking and create a standalone
    /// meeting for it.
    pub fn resolve(&self, booking: &Booking, master: Option<&MeetingHandle>) -> Result<Binding> {
        if !booking.is_recurring() {
            return self.resolve_single(booking);
        }

        let fetched;
        let master = match master {
            Some(master) => master,
            None => match self.resolve_master(booking)? {
                Some(found) => {
                    fetched = found;
                    &fetched
                }
                None => {
                    tracing::debug!(
                        booking = ?booking.id,
                        uid = %booking.external_uid,
                        "recurrence master not found"
                    );
                    return Ok(Binding::NotFound);
                }
            },
        };

        match self
            .transport
            .bind_occurrence(master, booking.occurrence_index)?
        {
            Some(handle) => Ok(Binding::Found(handle)),
            None => {
                tracing::debug!(
                    booking = ?booking.id,
                    index = booking.occurrence_index,
                    "occurrence no longer part of the calendar series"
                );
                Ok(Binding::NotFound)
            }
        }
    }

    fn resolve_single(&self, booking: &Booking) -> Result<Binding> {
        let start = booking.period.start_utc();
        let end = booking.period.end_utc();
        let candidates = self.transport.find_in_window(&self.account, start, end)?;

        let found = if booking.is_synchronized() {
            candidates
                .into_iter()
                .find(|h| h.snapshot.uid == booking.external_uid)
        } else {
            candidates
                .into_iter()
                .find(|h| h.snapshot.start == start && h.snapshot.end == end)
        };

        Ok(found.map_or(Binding::NotFound, Binding::Found))
    }
}

/// Convenience wrapper around [`OccurrenceBinder::resolve`].
pub fn bind_occurrence(
    transport: &dyn CalendarTransport,
    account: &str,
    booking: &Booking,
    known_master: Option<&MeetingHandle>,
) -> Result<Binding> {
    OccurrenceBinder::new(transport, account).resolve(booking, known_master)
}

// ---------------------------------------------------------------------------
// Series synchronization
// ---------------------------------------------------------------------------

/// What the calendar server can do with a recurring master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarCapabilities {
    /// Subject/body/attendee updates on a master that has exceptions, without
    /// touching the occurrence times.
    pub non_time_series_update: bool,
}

impl From<&SyncConfig> for CalendarCapabilities {
    fn from(config: &SyncConfig) -> Self {
        Self {
            non_time_series_update: config.non_time_series_update,
        }
    }
}

/// How a series update is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesSyncPlan {
    /// Rewrite the master; the calendar regenerates every occurrence.
    BulkSeriesUpdate,
    /// Rewrite the master's non-time fields, then fix each occurrence's time.
    NonTimeThenPerOccurrence,
    /// Reconcile occurrence by occurrence.
    PerOccurrenceOnly,
}

/// Pick the series update path.
///
/// # Errors
/// `EngineError::MasterNotFound` when `master` is `None`.
pub fn plan_series_update(
    uid: &str,
    master: Option<&MeetingHandle>,
    has_exceptions: bool,
    capabilities: CalendarCapabilities,
) -> Result<SeriesSyncPlan> {
    match master {
        Some(_) => Ok(plan_with_master(has_exceptions, capabilities)),
        None => Err(EngineError::MasterNotFound {
            uid: uid.to_string(),
        }),
    }
}

fn plan_with_master(has_exceptions: bool, capabilities: CalendarCapabilities) -> SeriesSyncPlan {
    match (has_exceptions, capabilities.non_time_series_update) {
        (false, _) => SeriesSyncPlan::BulkSeriesUpdate,
        (true, true) => SeriesSyncPlan::NonTimeThenPerOccurrence,
        (true, false) => SeriesSyncPlan::PerOccurrenceOnly,
    }
}

/// What happened to one occurrence during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceSync {
    Unchanged,
    Updated(UpdateDecision),
    /// The calendar had dropped it; recreated as a standalone meeting.
    Detached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSyncReport {
    pub plan: SeriesSyncPlan,
    pub master_decision: UpdateDecision,
    /// Per occurrence index; empty when the bulk update covered everything.
    pub occurrences: BTreeMap<u32, OccurrenceSync>,
}

impl SeriesSyncReport {
    pub fn count(&self, outcome: OccurrenceSync) -> usize {
        self.occurrences.values().filter(|o| **o == outcome).count()
    }
}

/// Pushes a recurring series to the calendar.
pub struct SeriesSynchronizer<'a> {
    binder: OccurrenceBinder<'a>,
    transport: &'a dyn CalendarTransport,
    store: &'a dyn BookingStore,
    capabilities: CalendarCapabilities,
    notify_attendees: bool,
}

impl<'a> SeriesSynchronizer<'a> {
    pub fn new(
        transport: &'a dyn CalendarTransport,
        store: &'a dyn BookingStore,
        account: impl Into<String>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            binder: OccurrenceBinder::new(transport, account),
            transport,
            store,
            capabilities: CalendarCapabilities::from(config),
            notify_attendees: config.notify_attendees,
        }
    }

    fn notify(&self, decision: UpdateDecision) -> NotifyMode {
        if self.notify_attendees {
            decision.notify_mode()
        } else {
            NotifyMode::None
        }
    }

    /// Bring the calendar copy of `series` (with `pattern`) and its stored
    /// `occurrences` in line.
    ///
    /// The plan follows [`plan_series_update`]. A bulk update whose calendar
    /// occurrences no longer follow the pattern falls back to per-occurrence
    /// reconciliation.
    ///
    /// # Arguments
    /// - `series` -- the series template booking, synchronized (non-empty uid)
    /// - `pattern` -- the series' recurrence as stored
    /// - `occurrences` -- stored occurrence rows, cancelled ones included
    ///
    /// # Errors
    /// Returns `EngineError::MasterNotFound` when the calendar master is gone,
    /// `EngineError::Transport` when the master lookup or update fails, and
    /// `EngineError::Batch` when some occurrences failed (all were attempted).
    pub fn sync_series(
        &self,
        series: &Booking,
        pattern: &RecurrencePattern,
        occurrences: &[Booking],
    ) -> Result<SeriesSyncReport> {
        let Some(master) = self.binder.resolve_master(series)? else {
            return Err(EngineError::MasterNotFound {
                uid: series.external_uid.clone(),
            });
        };
        let has_exceptions = master.snapshot.has_exceptions() || pattern.has_exceptions();
        let plan = plan_with_master(has_exceptions, self.capabilities);

        tracing::info!(
            series = ?series.id,
            uid = %series.external_uid,
            ?plan,
            "synchronizing series"
        );

        let mut report = SeriesSyncReport {
            plan,
            master_decision: UpdateDecision::None,
            occurrences: BTreeMap::new(),
        };

        let reconcile = match plan {
            SeriesSyncPlan::BulkSeriesUpdate => {
                let comparison = compare(series, Some(pattern), &master.snapshot);
                report.master_decision = comparison.decision();
                if report.master_decision != UpdateDecision::None {
                    let desired = CalendarSnapshot::from_booking(series, Some(pattern));
                    self.transport.update(
                        &master,
                        &desired,
                        self.notify(report.master_decision),
                    )?;
                }
                // Stored rows that deviate from the pattern still need their
                // own times pushed.
                !self.occurrences_follow_pattern(series, pattern, occurrences)?
            }
            SeriesSyncPlan::NonTimeThenPerOccurrence => {
                let mut desired = CalendarSnapshot::from_booking(series, Some(pattern));
                desired.start = master.snapshot.start;
                desired.end = master.snapshot.end;
                desired.time_zone = master.snapshot.time_zone.clone();
                desired.recurrence = master.snapshot.recurrence.clone();

                let comparison = compare(series, None, &master.snapshot);
                let decision = if comparison.subject || comparison.body || comparison.location {
                    UpdateDecision::SubjectLocationBody
                } else if !comparison.attendees.is_empty() {
                    UpdateDecision::AttendeesOnly
                } else {
                    UpdateDecision::None
                };
                report.master_decision = decision;
                if decision != UpdateDecision::None {
                    self.transport
                        .update(&master, &desired, self.notify(decision))?;
                }
                true
            }
            SeriesSyncPlan::PerOccurrenceOnly => true,
        };

        if reconcile {
            report.occurrences = self.reconcile_occurrences(&master, occurrences)?;
        }
        Ok(report)
    }

    fn occurrences_follow_pattern(
        &self,
        series: &Booking,
        pattern: &RecurrencePattern,
        occurrences: &[Booking],
    ) -> Result<bool> {
        let expected: BTreeMap<NaiveDate, ExternalTimes> = pattern
            .expand(series.period.start_date)?
            .into_iter()
            .filter(|o| !o.is_cancelled())
            .map(|o| (o.date, ExternalTimes::from(&o.period(&series.period))))
            .collect();

        let mut verify =
            VerifyExternalOccurrences::new(series.period, expected).with_stored(occurrences);
        pattern.iterate(series.period.start_date, &mut verify)?;
        if let Some(mismatch) = verify.mismatch() {
            tracing::debug!(?mismatch, "stored occurrences deviate from the series pattern");
        }
        Ok(verify.is_consistent())
    }

    /// Reconcile each stored occurrence with its calendar instance.
    ///
    /// # Errors
    /// `EngineError::Batch` listing every occurrence that failed.
    pub fn reconcile_occurrences(
        &self,
        master: &MeetingHandle,
        occurrences: &[Booking],
    ) -> Result<BTreeMap<u32, OccurrenceSync>> {
        let mut outcomes = BTreeMap::new();
        let mut failures = Vec::new();
        let mut attempted = 0;

        for occurrence in occurrences.iter().filter(|b| b.is_recurring()) {
            attempted += 1;
            match self.reconcile_one(master, occurrence) {
                Ok(outcome) => {
                    outcomes.insert(occurrence.occurrence_index, outcome);
                }
                Err(err) => {
                    tracing::warn!(
                        booking = ?occurrence.id,
                        index = occurrence.occurrence_index,
                        error = %err,
                        "occurrence synchronization failed"
                    );
                    failures.push(OccurrenceFailure {
                        occurrence_index: occurrence.occurrence_index,
                        booking: occurrence.id,
                        message: err.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(EngineError::Batch {
                failed: failures.len(),
                total: attempted,
                failures,
            });
        }
        Ok(outcomes)
    }

    fn reconcile_one(&self, master: &MeetingHandle, occurrence: &Booking) -> Result<OccurrenceSync> {
        let binding = self.binder.resolve(occurrence, Some(master))?;

        if !occurrence.status.is_active() {
            return match binding {
                Binding::Found(handle) => {
                    self.transport
                        .cancel(&handle, self.notify(UpdateDecision::Full))?;
                    Ok(OccurrenceSync::Cancelled)
                }
                Binding::NotFound => Ok(OccurrenceSync::Unchanged),
            };
        }

        match binding {
            Binding::Found(handle) => {
                let decision = decide_update(occurrence, &handle.snapshot);
                if decision == UpdateDecision::None {
                    return Ok(OccurrenceSync::Unchanged);
                }
                let desired = CalendarSnapshot::from_booking(occurrence, None);
                self.transport
                    .update(&handle, &desired, self.notify(decision))?;
                Ok(OccurrenceSync::Updated(decision))
            }
            Binding::NotFound => {
                let mut standalone = occurrence.clone();
                standalone.detach_from_series();
                let created = self.transport.create(
                    self.binder.account(),
                    &CalendarSnapshot::from_booking(&standalone, None),
                )?;
                standalone.external_uid = created.snapshot.uid.clone();
                let saved = self.store.save(standalone)?;
                tracing::info!(
                    booking = ?saved.id,
                    uid = %saved.external_uid,
                    "occurrence detached into a standalone meeting"
                );
                Ok(OccurrenceSync::Detached)
            }
        }
    }
}
