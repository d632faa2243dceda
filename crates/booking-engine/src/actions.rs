//! Per-occurrence actions driven by [`RecurrencePattern::iterate`].
//!
//! The set of actions is closed: [`OccurrenceHandler`] is sealed and
//! implemented only by the types in this module. Each action owns a
//! short-lived accumulator and is meant to be used for one iteration.
//!
//! - [`FindAvailableRooms`] narrows candidate rooms across occurrences.
//! - [`FindAvailableResources`] does the same for quantity-limited resources.
//! - [`SaveNewOccurrence`] persists a new row per occurrence.
//! - [`UpdateExistingOccurrence`] rewrites the rows of an edited series.
//! - [`VerifyExternalOccurrences`] checks stored times against the calendar.
//! - [`FindFirstOccurrence`] finds the first non-cancelled occurrence.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};

use crate::booking::{
    AllocationState, Booking, BookingId, BookingStatus, TargetKind, TargetRef,
};
use crate::conflict::{ConflictCounter, ConflictResolver};
use crate::error::{EngineError, OccurrenceFailure, Result};
use crate::period::TimePeriod;
use crate::ports::{AvailabilityCriteria, AvailabilityQuery, BookingStore};
use crate::recurrence::{IterationSummary, Occurrence, RecurrencePattern};

mod sealed {
    pub trait Sealed {}
}

/// Callback invoked once per occurrence by [`RecurrencePattern::iterate`].
///
/// Returning `Ok(false)` stops the iteration.
pub trait OccurrenceHandler: sealed::Sealed {
    /// A normal occurrence; `occurrence.overridden_period()` is set when the
    /// date was moved to a different time.
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool>;

    /// A cancelled date. It is still visited so counters stay aligned.
    fn handle_cancelled_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        let _ = occurrence;
        Ok(true)
    }
}

/// Apply `action` to every occurrence of `pattern`, starting at the first
/// booking's date.
pub fn expand_and_apply<H>(
    pattern: &RecurrencePattern,
    first_booking: &Booking,
    action: &mut H,
) -> Result<IterationSummary>
where
    H: OccurrenceHandler + ?Sized,
{
    pattern.iterate(first_booking.period.start_date, action)
}

fn available_ids(
    availability: &dyn AvailabilityQuery,
    criteria: &AvailabilityCriteria,
    period: &TimePeriod,
) -> Result<BTreeSet<i64>> {
    Ok(availability
        .find_available(criteria, period)?
        .into_iter()
        .filter(|c| c.target.kind == criteria.kind && c.available_quantity >= criteria.quantity)
        .map(|c| c.target.id)
        .collect())
}

// ---------------------------------------------------------------------------
// Candidate filtering
// ---------------------------------------------------------------------------

/// An occurrence of the series being edited, as far as room checks care.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingOccurrence {
    pub booking: Option<BookingId>,
    pub status: BookingStatus,
    pub targets: BTreeSet<TargetRef>,
}

impl From<&Booking> for ExistingOccurrence {
    fn from(booking: &Booking) -> Self {
        Self {
            booking: booking.id,
            status: booking.status,
            targets: booking.active_allocations().map(|a| a.target).collect(),
        }
    }
}

/// Targets that survived every visited occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityResult {
    /// Ordered by ascending conflict count.
    pub survivors: Vec<TargetRef>,
    pub conflicts: ConflictCounter,
}

/// Keeps the rooms that can host every occurrence.
///
/// When editing a series, a room that was already in conflict on a date stays
/// a candidate; a room that becomes unavailable on a clean date is dropped
/// unless conflicts are allowed.
pub struct FindAvailableRooms<'a> {
    availability: &'a dyn AvailabilityQuery,
    template: TimePeriod,
    candidates: BTreeSet<i64>,
    existing: BTreeMap<NaiveDate, ExistingOccurrence>,
    allow_conflicts: bool,
    counter: ConflictCounter,
}

impl<'a> FindAvailableRooms<'a> {
    pub fn new(
        availability: &'a dyn AvailabilityQuery,
        template: TimePeriod,
        candidates: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            availability,
            template,
            candidates: candidates.into_iter().collect(),
            existing: BTreeMap::new(),
            allow_conflicts: false,
            counter: ConflictCounter::default(),
        }
    }

    /// The current occurrences of the series being edited.
    pub fn editing(mut self, existing: &[Booking]) -> Self {
        self.existing = existing
            .iter()
            .map(|b| (b.period.start_date, ExistingOccurrence::from(b)))
            .collect();
        self
    }

    pub fn allow_conflicts(mut self, allow: bool) -> Self {
        self.allow_conflicts = allow;
        self
    }

    pub fn candidates(&self) -> impl Iterator<Item = TargetRef> + '_ {
        self.candidates.iter().map(|id| TargetRef::room(*id))
    }

    pub fn into_result(self) -> AvailabilityResult {
        let survivors = self
            .counter
            .ranked(self.candidates.iter().map(|id| TargetRef::room(*id)))
            .into_iter()
            .map(|(target, _)| target)
            .collect();
        AvailabilityResult {
            survivors,
            conflicts: self.counter,
        }
    }
}

impl sealed::Sealed for FindAvailableRooms<'_> {}

impl OccurrenceHandler for FindAvailableRooms<'_> {
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        let period = occurrence.period(&self.template);
        let existing = self.existing.get(&period.start_date);

        let mut criteria = AvailabilityCriteria::new(TargetKind::Room)
            .ignoring(existing.and_then(|e| e.booking));
        criteria.targets = self.candidates.clone();
        let free = available_ids(self.availability, &criteria, &period)?;

        let blocked: Vec<i64> = self
            .candidates
            .iter()
            .filter(|id| !free.contains(id))
            .copied()
            .collect();

        for room in blocked {
            let target = TargetRef::room(room);
            self.counter.record(target);
            let repeat = existing.is_some_and(|e| {
                e.status == BookingStatus::RoomConflict && e.targets.contains(&target)
            });
            if repeat || self.allow_conflicts {
                tracing::debug!(%target, index = occurrence.index, repeat, "conflict tolerated");
                continue;
            }
            self.candidates.remove(&room);
        }

        Ok(!self.candidates.is_empty())
    }
}

/// Keeps the resources free in the requested quantity on every occurrence.
pub struct FindAvailableResources<'a> {
    availability: &'a dyn AvailabilityQuery,
    template: TimePeriod,
    candidates: BTreeSet<i64>,
    quantity: u32,
    ignore: BTreeSet<BookingId>,
    counter: ConflictCounter,
}

impl<'a> FindAvailableResources<'a> {
    pub fn new(
        availability: &'a dyn AvailabilityQuery,
        template: TimePeriod,
        candidates: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            availability,
            template,
            candidates: candidates.into_iter().collect(),
            quantity: 1,
            ignore: BTreeSet::new(),
            counter: ConflictCounter::default(),
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Allocations of these bookings (the series being edited) do not count.
    pub fn ignoring(mut self, bookings: impl IntoIterator<Item = BookingId>) -> Self {
        self.ignore.extend(bookings);
        self
    }

    pub fn candidates(&self) -> impl Iterator<Item = TargetRef> + '_ {
        self.candidates.iter().map(|id| TargetRef::resource(*id))
    }

    pub fn into_result(self) -> AvailabilityResult {
        let survivors = self
            .candidates
            .iter()
            .map(|id| TargetRef::resource(*id))
            .collect();
        AvailabilityResult {
            survivors,
            conflicts: self.counter,
        }
    }
}

impl sealed::Sealed for FindAvailableResources<'_> {}

impl OccurrenceHandler for FindAvailableResources<'_> {
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        let period = occurrence.period(&self.template);
        let criteria = AvailabilityCriteria {
            kind: TargetKind::Resource,
            targets: self.candidates.clone(),
            quantity: self.quantity,
            ignore_bookings: self.ignore.clone(),
        };
        let free = available_ids(self.availability, &criteria, &period)?;

        for resource in self.candidates.difference(&free) {
            self.counter.record(TargetRef::resource(*resource));
        }
        self.candidates.retain(|id| free.contains(id));

        Ok(!self.candidates.is_empty())
    }
}

/// Options for [`resolve_availability`].
#[derive(Debug, Clone, Default)]
pub struct AvailabilityOptions {
    pub quantity: u32,
    /// Current occurrences when an existing series is edited.
    pub existing: Vec<Booking>,
    pub allow_conflicts: bool,
}

/// Narrow `candidates` of `kind` to those usable by every occurrence of the
/// series described by `pattern` and `series_template`.
///
/// Conflicts are never allowed while editing a conference-call series.
///
/// # Arguments
/// - `pattern` -- recurrence of the series, anchored at the template's start date
/// - `series_template` -- booking whose period every occurrence copies
/// - `candidates` -- room or resource ids to narrow down
/// - `kind` -- whether `candidates` are rooms or resources
/// - `availability` -- availability query for one target and period
/// - `options` -- requested quantity, the stored occurrences of a series
///   being edited, and whether rooms may keep conflicts
///
/// # Errors
/// Returns `EngineError::InvalidPattern` for a malformed pattern and
/// `EngineError::Store` when the availability query fails. Unavailable
/// targets are dropped from the result, never reported as errors.
pub fn resolve_availability(
    pattern: &RecurrencePattern,
    series_template: &Booking,
    candidates: impl IntoIterator<Item = i64>,
    kind: TargetKind,
    availability: &dyn AvailabilityQuery,
    options: AvailabilityOptions,
) -> Result<AvailabilityResult> {
    let editing_conference =
        series_template.conference_id.is_some() && !options.existing.is_empty();
    let quantity = options.quantity.max(1);

    match kind {
        TargetKind::Room => {
            let mut action = FindAvailableRooms::new(availability, series_template.period, candidates)
                .editing(&options.existing)
                .allow_conflicts(options.allow_conflicts && !editing_conference);
            expand_and_apply(pattern, series_template, &mut action)?;
            Ok(action.into_result())
        }
        TargetKind::Resource => {
            let mut action =
                FindAvailableResources::new(availability, series_template.period, candidates)
                    .with_quantity(quantity)
                    .ignoring(options.existing.iter().filter_map(|b| b.id));
            expand_and_apply(pattern, series_template, &mut action)?;
            Ok(action.into_result())
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn series_id(template: &Booking) -> Result<BookingId> {
    template.id.ok_or_else(|| {
        EngineError::InvalidBooking("series template must be saved before its occurrences".to_string())
    })
}

fn cancel_row(store: &dyn BookingStore, mut booking: Booking) -> Result<Booking> {
    booking.status = BookingStatus::Cancelled;
    for allocation in &mut booking.allocations {
        if allocation.state == AllocationState::Active {
            allocation.state = AllocationState::Cancelled;
        }
    }
    Ok(store.save(booking)?)
}

/// Saves one new booking per occurrence, cloned from the series template.
///
/// Never stops early: an occurrence whose room or resource is taken is saved
/// with status `RoomConflict`.
pub struct SaveNewOccurrence<'a> {
    store: &'a dyn BookingStore,
    resolver: ConflictResolver<'a>,
    template: Booking,
    series: BookingId,
    saved: Vec<Booking>,
}

impl<'a> SaveNewOccurrence<'a> {
    /// # Errors
    /// `EngineError::InvalidBooking` when the template has no id yet.
    pub fn new(
        store: &'a dyn BookingStore,
        availability: &'a dyn AvailabilityQuery,
        template: Booking,
    ) -> Result<Self> {
        let series = series_id(&template)?;
        Ok(Self {
            store,
            resolver: ConflictResolver::new(availability),
            template,
            series,
            saved: Vec::new(),
        })
    }

    pub fn saved(&self) -> &[Booking] {
        &self.saved
    }

    pub fn conflicts(&self) -> &ConflictCounter {
        self.resolver.counter()
    }

    pub fn into_saved(self) -> Vec<Booking> {
        self.saved
    }
}

impl sealed::Sealed for SaveNewOccurrence<'_> {}

impl OccurrenceHandler for SaveNewOccurrence<'_> {
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        let mut booking = self.template.clone();
        booking.id = None;
        booking.parent_id = Some(self.series);
        booking.occurrence_index = occurrence.index;
        booking.conflict_building_id = None;
        booking.reschedule(occurrence.period(&self.template.period));

        let status = self.resolver.resolve(&mut booking, None, true)?;
        if status == BookingStatus::RoomConflict {
            booking.conflict_building_id = self.template.building_id;
        }

        let saved = self.store.save(booking)?;
        tracing::debug!(
            booking = ?saved.id,
            index = occurrence.index,
            status = ?saved.status,
            "occurrence saved"
        );
        self.saved.push(saved);
        Ok(true)
    }
}

/// Result of a completed [`UpdateExistingOccurrence`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub saved: Vec<Booking>,
    pub cancelled: Vec<Booking>,
    pub conflicts: ConflictCounter,
}

/// Rewrites the occurrences of an edited series, reusing stored rows matched
/// by occurrence index.
///
/// Identity fields of a reused row (id, parent, conference group, calendar
/// uid) are kept. Each occurrence is attempted on its own; failures are
/// collected and reported together by [`UpdateExistingOccurrence::finish`].
pub struct UpdateExistingOccurrence<'a> {
    store: &'a dyn BookingStore,
    resolver: ConflictResolver<'a>,
    template: Booking,
    series: BookingId,
    existing: BTreeMap<u32, Booking>,
    allow_new_conflicts: bool,
    saved: Vec<Booking>,
    cancelled: Vec<Booking>,
    failures: Vec<OccurrenceFailure>,
    attempted: usize,
    last_index: u32,
}

impl<'a> UpdateExistingOccurrence<'a> {
    /// New conflicts default to allowed, except for conference-call series.
    ///
    /// # Errors
    /// `EngineError::InvalidBooking` when the template has no id yet.
    pub fn new(
        store: &'a dyn BookingStore,
        availability: &'a dyn AvailabilityQuery,
        template: Booking,
        existing: Vec<Booking>,
    ) -> Result<Self> {
        let series = series_id(&template)?;
        let allow_new_conflicts = template.conference_id.is_none();
        Ok(Self {
            store,
            resolver: ConflictResolver::new(availability),
            template,
            series,
            existing: existing
                .into_iter()
                .filter(|b| b.occurrence_index > 0)
                .map(|b| (b.occurrence_index, b))
                .collect(),
            allow_new_conflicts,
            saved: Vec::new(),
            cancelled: Vec::new(),
            failures: Vec::new(),
            attempted: 0,
            last_index: 0,
        })
    }

    pub fn allow_new_conflicts(mut self, allow: bool) -> Self {
        self.allow_new_conflicts = allow;
        self
    }

    fn build(&self, occurrence: &Occurrence) -> Booking {
        let mut booking = self.template.clone();
        booking.id = None;
        booking.parent_id = Some(self.series);
        booking.occurrence_index = occurrence.index;
        booking.conflict_building_id = None;

        if let Some(previous) = self.existing.get(&occurrence.index) {
            booking.id = previous.id;
            booking.parent_id = previous.parent_id.or(Some(self.series));
            booking.conference_id = previous.conference_id;
            if !previous.external_uid.is_empty() {
                booking.external_uid = previous.external_uid.clone();
            }
        }

        booking.reschedule(occurrence.period(&self.template.period));
        booking
    }

    fn apply(&mut self, occurrence: &Occurrence) -> Result<Booking> {
        let previous_status = self.existing.get(&occurrence.index).map(|b| b.status);
        let mut booking = self.build(occurrence);

        let status = self
            .resolver
            .resolve(&mut booking, previous_status, self.allow_new_conflicts)?;
        if status == BookingStatus::RoomConflict {
            booking.conflict_building_id = self.template.building_id;
        }

        Ok(self.store.save(booking)?)
    }

    fn record_failure(&mut self, index: u32, booking: Option<BookingId>, err: EngineError) {
        tracing::warn!(index, booking = ?booking, error = %err, "occurrence update failed");
        self.failures.push(OccurrenceFailure {
            occurrence_index: index,
            booking,
            message: err.to_string(),
        });
    }

    /// Cancel stored occurrences past the end of the new pattern and report
    /// the outcome.
    ///
    /// # Errors
    /// `EngineError::Batch` when any occurrence failed; every occurrence was
    /// still attempted.
    pub fn finish(mut self) -> Result<UpdateOutcome> {
        let trailing = self
            .store
            .find_active_occurrences_after(self.series, self.last_index)?;
        for row in trailing {
            self.attempted += 1;
            let (index, id) = (row.occurrence_index, row.id);
            match cancel_row(self.store, row) {
                Ok(cancelled) => self.cancelled.push(cancelled),
                Err(err) => self.record_failure(index, id, err),
            }
        }

        if !self.failures.is_empty() {
            return Err(EngineError::Batch {
                failed: self.failures.len(),
                total: self.attempted,
                failures: self.failures,
            });
        }

        tracing::info!(
            series = %self.series,
            saved = self.saved.len(),
            cancelled = self.cancelled.len(),
            "series occurrences updated"
        );
        Ok(UpdateOutcome {
            saved: self.saved,
            cancelled: self.cancelled,
            conflicts: self.resolver.into_counter(),
        })
    }
}

impl sealed::Sealed for UpdateExistingOccurrence<'_> {}

impl OccurrenceHandler for UpdateExistingOccurrence<'_> {
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        self.last_index = occurrence.index;
        // A row cancelled on its own stays cancelled.
        if let Some(previous) = self.existing.get(&occurrence.index) {
            if !previous.status.is_active() {
                tracing::debug!(
                    index = occurrence.index,
                    booking = ?previous.id,
                    status = ?previous.status,
                    "inactive occurrence left unchanged"
                );
                self.existing.remove(&occurrence.index);
                return Ok(true);
            }
        }
        self.attempted += 1;
        match self.apply(occurrence) {
            Ok(saved) => {
                self.existing.remove(&occurrence.index);
                self.saved.push(saved);
            }
            Err(err) => {
                let id = self.existing.get(&occurrence.index).and_then(|b| b.id);
                self.record_failure(occurrence.index, id, err);
            }
        }
        Ok(true)
    }

    fn handle_cancelled_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        self.last_index = occurrence.index;
        let Some(previous) = self.existing.remove(&occurrence.index) else {
            return Ok(true);
        };
        if !previous.status.is_active() {
            return Ok(true);
        }

        self.attempted += 1;
        let id = previous.id;
        match cancel_row(self.store, previous) {
            Ok(cancelled) => self.cancelled.push(cancelled),
            Err(err) => self.record_failure(occurrence.index, id, err),
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Verification and lookup
// ---------------------------------------------------------------------------

/// Start and end of an occurrence as the external calendar has it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalTimes {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<&TimePeriod> for ExternalTimes {
    fn from(period: &TimePeriod) -> Self {
        Self {
            start: period.start_utc(),
            end: period.end_utc(),
        }
    }
}

/// First difference found between a series and its calendar master.
#[derive(Debug, Clone, PartialEq)]
pub enum OccurrenceMismatch {
    MissingExternal {
        index: u32,
        date: NaiveDate,
    },
    TimeDiffers {
        index: u32,
        date: NaiveDate,
        stored: ExternalTimes,
        external: ExternalTimes,
    },
    /// Cancelled here but still present in the calendar.
    UnexpectedExternal {
        index: u32,
        date: NaiveDate,
    },
}

/// Checks that every occurrence exists in the calendar at the stored time.
///
/// Stops at the first mismatch; used before trusting a bulk series update.
pub struct VerifyExternalOccurrences {
    template: TimePeriod,
    stored: BTreeMap<u32, TimePeriod>,
    external: BTreeMap<NaiveDate, ExternalTimes>,
    checked: u32,
    mismatch: Option<OccurrenceMismatch>,
}

impl VerifyExternalOccurrences {
    /// `external` is keyed by the date the pattern produces for each occurrence.
    pub fn new(template: TimePeriod, external: BTreeMap<NaiveDate, ExternalTimes>) -> Self {
        Self {
            template,
            stored: BTreeMap::new(),
            external,
            checked: 0,
            mismatch: None,
        }
    }

    /// Use the stored rows' periods instead of the template where present.
    pub fn with_stored(mut self, bookings: &[Booking]) -> Self {
        self.stored = bookings
            .iter()
            .filter(|b| b.occurrence_index > 0)
            .map(|b| (b.occurrence_index, b.period))
            .collect();
        self
    }

    pub fn checked(&self) -> u32 {
        self.checked
    }

    pub fn mismatch(&self) -> Option<&OccurrenceMismatch> {
        self.mismatch.as_ref()
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatch.is_none()
    }
}

impl sealed::Sealed for VerifyExternalOccurrences {}

impl OccurrenceHandler for VerifyExternalOccurrences {
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        self.checked += 1;
        let period = self
            .stored
            .get(&occurrence.index)
            .copied()
            .unwrap_or_else(|| occurrence.period(&self.template));
        let stored = ExternalTimes::from(&period);

        self.mismatch = match self.external.get(&occurrence.date) {
            None => Some(OccurrenceMismatch::MissingExternal {
                index: occurrence.index,
                date: occurrence.date,
            }),
            Some(external) if *external != stored => Some(OccurrenceMismatch::TimeDiffers {
                index: occurrence.index,
                date: occurrence.date,
                stored,
                external: *external,
            }),
            Some(_) => None,
        };
        Ok(self.mismatch.is_none())
    }

    fn handle_cancelled_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        if self.external.contains_key(&occurrence.date) {
            self.mismatch = Some(OccurrenceMismatch::UnexpectedExternal {
                index: occurrence.index,
                date: occurrence.date,
            });
            return Ok(false);
        }
        Ok(true)
    }
}

/// Finds the first non-cancelled occurrence, optionally at or after a date.
#[derive(Debug, Clone, Default)]
pub struct FindFirstOccurrence {
    not_before: Option<NaiveDate>,
    found: Option<Occurrence>,
    skipped: u32,
}

impl FindFirstOccurrence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_or_after(date: NaiveDate) -> Self {
        Self {
            not_before: Some(date),
            ..Self::default()
        }
    }

    pub fn found(&self) -> Option<&Occurrence> {
        self.found.as_ref()
    }

    /// Cancelled occurrences passed over.
    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

impl sealed::Sealed for FindFirstOccurrence {}

impl OccurrenceHandler for FindFirstOccurrence {
    fn handle_occurrence(&mut self, occurrence: &Occurrence) -> Result<bool> {
        if self.not_before.is_some_and(|d| occurrence.date < d) {
            return Ok(true);
        }
        self.found = Some(*occurrence);
        Ok(false)
    }

    fn handle_cancelled_occurrence(&mut self, _occurrence: &Occurrence) -> Result<bool> {
        self.skipped += 1;
        Ok(true)
    }
}
