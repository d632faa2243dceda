//! Availability checks and conflict status decisions for single occurrences.
//!
//! "Unavailable" is an expected outcome and is recorded on the booking as
//! `RoomConflict`. The only error raised here is a *new* conflict on an
//! occurrence that was clean before, when new conflicts are not allowed.

use std::collections::BTreeMap;

use crate::booking::{Allocation, AllocationState, Booking, BookingId, BookingStatus, TargetRef};
use crate::error::{EngineError, Result};
use crate::ports::{AvailabilityCriteria, AvailabilityQuery};

/// Per-target count of occurrences in which the target was unavailable.
///
/// Only used to rank candidates for display; never consulted by decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictCounter {
    counts: BTreeMap<TargetRef, u32>,
}

impl ConflictCounter {
    pub fn record(&mut self, target: TargetRef) {
        *self.counts.entry(target).or_insert(0) += 1;
    }

    pub fn count(&self, target: TargetRef) -> u32 {
        self.counts.get(&target).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// `targets` ordered by ascending conflict count, ties by target.
    pub fn ranked(&self, targets: impl IntoIterator<Item = TargetRef>) -> Vec<(TargetRef, u32)> {
        let mut ranked: Vec<(TargetRef, u32)> = targets
            .into_iter()
            .map(|target| (target, self.count(target)))
            .collect();
        ranked.sort_by_key(|&(target, count)| (count, target));
        ranked
    }
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept(BookingStatus),
    /// A new conflict where none is allowed.
    Reject,
}

/// Decide the final status of an occurrence.
///
/// A proposed `RoomConflict` is kept when the occurrence was already in
/// conflict before (repeat conflicts are tolerated) or when new conflicts are
/// allowed. A new conflict on a clean occurrence is rejected otherwise.
pub fn classify(
    new_status: BookingStatus,
    previous_status: Option<BookingStatus>,
    allow_new_conflicts: bool,
) -> Verdict {
    if new_status != BookingStatus::RoomConflict {
        return Verdict::Accept(new_status);
    }
    match previous_status {
        Some(BookingStatus::RoomConflict) => Verdict::Accept(BookingStatus::RoomConflict),
        _ if allow_new_conflicts => Verdict::Accept(BookingStatus::RoomConflict),
        _ => Verdict::Reject,
    }
}

/// Checks candidate allocations against the availability query and tags
/// occurrences that cannot have what they asked for.
pub struct ConflictResolver<'a> {
    availability: &'a dyn AvailabilityQuery,
    counter: ConflictCounter,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(availability: &'a dyn AvailabilityQuery) -> Self {
        Self {
            availability,
            counter: ConflictCounter::default(),
        }
    }

    /// Whether `allocation` can be held for its period. Allocations of
    /// `as_of` (the booking being edited) do not count against it.
    pub fn is_available(&self, allocation: &Allocation, as_of: Option<BookingId>) -> Result<bool> {
        let criteria =
            AvailabilityCriteria::for_target(allocation.target, allocation.quantity).ignoring(as_of);
        let candidates = self
            .availability
            .find_available(&criteria, &allocation.period)?;
        Ok(candidates.iter().any(|c| {
            c.target == allocation.target && c.available_quantity >= allocation.quantity
        }))
    }

    /// Check every active allocation of `booking` and settle its status.
    ///
    /// `booking.status` on entry is the status wanted when everything is
    /// available. Unavailable allocations stay on the booking as placeholders
    /// so the record still shows what was requested.
    ///
    /// # Errors
    /// `EngineError::NotAvailable` for a new conflict when
    /// `allow_new_conflicts` is false and `previous_status` was not already
    /// `RoomConflict`.
    pub fn resolve(
        &mut self,
        booking: &mut Booking,
        previous_status: Option<BookingStatus>,
        allow_new_conflicts: bool,
    ) -> Result<BookingStatus> {
        let mut conflicted = Vec::new();
        for (position, allocation) in booking.active_allocations().enumerate() {
            if !self.is_available(allocation, booking.id)? {
                conflicted.push((position, allocation.target));
            }
        }

        let wanted = if conflicted.is_empty() {
            match booking.status {
                // A formerly conflicted occurrence that is clean again.
                BookingStatus::RoomConflict => BookingStatus::Confirmed,
                status => status,
            }
        } else {
            BookingStatus::RoomConflict
        };

        let status = match classify(wanted, previous_status, allow_new_conflicts) {
            Verdict::Accept(status) => status,
            Verdict::Reject => {
                let target = conflicted[0].1;
                tracing::info!(
                    booking = ?booking.id,
                    index = booking.occurrence_index,
                    %target,
                    "new conflict rejected"
                );
                return Err(EngineError::NotAvailable {
                    target,
                    booking: booking.id,
                });
            }
        };

        for (_, target) in &conflicted {
            self.counter.record(*target);
        }
        let conflicted_positions: Vec<usize> = conflicted.iter().map(|(p, _)| *p).collect();
        for (position, allocation) in booking
            .allocations
            .iter_mut()
            .filter(|a| a.state == AllocationState::Active)
            .enumerate()
        {
            allocation.placeholder = conflicted_positions.contains(&position);
        }

        if !conflicted.is_empty() {
            tracing::debug!(
                booking = ?booking.id,
                index = booking.occurrence_index,
                conflicts = conflicted.len(),
                "occurrence marked as room conflict"
            );
        }

        booking.status = status;
        Ok(status)
    }

    pub fn counter(&self) -> &ConflictCounter {
        &self.counter
    }

    pub fn into_counter(self) -> ConflictCounter {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_status_passes_through() {
        assert_eq!(
            classify(BookingStatus::Confirmed, Some(BookingStatus::RoomConflict), false),
            Verdict::Accept(BookingStatus::Confirmed)
        );
    }

    #[test]
    fn repeat_conflict_is_tolerated_without_permission() {
        assert_eq!(
            classify(
                BookingStatus::RoomConflict,
                Some(BookingStatus::RoomConflict),
                false
            ),
            Verdict::Accept(BookingStatus::RoomConflict)
        );
    }

    #[test]
    fn new_conflict_needs_permission() {
        assert_eq!(
            classify(BookingStatus::RoomConflict, Some(BookingStatus::Confirmed), false),
            Verdict::Reject
        );
        assert_eq!(
            classify(BookingStatus::RoomConflict, None, true),
            Verdict::Accept(BookingStatus::RoomConflict)
        );
    }

    #[test]
    fn ranking_orders_by_fewest_conflicts() {
        let mut counter = ConflictCounter::default();
        counter.record(TargetRef::room(1));
        counter.record(TargetRef::room(1));
        counter.record(TargetRef::room(3));

        let ranked = counter.ranked([TargetRef::room(1), TargetRef::room(2), TargetRef::room(3)]);
        assert_eq!(
            ranked,
            vec![
                (TargetRef::room(2), 0),
                (TargetRef::room(3), 1),
                (TargetRef::room(1), 2)
            ]
        );
    }
}
