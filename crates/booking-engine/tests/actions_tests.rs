//! Per-occurrence actions: candidate filtering, saving, updating,
//! verification.

mod common;

use std::collections::BTreeMap;

use booking_engine::actions::{
    expand_and_apply, resolve_availability, AvailabilityOptions, ExternalTimes,
    FindAvailableRooms, OccurrenceMismatch, SaveNewOccurrence, UpdateExistingOccurrence,
    VerifyExternalOccurrences,
};
use booking_engine::booking::{AllocationState, Booking, BookingId, BookingStatus, TargetKind, TargetRef};
use booking_engine::recurrence::RecurrencePattern;
use booking_engine::EngineError;
use chrono::{Duration, NaiveDate, Weekday};

use common::{date, hm, period, series_template, stored_occurrence, FakeAvailability, MemoryStore};

fn three_mondays() -> RecurrencePattern {
    RecurrencePattern::weekly(1, [Weekday::Mon]).count(3)
}

fn mondays() -> [NaiveDate; 4] {
    [
        date(2024, 1, 1),
        date(2024, 1, 8),
        date(2024, 1, 15),
        date(2024, 1, 22),
    ]
}

/// Stored occurrences 1..=n of the template, ids 201.., synchronized.
fn stored_series(template: &Booking, n: usize) -> Vec<Booking> {
    mondays()
        .iter()
        .take(n)
        .enumerate()
        .map(|(i, day)| {
            let mut row = stored_occurrence(template, i as u32 + 1, *day, 201 + i as i64);
            row.external_uid = "series-1".to_string();
            row
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Room and resource filtering
// ---------------------------------------------------------------------------

#[test]
fn room_already_in_conflict_stays_a_candidate() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 77);
    let mut existing = stored_series(&template, 3);
    existing[1].status = BookingStatus::RoomConflict;
    existing[1].allocations[0].placeholder = true;

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [1, 2],
        TargetKind::Room,
        &availability,
        AvailabilityOptions {
            existing,
            allow_conflicts: false,
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.survivors, vec![TargetRef::room(2), TargetRef::room(1)]);
    assert_eq!(result.conflicts.count(TargetRef::room(1)), 1);
}

#[test]
fn room_newly_taken_is_dropped() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 77);

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [1, 2],
        TargetKind::Room,
        &availability,
        AvailabilityOptions {
            existing: stored_series(&template, 3),
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.survivors, vec![TargetRef::room(2)]);
}

#[test]
fn series_does_not_conflict_with_its_own_rows() {
    let template = series_template(date(2024, 1, 1), &[1]);
    // Occurrence 2 (id 202) is the one holding room 1.
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 202);

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [1],
        TargetKind::Room,
        &availability,
        AvailabilityOptions {
            existing: stored_series(&template, 3),
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.survivors, vec![TargetRef::room(1)]);
    assert!(result.conflicts.is_empty());
}

#[test]
fn allowed_conflicts_keep_rooms_but_count_them() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let availability = FakeAvailability::new()
        .blocked(TargetRef::room(1), date(2024, 1, 8), 77)
        .blocked(TargetRef::room(1), date(2024, 1, 15), 78)
        .blocked(TargetRef::room(2), date(2024, 1, 1), 79);

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [1, 2, 3],
        TargetKind::Room,
        &availability,
        AvailabilityOptions {
            allow_conflicts: true,
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(
        result.survivors,
        vec![TargetRef::room(3), TargetRef::room(2), TargetRef::room(1)]
    );
    assert_eq!(result.conflicts.total(), 3);
}

#[test]
fn conference_series_never_allows_new_conflicts() {
    let mut template = series_template(date(2024, 1, 1), &[1]);
    template.conference_id = Some(3);
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 77);

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [1, 2],
        TargetKind::Room,
        &availability,
        AvailabilityOptions {
            existing: stored_series(&template, 3),
            allow_conflicts: true,
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.survivors, vec![TargetRef::room(2)]);
}

#[test]
fn iteration_stops_once_no_room_is_left() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 1), 77);
    let mut rooms = FindAvailableRooms::new(&availability, template.period, [1]);

    let summary = expand_and_apply(&three_mondays(), &template, &mut rooms).unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.visited, 1);
    assert_eq!(rooms.candidates().count(), 0);
    assert!(rooms.into_result().survivors.is_empty());
}

#[test]
fn resources_must_have_quantity_on_every_date() {
    let template = series_template(date(2024, 1, 1), &[]);
    let chairs = TargetRef::resource(7);
    let screens = TargetRef::resource(8);
    let availability = FakeAvailability::new()
        .capacity(chairs, 4)
        .capacity(screens, 2)
        .hold(chairs, date(2024, 1, 8), 3, 77);

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [7, 8],
        TargetKind::Resource,
        &availability,
        AvailabilityOptions {
            quantity: 2,
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.survivors, vec![screens]);
    assert_eq!(result.conflicts.count(chairs), 1);
}

#[test]
fn resources_held_by_the_edited_series_are_ignored() {
    let template = series_template(date(2024, 1, 1), &[]);
    let chairs = TargetRef::resource(7);
    let availability = FakeAvailability::new()
        .capacity(chairs, 4)
        .hold(chairs, date(2024, 1, 8), 3, 202);

    let result = resolve_availability(
        &three_mondays(),
        &template,
        [7],
        TargetKind::Resource,
        &availability,
        AvailabilityOptions {
            quantity: 2,
            existing: stored_series(&template, 3),
            ..AvailabilityOptions::default()
        },
    )
    .unwrap();

    assert_eq!(result.survivors, vec![chairs]);
}

// ---------------------------------------------------------------------------
// Saving a new series
// ---------------------------------------------------------------------------

#[test]
fn save_new_occurrences_marks_conflicts() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let store = MemoryStore::new();
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 77);
    let mut save = SaveNewOccurrence::new(&store, &availability, template.clone()).unwrap();

    let summary = expand_and_apply(&three_mondays(), &template, &mut save).unwrap();
    assert_eq!(summary.normal, 3);
    assert_eq!(save.conflicts().count(TargetRef::room(1)), 1);

    let saved = save.into_saved();
    assert_eq!(saved.len(), 3);
    let indices: Vec<u32> = saved.iter().map(|b| b.occurrence_index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert!(saved.iter().all(|b| b.parent_id == Some(BookingId(100))));
    assert!(saved.iter().all(|b| b.id.is_some()));

    assert_eq!(saved[0].status, BookingStatus::Confirmed);
    assert_eq!(saved[1].status, BookingStatus::RoomConflict);
    assert_eq!(saved[1].conflict_building_id, Some(9));
    assert!(saved[1].allocations[0].placeholder);
    assert_eq!(saved[2].period, period(date(2024, 1, 15), 10, 11));
    assert_eq!(saved[2].allocations[0].period, saved[2].period);

    assert_eq!(store.occurrences_of(BookingId(100)).len(), 3);
}

#[test]
fn save_skips_cancelled_dates_but_keeps_indices() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let store = MemoryStore::new();
    let availability = FakeAvailability::new();
    let pattern = three_mondays().cancel(date(2024, 1, 8));
    let mut save = SaveNewOccurrence::new(&store, &availability, template.clone()).unwrap();

    expand_and_apply(&pattern, &template, &mut save).unwrap();

    let indices: Vec<u32> = save.saved().iter().map(|b| b.occurrence_index).collect();
    assert_eq!(indices, vec![1, 3]);
}

#[test]
fn save_needs_a_stored_template() {
    let mut template = series_template(date(2024, 1, 1), &[1]);
    template.id = None;
    let store = MemoryStore::new();
    let availability = FakeAvailability::new();

    assert!(matches!(
        SaveNewOccurrence::new(&store, &availability, template),
        Err(EngineError::InvalidBooking(_))
    ));
}

// ---------------------------------------------------------------------------
// Updating an existing series
// ---------------------------------------------------------------------------

fn moved_template(template: &Booking) -> Booking {
    let mut moved = template.clone();
    moved.reschedule(period(date(2024, 1, 1), 14, 15));
    moved
}

#[test]
fn update_reuses_rows_and_cancels_trailing_ones() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let existing = stored_series(&template, 4);
    let store = MemoryStore::with_rows(existing.clone());
    let availability = FakeAvailability::new();
    let moved = moved_template(&template);

    let mut update =
        UpdateExistingOccurrence::new(&store, &availability, moved.clone(), existing).unwrap();
    expand_and_apply(&three_mondays(), &moved, &mut update).unwrap();
    let outcome = update.finish().unwrap();

    let ids: Vec<Option<BookingId>> = outcome.saved.iter().map(|b| b.id).collect();
    assert_eq!(
        ids,
        vec![Some(BookingId(201)), Some(BookingId(202)), Some(BookingId(203))]
    );
    assert!(outcome.saved.iter().all(|b| b.external_uid == "series-1"));
    assert!(outcome.saved.iter().all(|b| b.period.start_time == hm(14, 0)));

    assert_eq!(outcome.cancelled.len(), 1);
    let trailing = store.get(204).unwrap();
    assert_eq!(trailing.status, BookingStatus::Cancelled);
    assert_eq!(trailing.allocations[0].state, AllocationState::Cancelled);
}

#[test]
fn update_attempts_every_occurrence_before_failing() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let existing = stored_series(&template, 4);
    let store = MemoryStore::with_rows(existing.clone());
    store.fail_saves_of(2);
    let availability = FakeAvailability::new();
    let moved = moved_template(&template);

    let mut update =
        UpdateExistingOccurrence::new(&store, &availability, moved.clone(), existing).unwrap();
    expand_and_apply(&three_mondays(), &moved, &mut update).unwrap();

    match update.finish() {
        Err(EngineError::Batch {
            failed,
            total,
            failures,
        }) => {
            assert_eq!((failed, total), (1, 4));
            assert_eq!(failures[0].occurrence_index, 2);
            assert_eq!(failures[0].booking, Some(BookingId(202)));
        }
        other => panic!("expected a batch error, got {other:?}"),
    }

    // The other occurrences went through.
    assert_eq!(store.get(201).unwrap().period.start_time, hm(14, 0));
    assert_eq!(store.get(203).unwrap().period.start_time, hm(14, 0));
    assert_eq!(store.get(202).unwrap().period.start_time, hm(10, 0));
    assert_eq!(store.get(204).unwrap().status, BookingStatus::Cancelled);
}

#[test]
fn conference_series_rejects_new_conflicts_per_occurrence() {
    let mut template = series_template(date(2024, 1, 1), &[1]);
    template.conference_id = Some(3);
    let existing = stored_series(&template, 3);
    let store = MemoryStore::with_rows(existing.clone());
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 77);

    let mut update =
        UpdateExistingOccurrence::new(&store, &availability, template.clone(), existing).unwrap();
    expand_and_apply(&three_mondays(), &template, &mut update).unwrap();

    match update.finish() {
        Err(EngineError::Batch { failures, .. }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].occurrence_index, 2);
            assert!(failures[0].message.contains("room 1 is not available"));
        }
        other => panic!("expected a batch error, got {other:?}"),
    }
    assert_eq!(store.get(202).unwrap().status, BookingStatus::Confirmed);
}

#[test]
fn new_conflicts_can_be_allowed_explicitly() {
    let mut template = series_template(date(2024, 1, 1), &[1]);
    template.conference_id = Some(3);
    let existing = stored_series(&template, 3);
    let store = MemoryStore::with_rows(existing.clone());
    let availability = FakeAvailability::new().blocked(TargetRef::room(1), date(2024, 1, 8), 77);

    let mut update = UpdateExistingOccurrence::new(&store, &availability, template.clone(), existing)
        .unwrap()
        .allow_new_conflicts(true);
    expand_and_apply(&three_mondays(), &template, &mut update).unwrap();
    let outcome = update.finish().unwrap();

    assert_eq!(outcome.saved[1].status, BookingStatus::RoomConflict);
    assert_eq!(outcome.saved[1].conference_id, Some(3));
    assert_eq!(outcome.conflicts.count(TargetRef::room(1)), 1);
}

#[test]
fn cancelled_date_cancels_its_stored_row() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let existing = stored_series(&template, 4);
    let store = MemoryStore::with_rows(existing.clone());
    let availability = FakeAvailability::new();
    let pattern = RecurrencePattern::weekly(1, [Weekday::Mon])
        .count(4)
        .cancel(date(2024, 1, 8));

    let mut update =
        UpdateExistingOccurrence::new(&store, &availability, template.clone(), existing).unwrap();
    expand_and_apply(&pattern, &template, &mut update).unwrap();
    let outcome = update.finish().unwrap();

    assert_eq!(outcome.saved.len(), 3);
    assert_eq!(outcome.cancelled.len(), 1);
    assert_eq!(outcome.cancelled[0].id, Some(BookingId(202)));
    assert_eq!(store.get(202).unwrap().status, BookingStatus::Cancelled);
}

#[test]
fn individually_cancelled_row_stays_cancelled() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let mut existing = stored_series(&template, 3);
    existing[1].status = BookingStatus::Cancelled;
    let store = MemoryStore::with_rows(existing.clone());
    let availability = FakeAvailability::new();

    let mut update =
        UpdateExistingOccurrence::new(&store, &availability, template.clone(), existing).unwrap();
    expand_and_apply(&three_mondays(), &template, &mut update).unwrap();
    let outcome = update.finish().unwrap();

    assert_eq!(outcome.saved.len(), 2);
    assert!(outcome.saved.iter().all(|b| b.id != Some(BookingId(202))));
    assert!(outcome.cancelled.is_empty());
    assert_eq!(store.get(202).unwrap().status, BookingStatus::Cancelled);
    assert_eq!(store.get(201).unwrap().status, BookingStatus::Confirmed);
    assert_eq!(store.all().len(), 3);
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

fn calendar_times(template: &Booking, days: &[NaiveDate]) -> BTreeMap<NaiveDate, ExternalTimes> {
    days.iter()
        .map(|d| (*d, ExternalTimes::from(&template.period.on_date(*d))))
        .collect()
}

#[test]
fn matching_calendar_is_consistent() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let mut verify =
        VerifyExternalOccurrences::new(template.period, calendar_times(&template, &mondays()[..3]));

    expand_and_apply(&three_mondays(), &template, &mut verify).unwrap();

    assert!(verify.is_consistent());
    assert_eq!(verify.checked(), 3);
}

#[test]
fn first_time_difference_stops_verification() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let mut external = calendar_times(&template, &mondays()[..3]);
    let moved = external[&date(2024, 1, 8)];
    external.insert(
        date(2024, 1, 8),
        ExternalTimes {
            start: moved.start + Duration::hours(1),
            end: moved.end + Duration::hours(1),
        },
    );
    let mut verify = VerifyExternalOccurrences::new(template.period, external);

    let summary = expand_and_apply(&three_mondays(), &template, &mut verify).unwrap();

    assert!(summary.stopped_early);
    assert_eq!(verify.checked(), 2);
    assert!(matches!(
        verify.mismatch(),
        Some(OccurrenceMismatch::TimeDiffers { index: 2, .. })
    ));
}

#[test]
fn missing_calendar_occurrence_is_reported() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let external = calendar_times(&template, &mondays()[..2]);
    let mut verify = VerifyExternalOccurrences::new(template.period, external);

    expand_and_apply(&three_mondays(), &template, &mut verify).unwrap();

    assert_eq!(
        verify.mismatch(),
        Some(&OccurrenceMismatch::MissingExternal {
            index: 3,
            date: date(2024, 1, 15)
        })
    );
}

#[test]
fn stored_times_take_precedence_over_the_template() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let mut stored = stored_series(&template, 3);
    stored[1].reschedule(period(date(2024, 1, 8), 14, 15));
    let mut external = calendar_times(&template, &mondays()[..3]);
    external.insert(date(2024, 1, 8), ExternalTimes::from(&stored[1].period));

    let mut verify = VerifyExternalOccurrences::new(template.period, external).with_stored(&stored);
    expand_and_apply(&three_mondays(), &template, &mut verify).unwrap();

    assert!(verify.is_consistent());
}

#[test]
fn cancelled_date_still_on_the_calendar_is_reported() {
    let template = series_template(date(2024, 1, 1), &[1]);
    let external = calendar_times(&template, &mondays()[..3]);
    let pattern = three_mondays().cancel(date(2024, 1, 8));
    let mut verify = VerifyExternalOccurrences::new(template.period, external);

    expand_and_apply(&pattern, &template, &mut verify).unwrap();

    assert_eq!(
        verify.mismatch(),
        Some(&OccurrenceMismatch::UnexpectedExternal {
            index: 2,
            date: date(2024, 1, 8)
        })
    );
}
