//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use booking_engine::booking::{Allocation, Booking, BookingId, BookingStatus, TargetRef};
use booking_engine::equivalence::{CalendarSnapshot, MeetingKind};
use booking_engine::error::{StoreError, TransportError};
use booking_engine::period::TimePeriod;
use booking_engine::ports::{
    AvailabilityCriteria, AvailabilityQuery, BookingStore, CalendarTransport, Candidate,
    MeetingHandle, NotifyMode,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// `start_hour:00`-`end_hour:00` on `day`, in UTC.
pub fn period(day: NaiveDate, start_hour: u32, end_hour: u32) -> TimePeriod {
    TimePeriod::on_day(day, hm(start_hour, 0), hm(end_hour, 0), Tz::UTC).unwrap()
}

/// A confirmed booking holding `rooms` for its whole period.
pub fn booking_with_rooms(period: TimePeriod, rooms: &[i64]) -> Booking {
    let mut booking = Booking::new(period, "organizer@example.com");
    booking.status = BookingStatus::Confirmed;
    booking.subject = "Weekly Sync".to_string();
    booking.building_id = Some(9);
    booking.allocations = rooms
        .iter()
        .map(|id| Allocation::new(TargetRef::room(*id), period))
        .collect();
    booking
}

/// A saved series template (id 100) starting on `first`.
pub fn series_template(first: NaiveDate, rooms: &[i64]) -> Booking {
    let mut template = booking_with_rooms(period(first, 10, 11), rooms);
    template.id = Some(BookingId(100));
    template
}

/// Occurrence `index` of `template` on `day`, as it would have been saved.
pub fn stored_occurrence(template: &Booking, index: u32, day: NaiveDate, id: i64) -> Booking {
    let mut occurrence = template.clone();
    occurrence.id = Some(BookingId(id));
    occurrence.parent_id = template.id;
    occurrence.occurrence_index = index;
    occurrence.reschedule(template.period.on_date(day));
    occurrence
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<i64, Booking>>,
    next_id: Mutex<i64>,
    failing_indices: Mutex<BTreeSet<u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1000),
            ..Self::default()
        }
    }

    pub fn with_rows(rows: impl IntoIterator<Item = Booking>) -> Self {
        let store = Self::new();
        for row in rows {
            let id = row.id.expect("seeded rows carry ids").0;
            store.rows.lock().unwrap().insert(id, row);
        }
        store
    }

    /// Saves of active occurrences with this index fail.
    pub fn fail_saves_of(&self, index: u32) {
        self.failing_indices.lock().unwrap().insert(index);
    }

    pub fn get(&self, id: i64) -> Option<Booking> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Booking> {
        self.rows.lock().unwrap().values().cloned().collect()
    }

    pub fn occurrences_of(&self, series: BookingId) -> Vec<Booking> {
        let mut rows: Vec<Booking> = self
            .all()
            .into_iter()
            .filter(|b| b.parent_id == Some(series))
            .collect();
        rows.sort_by_key(|b| b.occurrence_index);
        rows
    }
}

impl BookingStore for MemoryStore {
    fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.get(id.0))
    }

    fn find_by_external_uid(
        &self,
        uid: &str,
        conference_id: Option<i64>,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .all()
            .into_iter()
            .filter(|b| b.external_uid == uid)
            .filter(|b| conference_id.is_none() || b.conference_id == conference_id)
            .collect())
    }

    fn find_active_occurrences_after(
        &self,
        series: BookingId,
        index: u32,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .occurrences_of(series)
            .into_iter()
            .filter(|b| b.occurrence_index > index && b.status.is_active())
            .collect())
    }

    fn save(&self, mut booking: Booking) -> Result<Booking, StoreError> {
        if booking.status.is_active()
            && self
                .failing_indices
                .lock()
                .unwrap()
                .contains(&booking.occurrence_index)
        {
            return Err(StoreError(format!(
                "write rejected for occurrence {}",
                booking.occurrence_index
            )));
        }
        let id = match booking.id {
            Some(id) => id,
            None => {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                BookingId(*next)
            }
        };
        booking.id = Some(id);
        self.rows.lock().unwrap().insert(id.0, booking.clone());
        Ok(booking)
    }
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Units of a target taken on one date.
#[derive(Debug, Clone)]
pub struct Hold {
    pub target: TargetRef,
    pub date: NaiveDate,
    pub quantity: u32,
    pub holder: BookingId,
}

/// Targets have a capacity (1 unless set) minus what other bookings hold on
/// the queried start date.
#[derive(Default)]
pub struct FakeAvailability {
    capacity: BTreeMap<TargetRef, u32>,
    holds: Vec<Hold>,
    calls: Mutex<u32>,
}

impl FakeAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, target: TargetRef, units: u32) -> Self {
        self.capacity.insert(target, units);
        self
    }

    /// `target` is fully taken by `holder` on `date`.
    pub fn blocked(self, target: TargetRef, date: NaiveDate, holder: i64) -> Self {
        let quantity = self.capacity.get(&target).copied().unwrap_or(1);
        self.hold(target, date, quantity, holder)
    }

    pub fn hold(mut self, target: TargetRef, date: NaiveDate, quantity: u32, holder: i64) -> Self {
        self.holds.push(Hold {
            target,
            date,
            quantity,
            holder: BookingId(holder),
        });
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl AvailabilityQuery for FakeAvailability {
    fn find_available(
        &self,
        criteria: &AvailabilityCriteria,
        period: &TimePeriod,
    ) -> Result<Vec<Candidate>, StoreError> {
        *self.calls.lock().unwrap() += 1;
        let mut free = Vec::new();
        for id in &criteria.targets {
            let target = TargetRef {
                kind: criteria.kind,
                id: *id,
            };
            let capacity = self.capacity.get(&target).copied().unwrap_or(1);
            let taken: u32 = self
                .holds
                .iter()
                .filter(|h| h.target == target && h.date == period.start_date)
                .filter(|h| !criteria.ignore_bookings.contains(&h.holder))
                .map(|h| h.quantity)
                .sum();
            let available = capacity.saturating_sub(taken);
            if available >= criteria.quantity {
                free.push(Candidate {
                    target,
                    building_id: Some(9),
                    available_quantity: available,
                });
            }
        }
        Ok(free)
    }
}

// ---------------------------------------------------------------------------
// Calendar transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpdate {
    pub item_id: String,
    pub meeting: CalendarSnapshot,
    pub notify: NotifyMode,
}

#[derive(Default)]
struct Calendar {
    masters: BTreeMap<String, MeetingHandle>,
    occurrences: BTreeMap<(String, u32), MeetingHandle>,
    singles: Vec<MeetingHandle>,
    updates: Vec<RecordedUpdate>,
    created: Vec<CalendarSnapshot>,
    cancelled: Vec<String>,
    failing_items: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeCalendar {
    inner: Mutex<Calendar>,
}

pub fn handle(item_id: &str, snapshot: CalendarSnapshot) -> MeetingHandle {
    MeetingHandle {
        item_id: item_id.to_string(),
        snapshot,
    }
}

impl FakeCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_master(&self, snapshot: CalendarSnapshot) -> MeetingHandle {
        let master = handle(&format!("master-{}", snapshot.uid), snapshot);
        self.inner
            .lock()
            .unwrap()
            .masters
            .insert(master.snapshot.uid.clone(), master.clone());
        master
    }

    pub fn add_occurrence(&self, uid: &str, index: u32, mut snapshot: CalendarSnapshot) {
        snapshot.uid = uid.to_string();
        snapshot.kind = MeetingKind::Occurrence;
        let occurrence = handle(&format!("{uid}-{index}"), snapshot);
        self.inner
            .lock()
            .unwrap()
            .occurrences
            .insert((uid.to_string(), index), occurrence);
    }

    pub fn add_single(&self, snapshot: CalendarSnapshot) {
        let single = handle(&format!("single-{}", snapshot.uid), snapshot);
        self.inner.lock().unwrap().singles.push(single);
    }

    pub fn fail_updates_of(&self, item_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_items
            .insert(item_id.to_string());
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.inner.lock().unwrap().updates.clone()
    }

    pub fn created(&self) -> Vec<CalendarSnapshot> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancelled.clone()
    }
}

impl CalendarTransport for FakeCalendar {
    fn bind_by_uid(
        &self,
        _account: &str,
        uid: &str,
    ) -> Result<Option<MeetingHandle>, TransportError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.masters.get(uid).cloned().or_else(|| {
            inner
                .singles
                .iter()
                .find(|h| h.snapshot.uid == uid)
                .cloned()
        }))
    }

    fn bind_occurrence(
        &self,
        master: &MeetingHandle,
        index: u32,
    ) -> Result<Option<MeetingHandle>, TransportError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .occurrences
            .get(&(master.snapshot.uid.clone(), index))
            .cloned())
    }

    fn create(
        &self,
        _account: &str,
        meeting: &CalendarSnapshot,
    ) -> Result<MeetingHandle, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.created.push(meeting.clone());
        let mut snapshot = meeting.clone();
        snapshot.uid = format!("created-{}", inner.created.len());
        let created = handle(&format!("single-{}", snapshot.uid), snapshot);
        inner.singles.push(created.clone());
        Ok(created)
    }

    fn update(
        &self,
        handle: &MeetingHandle,
        meeting: &CalendarSnapshot,
        notify: NotifyMode,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_items.contains(&handle.item_id) {
            return Err(TransportError::new("update", "server busy"));
        }
        inner.updates.push(RecordedUpdate {
            item_id: handle.item_id.clone(),
            meeting: meeting.clone(),
            notify,
        });
        Ok(())
    }

    fn cancel(&self, handle: &MeetingHandle, _notify: NotifyMode) -> Result<(), TransportError> {
        self.inner
            .lock()
            .unwrap()
            .cancelled
            .push(handle.item_id.clone());
        Ok(())
    }

    fn find_in_window(
        &self,
        _account: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeetingHandle>, TransportError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .singles
            .iter()
            .filter(|h| h.snapshot.start < end && start < h.snapshot.end)
            .cloned()
            .collect())
    }
}
