//! Bookings and the room/resource allocations they own.

use std::collections::BTreeSet;
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::period::TimePeriod;

/// Store-assigned booking identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookingId(pub i64);

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    #[default]
    AwaitingApproval,
    Confirmed,
    Rejected,
    Cancelled,
    RoomConflict,
    Closed,
}

impl BookingStatus {
    /// Cancelled, rejected and closed bookings hold no allocations.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BookingStatus::AwaitingApproval | BookingStatus::Confirmed | BookingStatus::RoomConflict
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Room,
    Resource,
}

/// A bookable room or resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub id: i64,
}

impl TargetRef {
    pub fn room(id: i64) -> Self {
        Self {
            kind: TargetKind::Room,
            id,
        }
    }

    pub fn resource(id: i64) -> Self {
        Self {
            kind: TargetKind::Resource,
            id,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Room => write!(f, "room {}", self.id),
            TargetKind::Resource => write!(f, "resource {}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    #[default]
    Active,
    Rejected,
    Cancelled,
}

/// A room or resource held by a booking for its own period.
///
/// The allocation period may start before or end after the booking period
/// (set-up and tear-down padding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub target: TargetRef,
    pub period: TimePeriod,
    pub quantity: u32,
    pub state: AllocationState,
    /// Kept on a conflicted booking to show what was asked for; does not
    /// hold the target.
    pub placeholder: bool,
}

impl Allocation {
    pub fn new(target: TargetRef, period: TimePeriod) -> Self {
        Self {
            target,
            period,
            quantity: 1,
            state: AllocationState::Active,
            placeholder: false,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Holds the target: active and not a placeholder.
    pub fn is_binding(&self) -> bool {
        self.state == AllocationState::Active && !self.placeholder
    }
}

/// A reservation, possibly one occurrence of a recurring series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Option<BookingId>,
    /// Series this booking belongs to; set whenever `occurrence_index > 0`.
    pub parent_id: Option<BookingId>,
    /// Links the bookings of one multi-room meeting on the same date.
    pub conference_id: Option<i64>,
    pub period: TimePeriod,
    /// 1-based position in the series; 0 for a single booking.
    pub occurrence_index: u32,
    pub status: BookingStatus,
    pub cost: f64,
    pub comments: String,
    pub organizer: String,
    pub subject: String,
    pub body: String,
    pub location: String,
    pub attendees: BTreeSet<String>,
    /// Calendar-side unique id; empty until synchronized.
    pub external_uid: String,
    pub building_id: Option<i64>,
    /// Building to fall back to when the occurrence could not get its room.
    pub conflict_building_id: Option<i64>,
    pub allocations: Vec<Allocation>,
}

impl Booking {
    pub fn new(period: TimePeriod, organizer: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id: None,
            conference_id: None,
            period,
            occurrence_index: 0,
            status: BookingStatus::default(),
            cost: 0.0,
            comments: String::new(),
            organizer: organizer.into(),
            subject: String::new(),
            body: String::new(),
            location: String::new(),
            attendees: BTreeSet::new(),
            external_uid: String::new(),
            building_id: None,
            conflict_building_id: None,
            allocations: Vec::new(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.occurrence_index > 0
    }

    pub fn is_synchronized(&self) -> bool {
        !self.external_uid.is_empty()
    }

    pub fn has_rooms(&self) -> bool {
        self.allocations
            .iter()
            .any(|a| a.target.kind == TargetKind::Room && a.state == AllocationState::Active)
    }

    /// Active allocations, placeholders included.
    pub fn active_allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations
            .iter()
            .filter(|a| a.state == AllocationState::Active)
    }

    /// Move the booking to `period`, carrying its allocations along.
    ///
    /// Allocations inside the old bounds take the new period. Allocations that
    /// already reached outside the old bounds keep their padding offsets.
    pub fn reschedule(&mut self, period: TimePeriod) {
        let old_start = self.period.start();
        let old_end = self.period.end();
        for allocation in &mut self.allocations {
            let before = (old_start - allocation.period.start()).max(Duration::zero());
            let after = (allocation.period.end() - old_end).max(Duration::zero());
            allocation.period = if before.is_zero() && after.is_zero() {
                period
            } else {
                period.padded(before, after)
            };
        }
        self.period = period;
    }

    /// Cancel a single allocation; the booking itself stays.
    /// Returns false when the booking holds no active allocation of `target`.
    pub fn cancel_allocation(&mut self, target: TargetRef) -> bool {
        let mut cancelled = false;
        for allocation in &mut self.allocations {
            if allocation.target == target && allocation.state == AllocationState::Active {
                allocation.state = AllocationState::Cancelled;
                cancelled = true;
            }
        }
        cancelled
    }

    /// Clear series identity so the booking stands alone.
    pub fn detach_from_series(&mut self) {
        self.parent_id = None;
        self.occurrence_index = 0;
        self.external_uid.clear();
    }
}
