//! Interfaces of the collaborators this engine talks to.
//!
//! Storage, availability lookup and the calendar transport are synchronous:
//! the engine runs inside one request at a time. Only the notification side
//! used by the listener is async.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::booking::{Booking, BookingId, TargetKind, TargetRef};
use crate::equivalence::CalendarSnapshot;
use crate::error::{StoreError, TransportError};
use crate::period::TimePeriod;

/// Persistent booking storage.
pub trait BookingStore {
    fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Bookings carrying the calendar unique id, narrowed to one conference
    /// group when given.
    fn find_by_external_uid(
        &self,
        uid: &str,
        conference_id: Option<i64>,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Active occurrences of `series` with an index greater than `index`.
    fn find_active_occurrences_after(
        &self,
        series: BookingId,
        index: u32,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Persist the booking, assigning an id when it has none.
    fn save(&self, booking: Booking) -> Result<Booking, StoreError>;
}

/// What an availability lookup is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityCriteria {
    pub kind: TargetKind,
    /// Restrict the answer to these targets; empty means any.
    pub targets: BTreeSet<i64>,
    pub quantity: u32,
    /// Allocations of these bookings do not count as occupying a target.
    pub ignore_bookings: BTreeSet<BookingId>,
}

impl AvailabilityCriteria {
    pub fn new(kind: TargetKind) -> Self {
        Self {
            kind,
            targets: BTreeSet::new(),
            quantity: 1,
            ignore_bookings: BTreeSet::new(),
        }
    }

    pub fn for_target(target: TargetRef, quantity: u32) -> Self {
        Self {
            kind: target.kind,
            targets: BTreeSet::from([target.id]),
            quantity,
            ignore_bookings: BTreeSet::new(),
        }
    }

    pub fn ignoring(mut self, booking: Option<BookingId>) -> Self {
        self.ignore_bookings.extend(booking);
        self
    }
}

/// A target free for the queried period.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub target: TargetRef,
    pub building_id: Option<i64>,
    /// Units still free; 1 for rooms and unique resources.
    pub available_quantity: u32,
}

/// Room and resource availability. Implementations must not have side effects.
pub trait AvailabilityQuery {
    fn find_available(
        &self,
        criteria: &AvailabilityCriteria,
        period: &TimePeriod,
    ) -> Result<Vec<Candidate>, StoreError>;
}

/// How invitees are told about a calendar write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    None,
    /// Only attendees whose presence changed.
    ChangedAttendees,
    AllAttendees,
}

/// A bound calendar item.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingHandle {
    pub item_id: String,
    pub snapshot: CalendarSnapshot,
}

/// The external calendar, whatever the protocol.
///
/// `Ok(None)` from a bind means the item does not exist; `Err` is reserved for
/// transport failures.
pub trait CalendarTransport {
    fn bind_by_uid(&self, account: &str, uid: &str)
        -> Result<Option<MeetingHandle>, TransportError>;

    /// Bind the 1-based occurrence `index` of a recurrence master.
    fn bind_occurrence(
        &self,
        master: &MeetingHandle,
        index: u32,
    ) -> Result<Option<MeetingHandle>, TransportError>;

    fn create(&self, account: &str, meeting: &CalendarSnapshot)
        -> Result<MeetingHandle, TransportError>;

    fn update(
        &self,
        handle: &MeetingHandle,
        meeting: &CalendarSnapshot,
        notify: NotifyMode,
    ) -> Result<(), TransportError>;

    fn cancel(&self, handle: &MeetingHandle, notify: NotifyMode) -> Result<(), TransportError>;

    fn find_in_window(
        &self,
        account: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeetingHandle>, TransportError>;
}

/// Sending side of the listener's signal channel, handed to a subscription.
///
/// The channel holds at most one pending signal, so repeated notifications
/// while a scan runs collapse into one follow-up scan.
#[derive(Debug, Clone)]
pub struct SignalSender {
    signals: mpsc::Sender<()>,
    failures: mpsc::UnboundedSender<TransportError>,
}

impl SignalSender {
    pub(crate) fn new(
        signals: mpsc::Sender<()>,
        failures: mpsc::UnboundedSender<TransportError>,
    ) -> Self {
        Self { signals, failures }
    }

    /// Report that new change notifications are pending.
    pub fn notify(&self) {
        // A full channel already carries a pending signal.
        let _ = self.signals.try_send(());
    }

    /// Report that the subscription has died.
    pub fn fail(&self, error: TransportError) {
        let _ = self.failures.send(error);
    }
}

/// Live subscription to calendar change notifications.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Open a subscription that reports through `signal` until it fails.
    async fn subscribe(&self, signal: SignalSender) -> Result<(), TransportError>;

    /// Close the current subscription, if any.
    async fn unsubscribe(&self);
}

/// Drains pending change notifications and applies them.
#[async_trait]
pub trait ChangeScanner: Send + Sync {
    /// Returns the number of changes processed.
    async fn scan(&self) -> Result<usize, TransportError>;
}
