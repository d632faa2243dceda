//! # booking-engine
//!
//! Recurrence, conflict and calendar-sync core for a room booking system.
//!
//! A recurring booking is stored as a series template plus one row per
//! occurrence. This crate expands recurrence patterns into dated occurrences,
//! runs per-occurrence actions over them (availability filtering, saving,
//! updating, verification), decides conflict statuses, and keeps bookings in
//! line with their meetings on an external calendar server.
//!
//! ## Modules
//!
//! - [`period`]: zoned time periods and DST resolution
//! - [`booking`]: bookings, statuses and room/resource allocations
//! - [`recurrence`]: patterns, exceptions and occurrence iteration (`rrule`)
//! - [`actions`]: the closed set of per-occurrence actions
//! - [`conflict`]: availability checks and conflict status decisions
//! - [`equivalence`]: booking vs. calendar meeting comparison
//! - [`binder`]: binding occurrences to calendar meetings, series sync
//! - [`listener`]: reconnecting change-notification listener
//! - [`cache`]: per-account endpoint cache
//! - [`ports`]: store, availability, transport and notification interfaces
//! - [`config`]: layered configuration
//! - [`error`]: error types

pub mod actions;
pub mod binder;
pub mod booking;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod equivalence;
pub mod error;
pub mod listener;
pub mod period;
pub mod ports;
pub mod recurrence;

pub use actions::{expand_and_apply, resolve_availability, OccurrenceHandler};
pub use binder::{bind_occurrence, plan_series_update, Binding, SeriesSynchronizer};
pub use booking::{Booking, BookingId, BookingStatus, TargetKind, TargetRef};
pub use config::EngineConfig;
pub use conflict::classify;
pub use equivalence::{decide_update, normalize_body, UpdateDecision};
pub use error::{EngineError, Result};
pub use listener::{ListenerHandle, ListenerState, ReconnectingNotificationListener};
pub use period::{DstPolicy, TimePeriod};
pub use recurrence::{Occurrence, RecurrencePattern};
