//! Error types for booking-engine operations.
//!
//! Not-found outcomes (a deleted occurrence, a missing master) are modelled as
//! `Option`/[`Binding::NotFound`](crate::binder::Binding) and never appear here.

use std::fmt;

use thiserror::Error;

use crate::booking::{BookingId, TargetRef};

/// Failure reported by the booking store collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("booking store error: {0}")]
pub struct StoreError(pub String);

/// Failure reported by the external calendar transport or notification source.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("calendar transport error ({operation}): {message}")]
pub struct TransportError {
    pub operation: String,
    pub message: String,
}

impl TransportError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// One failed occurrence inside a batch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceFailure {
    pub occurrence_index: u32,
    pub booking: Option<BookingId>,
    pub message: String,
}

impl fmt::Display for OccurrenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.booking {
            Some(id) => write!(
                f,
                "occurrence {} (booking {}): {}",
                self.occurrence_index, id, self.message
            ),
            None => write!(f, "occurrence {}: {}", self.occurrence_index, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// The requested room or resource cannot be booked for the period and
    /// introducing a new conflict is not allowed.
    #[error("{target} is not available for this time period{}", booking_suffix(.booking))]
    NotAvailable {
        target: TargetRef,
        booking: Option<BookingId>,
    },

    #[error("recurrence master '{uid}' not found; the series cannot be recreated automatically")]
    MasterNotFound { uid: String },

    #[error("Invalid recurrence pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid time period: {0}")]
    InvalidPeriod(String),

    #[error("Invalid booking: {0}")]
    InvalidBooking(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Aggregate of a batch in which every occurrence was attempted.
    #[error("{failed} of {total} occurrences failed")]
    Batch {
        failed: usize,
        total: usize,
        failures: Vec<OccurrenceFailure>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

fn booking_suffix(booking: &Option<BookingId>) -> String {
    match booking {
        Some(id) => format!(" (booking {id})"),
        None => String::new(),
    }
}

impl EngineError {
    /// Domain errors are surfaced to the user and never retried.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            EngineError::NotAvailable { .. } | EngineError::MasterNotFound { .. }
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
