//! Engine configuration.
//!
//! Loaded with the `config` crate from an optional TOML file overlaid with
//! environment variables prefixed `BOOKING_ENGINE__` (sections separated by
//! `__`, e.g. `BOOKING_ENGINE__LISTENER__RETRY_DELAY_MS=5000`). Every key has a
//! default, so an empty configuration is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::recurrence::{RecurrencePattern, DEFAULT_MAX_OCCURRENCES};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub recurrence: RecurrenceConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    /// Upper bound on occurrences produced by an `Until` pattern.
    #[serde(default = "default_max_occurrences")]
    pub max_occurrences: u16,
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        Self {
            max_occurrences: default_max_occurrences(),
        }
    }
}

impl RecurrenceConfig {
    pub fn apply(&self, pattern: RecurrencePattern) -> RecurrencePattern {
        pattern.with_max_occurrences(self.max_occurrences)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Pause between a failed subscription and the next attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ListenerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The calendar server accepts subject/body/attendee updates on a
    /// recurring master with exceptions without resetting them.
    #[serde(default = "default_true")]
    pub non_time_series_update: bool,
    /// Send meeting updates to attendees.
    #[serde(default = "default_true")]
    pub notify_attendees: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            non_time_series_update: default_true(),
            notify_attendees: default_true(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` (when given) and `BOOKING_ENGINE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix("BOOKING_ENGINE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;

        tracing::debug!(
            max_occurrences = loaded.recurrence.max_occurrences,
            retry_delay_ms = loaded.listener.retry_delay_ms,
            non_time_series_update = loaded.sync.non_time_series_update,
            "configuration loaded"
        );
        Ok(loaded)
    }

    fn validate(&self) -> Result<()> {
        if self.recurrence.max_occurrences == 0 {
            return Err(EngineError::Config(
                "recurrence.max_occurrences must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_occurrences() -> u16 {
    DEFAULT_MAX_OCCURRENCES
}

fn default_retry_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}
