//! Error types for watchdog operations.

use thiserror::Error;

/// Errors that can occur during watchdog operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchdogError {
    /// Watchdog is not armed.
    #[error("Watchdog is not armed")]
    NotArmed,

    /// The deadline passed before the watchdog was reset.
    #[error("Watchdog expired after {elapsed_ms}ms without a reset (timeout {timeout_ms}ms)")]
    Expired {
        /// Time since the last reset, in milliseconds.
        elapsed_ms: u64,
        /// Configured timeout, in milliseconds.
        timeout_ms: u64,
    },

    /// Hardware backend reported a failure.
    #[error("Watchdog hardware error: {0}")]
    Hardware(String),

    /// Invalid configuration.
    #[error("Invalid watchdog configuration: {0}")]
    InvalidConfiguration(String),

    /// State transition not allowed.
    #[error("Invalid watchdog state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },
}

impl WatchdogError {
    /// Create a hardware error.
    #[must_use]
    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::Hardware(msg.into())
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid transition error.
    #[must_use]
    pub fn invalid_transition(from: &'static str, to: &'static str) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Whether this error means the watchdog fired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}

/// A specialized `Result` type for watchdog operations.
pub type WatchdogResult<T> = Result<T, WatchdogError>;
