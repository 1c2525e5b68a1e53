//! Configuration types for the watchdog.

use core::time::Duration;

use crate::error::{WatchdogError, WatchdogResult};

/// Smallest accepted timeout in milliseconds.
pub const MIN_TIMEOUT_MS: u32 = 10;

/// Largest accepted timeout in milliseconds.
///
/// Must cover one block write including a full sector erase on the slowest part.
pub const MAX_TIMEOUT_MS: u32 = 120_000;

/// Watchdog configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Default timeout in milliseconds, used when arming without an explicit timeout.
    ///
    /// Default: 5000ms.
    pub timeout_ms: u32,
}

impl WatchdogConfig {
    /// Create a new configuration with the specified timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout_ms` is outside `MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS`.
    pub fn new(timeout_ms: u32) -> WatchdogResult<Self> {
        let config = Self { timeout_ms };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> WatchdogResult<()> {
        validate_timeout(Duration::from_millis(u64::from(self.timeout_ms)))
    }

    /// Get the timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Check that a timeout is inside the accepted range.
///
/// # Errors
///
/// Returns [`WatchdogError::InvalidConfiguration`] when out of range.
pub fn validate_timeout(timeout: Duration) -> WatchdogResult<()> {
    let min = Duration::from_millis(u64::from(MIN_TIMEOUT_MS));
    let max = Duration::from_millis(u64::from(MAX_TIMEOUT_MS));
    if timeout < min || timeout > max {
        return Err(WatchdogError::invalid_configuration(format!(
            "timeout must be between {MIN_TIMEOUT_MS}ms and {MAX_TIMEOUT_MS}ms, got {}ms",
            timeout.as_millis()
        )));
    }
    Ok(())
}
