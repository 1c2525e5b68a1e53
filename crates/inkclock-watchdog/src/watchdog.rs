//! Watchdog trait definition.

use core::time::Duration;

use tokio::time::Instant;

use crate::error::WatchdogResult;
use crate::state::{WatchdogMetrics, WatchdogStatus};

/// Snapshot of a watchdog's supervision window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogToken {
    /// Whether the watchdog is currently counting down.
    pub armed: bool,
    /// Instant at which the watchdog fires unless reset first.
    pub deadline: Option<Instant>,
}

impl WatchdogToken {
    /// Token for a disarmed watchdog.
    #[must_use]
    pub fn disarmed() -> Self {
        Self {
            armed: false,
            deadline: None,
        }
    }

    /// Time left before the deadline, `None` when disarmed.
    ///
    /// Returns `Some(Duration::ZERO)` once the deadline has passed.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        if !self.armed {
            return None;
        }
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Bounded-time guard around the flash write loop.
///
/// If [`reset`](Watchdog::reset) is not called within the armed timeout, a
/// hardware implementation resets the device. Software implementations report
/// [`WatchdogError::Expired`](crate::WatchdogError::Expired) instead.
///
/// Callers should not pair `arm`/`disarm` by hand; use
/// [`WatchdogGuard`](crate::WatchdogGuard), which disarms on drop.
pub trait Watchdog: Send {
    /// Start supervision with the given timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog is already armed or the timeout is
    /// outside the supported range.
    fn arm(&mut self, timeout: Duration) -> WatchdogResult<()>;

    /// Push the deadline out by another full timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog is not armed or has already expired.
    fn reset(&mut self) -> WatchdogResult<()>;

    /// Stop supervision.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog is not armed.
    fn disarm(&mut self) -> WatchdogResult<()>;

    /// Current status.
    fn status(&self) -> WatchdogStatus;

    /// Current armed flag and deadline.
    fn token(&self) -> WatchdogToken;

    /// Lifetime counters.
    fn metrics(&self) -> WatchdogMetrics;

    /// Whether the watchdog is armed.
    fn is_armed(&self) -> bool {
        self.status() == WatchdogStatus::Armed
    }

    /// Whether the deadline passed without a reset.
    fn has_expired(&self) -> bool {
        self.status() == WatchdogStatus::Expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trait_object_is_send() {
        fn assert_send<T: Send + ?Sized>() {}
        assert_send::<dyn Watchdog>();
    }

    #[test]
    fn test_disarmed_token_has_no_remaining_time() {
        let token = WatchdogToken::disarmed();
        assert!(!token.armed);
        assert_eq!(token.time_remaining(), None);
    }
}
