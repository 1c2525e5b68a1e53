//! Scoped watchdog supervision.

use core::time::Duration;

use tracing::warn;

use crate::error::WatchdogResult;
use crate::watchdog::{Watchdog, WatchdogToken};

/// Arms a watchdog for the lifetime of the guard.
///
/// The watchdog is disarmed when the guard is dropped, including on early
/// returns and errors from the supervised region. An expired watchdog is
/// disarmed as well so the next update can arm it again.
pub struct WatchdogGuard<'a> {
    watchdog: &'a mut dyn Watchdog,
}

impl<'a> WatchdogGuard<'a> {
    /// Arm `watchdog` with `timeout` and return a guard that owns supervision.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog cannot be armed.
    pub fn arm(watchdog: &'a mut dyn Watchdog, timeout: Duration) -> WatchdogResult<Self> {
        watchdog.arm(timeout)?;
        Ok(Self { watchdog })
    }

    /// Reset the deadline. Call after every completed unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::Expired`](crate::WatchdogError::Expired) if the
    /// deadline already passed.
    pub fn reset(&mut self) -> WatchdogResult<()> {
        self.watchdog.reset()
    }

    /// Current armed flag and deadline.
    #[must_use]
    pub fn token(&self) -> WatchdogToken {
        self.watchdog.token()
    }

    /// Time left before expiry; zero once expired.
    #[must_use]
    pub fn time_remaining(&self) -> Duration {
        self.token().time_remaining().unwrap_or(Duration::ZERO)
    }
}

impl core::fmt::Debug for WatchdogGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WatchdogGuard")
            .field("token", &self.watchdog.token())
            .finish()
    }
}

impl Drop for WatchdogGuard<'_> {
    fn drop(&mut self) {
        if self.watchdog.status() == crate::WatchdogStatus::Disarmed {
            return;
        }
        if let Err(error) = self.watchdog.disarm() {
            warn!(%error, "failed to disarm watchdog on guard drop");
        }
    }
}
