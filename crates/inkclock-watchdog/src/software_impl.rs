//! Software watchdog implementation.
//!
//! `SoftwareWatchdog` tracks a deadline against [`tokio::time::Instant`], so it
//! follows a paused test clock exactly like the timers in the write loop.

use core::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{WatchdogConfig, validate_timeout};
use crate::error::{WatchdogError, WatchdogResult};
use crate::state::{WatchdogMetrics, WatchdogState, WatchdogStatus};
use crate::watchdog::{Watchdog, WatchdogToken};

/// Deadline-tracking watchdog for hosts without a hardware timer.
///
/// Expiry is detected lazily: the first `status`, `token` or `reset` call
/// made after the deadline moves the state to `Expired`.
///
/// # Example
///
/// ```rust
/// use inkclock_watchdog::{SoftwareWatchdog, Watchdog};
/// use std::time::Duration;
///
/// # fn main() -> Result<(), inkclock_watchdog::WatchdogError> {
/// let mut watchdog = SoftwareWatchdog::with_default_timeout();
/// watchdog.arm(Duration::from_millis(500))?;
/// watchdog.reset()?;
/// assert!(watchdog.is_armed());
/// watchdog.disarm()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SoftwareWatchdog {
    config: WatchdogConfig,
    state: WatchdogState,
    timeout: Duration,
    last_reset: Option<Instant>,
}

impl SoftwareWatchdog {
    /// Create a new software watchdog with the specified configuration.
    #[must_use]
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            timeout: config.timeout(),
            config,
            state: WatchdogState::new(),
            last_reset: None,
        }
    }

    /// Create a software watchdog with a default timeout in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout is outside the valid range.
    pub fn with_timeout(timeout_ms: u32) -> WatchdogResult<Self> {
        Ok(Self::new(WatchdogConfig::new(timeout_ms)?))
    }

    /// Create a software watchdog with the default 5s timeout.
    #[must_use]
    pub fn with_default_timeout() -> Self {
        Self::new(WatchdogConfig::default())
    }

    /// Configuration this watchdog was built with.
    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Arm using the configured default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog is already armed.
    pub fn arm_default(&mut self) -> WatchdogResult<()> {
        let timeout = self.config.timeout();
        self.arm(timeout)
    }

    fn deadline(&self) -> Option<Instant> {
        self.last_reset.map(|at| at + self.timeout)
    }

    fn check_deadline(&self) -> WatchdogStatus {
        let status = self.state.status();
        if status != WatchdogStatus::Armed {
            return status;
        }
        if let Some(deadline) = self.deadline()
            && Instant::now() >= deadline
            && self.state.expire()
        {
            warn!(
                timeout_ms = millis(self.timeout),
                "software watchdog expired"
            );
        }
        self.state.status()
    }

    fn elapsed_ms(&self) -> u64 {
        self.last_reset
            .map(|at| Instant::now().saturating_duration_since(at))
            .map_or(0, millis)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for SoftwareWatchdog {
    fn default() -> Self {
        Self::with_default_timeout()
    }
}

impl Watchdog for SoftwareWatchdog {
    fn arm(&mut self, timeout: Duration) -> WatchdogResult<()> {
        validate_timeout(timeout)?;
        self.state.arm()?;
        self.timeout = timeout;
        self.last_reset = Some(Instant::now());
        debug!(timeout_ms = millis(timeout), "watchdog armed");
        Ok(())
    }

    fn reset(&mut self) -> WatchdogResult<()> {
        match self.check_deadline() {
            WatchdogStatus::Armed => {
                self.state.record_reset()?;
                self.last_reset = Some(Instant::now());
                Ok(())
            }
            WatchdogStatus::Expired => Err(WatchdogError::Expired {
                elapsed_ms: self.elapsed_ms(),
                timeout_ms: millis(self.timeout),
            }),
            WatchdogStatus::Disarmed => Err(WatchdogError::NotArmed),
        }
    }

    fn disarm(&mut self) -> WatchdogResult<()> {
        self.state.disarm()?;
        self.last_reset = None;
        debug!("watchdog disarmed");
        Ok(())
    }

    fn status(&self) -> WatchdogStatus {
        self.check_deadline()
    }

    fn token(&self) -> WatchdogToken {
        match self.check_deadline() {
            WatchdogStatus::Disarmed => WatchdogToken::disarmed(),
            status => WatchdogToken {
                armed: status == WatchdogStatus::Armed,
                deadline: self.deadline(),
            },
        }
    }

    fn metrics(&self) -> WatchdogMetrics {
        self.state.metrics()
    }
}
