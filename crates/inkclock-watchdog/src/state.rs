//! Watchdog state machine and metrics.
//!
//! Transitions are atomic so that a shared reference can observe (and record)
//! an expiry without requiring `&mut` access.

use portable_atomic::{AtomicU32, Ordering};

use crate::error::{WatchdogError, WatchdogResult};

/// Watchdog operational status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum WatchdogStatus {
    /// Watchdog is not armed (inactive).
    #[default]
    Disarmed = 0,
    /// Watchdog is armed and counting down.
    Armed = 1,
    /// Deadline passed without a reset; on hardware the device is resetting.
    Expired = 2,
}

impl WatchdogStatus {
    /// Convert from raw u32 value.
    #[must_use]
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Disarmed),
            1 => Some(Self::Armed),
            2 => Some(Self::Expired),
            _ => None,
        }
    }

    /// Convert to raw u32 value.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        self as u32
    }

    /// Get the status as a string slice.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disarmed => "Disarmed",
            Self::Armed => "Armed",
            Self::Expired => "Expired",
        }
    }
}

impl core::fmt::Display for WatchdogStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic watchdog state.
///
/// ```text
/// Disarmed ──arm()──► Armed ──expire()──► Expired
///     ▲                 │                    │
///     └────disarm()─────┴──────disarm()──────┘
/// ```
#[derive(Debug)]
pub struct WatchdogState {
    status: AtomicU32,
    arm_count: AtomicU32,
    reset_count: AtomicU32,
    expiry_count: AtomicU32,
    disarm_count: AtomicU32,
}

impl WatchdogState {
    /// Create a new watchdog state in the Disarmed status.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(WatchdogStatus::Disarmed.to_raw()),
            arm_count: AtomicU32::new(0),
            reset_count: AtomicU32::new(0),
            expiry_count: AtomicU32::new(0),
            disarm_count: AtomicU32::new(0),
        }
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> WatchdogStatus {
        let raw = self.status.load(Ordering::Acquire);
        WatchdogStatus::from_raw(raw).unwrap_or(WatchdogStatus::Disarmed)
    }

    fn transition(&self, from: WatchdogStatus, to: WatchdogStatus) -> WatchdogResult<()> {
        self.status
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                let current = WatchdogStatus::from_raw(current).unwrap_or_default();
                WatchdogError::invalid_transition(current.as_str(), to.as_str())
            })
    }

    /// Transition from Disarmed to Armed.
    ///
    /// # Errors
    ///
    /// Returns an error if the current state is not `Disarmed`.
    pub fn arm(&self) -> WatchdogResult<()> {
        self.transition(WatchdogStatus::Disarmed, WatchdogStatus::Armed)?;
        self.arm_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record a reset (Armed state only).
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::NotArmed`] unless the state is `Armed`.
    pub fn record_reset(&self) -> WatchdogResult<()> {
        if self.status() != WatchdogStatus::Armed {
            return Err(WatchdogError::NotArmed);
        }
        self.reset_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Transition from Armed to Expired.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn expire(&self) -> bool {
        let fired = self
            .transition(WatchdogStatus::Armed, WatchdogStatus::Expired)
            .is_ok();
        if fired {
            self.expiry_count.fetch_add(1, Ordering::Relaxed);
        }
        fired
    }

    /// Transition from Armed or Expired back to Disarmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the watchdog is already disarmed.
    pub fn disarm(&self) -> WatchdogResult<()> {
        let previous = self
            .status
            .swap(WatchdogStatus::Disarmed.to_raw(), Ordering::AcqRel);
        if previous == WatchdogStatus::Disarmed.to_raw() {
            return Err(WatchdogError::invalid_transition("Disarmed", "Disarmed"));
        }
        self.disarm_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of the lifetime counters.
    #[must_use]
    pub fn metrics(&self) -> WatchdogMetrics {
        WatchdogMetrics {
            arm_count: self.arm_count.load(Ordering::Acquire),
            reset_count: self.reset_count.load(Ordering::Acquire),
            expiry_count: self.expiry_count.load(Ordering::Acquire),
            disarm_count: self.disarm_count.load(Ordering::Acquire),
        }
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifetime counters for a watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogMetrics {
    /// Number of times armed.
    pub arm_count: u32,
    /// Number of successful resets.
    pub reset_count: u32,
    /// Number of expiries.
    pub expiry_count: u32,
    /// Number of disarms.
    pub disarm_count: u32,
}

impl WatchdogMetrics {
    /// Whether every arm was matched by a disarm.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.arm_count == self.disarm_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw_round_trip() {
        for status in [
            WatchdogStatus::Disarmed,
            WatchdogStatus::Armed,
            WatchdogStatus::Expired,
        ] {
            assert_eq!(WatchdogStatus::from_raw(status.to_raw()), Some(status));
        }
        assert_eq!(WatchdogStatus::from_raw(7), None);
    }

    #[test]
    fn test_arm_expire_disarm() -> WatchdogResult<()> {
        let state = WatchdogState::new();
        state.arm()?;
        assert!(state.arm().is_err());
        assert!(state.expire());
        assert!(!state.expire());
        assert_eq!(state.status(), WatchdogStatus::Expired);
        assert!(state.record_reset().is_err());
        state.disarm()?;
        assert_eq!(state.status(), WatchdogStatus::Disarmed);
        assert!(state.disarm().is_err());

        let metrics = state.metrics();
        assert_eq!(metrics.arm_count, 1);
        assert_eq!(metrics.expiry_count, 1);
        assert!(metrics.is_balanced());
        Ok(())
    }
}
