//! Power and memory checks run before anything persistent is touched

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PowerConfig;
use crate::device::{HeapMonitor, PowerMonitor};
use crate::error::{FirmwareUpdateError, Result};

/// Outcome of a power sampling run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerReport {
    /// Samples taken
    pub samples: u32,
    /// Samples inside the safe band
    pub stable: u32,
    /// Threshold the run was judged against
    pub required_percent: u8,
}

impl PowerReport {
    /// Share of stable samples, rounded down
    pub fn stable_percent(&self) -> u8 {
        if self.samples == 0 {
            return 0;
        }
        let percent = u64::from(self.stable) * 100 / u64::from(self.samples);
        u8::try_from(percent.min(100)).unwrap_or(100)
    }

    /// Whether enough samples were stable
    pub fn passed(&self) -> bool {
        self.samples > 0
            && u64::from(self.stable) * 100
                >= u64::from(self.required_percent) * u64::from(self.samples)
    }
}

/// Checks supply stability and free heap
pub struct PreflightGuard {
    power: Arc<dyn PowerMonitor>,
    heap: Arc<dyn HeapMonitor>,
    config: PowerConfig,
}

impl std::fmt::Debug for PreflightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreflightGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PreflightGuard {
    /// Guard over the given monitors
    pub fn new(power: Arc<dyn PowerMonitor>, heap: Arc<dyn HeapMonitor>, config: PowerConfig) -> Self {
        Self { power, heap, config }
    }

    /// Sample the supply `samples` times, `sample_interval` apart.
    ///
    /// A failed reading counts as unstable. [`PowerReport::passed`] is the
    /// pass/fail decision; [`Self::is_power_stable`] returns only that.
    pub async fn check_power(&self) -> PowerReport {
        let mut stable = 0u32;
        for sample in 0..self.config.samples {
            if sample > 0 {
                tokio::time::sleep(self.config.sample_interval()).await;
            }
            match self.power.read_millivolts().await {
                Ok(mv) if self.config.in_band(mv) => stable += 1,
                Ok(mv) => debug!(sample, millivolts = mv, "supply outside safe band"),
                Err(e) => warn!(sample, error = %e, "supply reading failed"),
            }
        }
        PowerReport {
            samples: self.config.samples,
            stable,
            required_percent: self.config.min_stable_percent,
        }
    }

    /// Whether enough supply samples fall inside the safe band
    pub async fn is_power_stable(&self) -> bool {
        self.check_power().await.passed()
    }

    /// Whether at least `required` bytes of heap are free; an unreadable heap fails
    pub fn check_memory(&self, required: u64) -> bool {
        self.free_heap(required).is_ok()
    }

    fn free_heap(&self, required: u64) -> Result<u64> {
        let available = match self.heap.free_heap_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "free heap unreadable");
                0
            }
        };
        if available < required {
            return Err(FirmwareUpdateError::InsufficientMemory { required, available });
        }
        Ok(available)
    }

    /// Run both checks; power first
    pub async fn run(&self, memory_required: u64) -> Result<PowerReport> {
        let report = self.check_power().await;
        if !report.passed() {
            warn!(
                stable = report.stable,
                samples = report.samples,
                "power preflight failed"
            );
            return Err(FirmwareUpdateError::InsufficientPower {
                stable_percent: report.stable_percent(),
                required_percent: report.required_percent,
            });
        }
        let available = self.free_heap(memory_required).inspect_err(|_| {
            warn!(required = memory_required, "memory preflight failed");
        })?;
        info!(
            stable_percent = report.stable_percent(),
            free_heap = available,
            "preflight passed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sim::{ScriptedPower, StaticHeap, StaticPower};
    use proptest::prelude::*;
    use std::time::Duration;

    fn guard(power: Arc<dyn PowerMonitor>, free: Option<u64>) -> PreflightGuard {
        PreflightGuard::new(power, Arc::new(StaticHeap::new(free)), PowerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_samples_are_spaced() {
        let power = Arc::new(StaticPower::new(3700));
        let guard = guard(power.clone(), Some(2 << 20));
        let start = tokio::time::Instant::now();
        let report = guard.check_power().await;
        assert!(report.passed());
        assert_eq!(report.stable_percent(), 100);
        assert_eq!(power.reads(), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_of_five_is_enough() {
        let power = Arc::new(ScriptedPower::new(vec![Some(3700), Some(3700), None, Some(3700), Some(3700)]));
        let report = guard(power, Some(2 << 20)).check_power().await;
        assert_eq!(report.stable, 4);
        assert!(report.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_stability_decision() {
        let steady: Arc<dyn PowerMonitor> = Arc::new(StaticPower::new(3700));
        assert!(guard(steady, Some(2 << 20)).is_power_stable().await);

        let sagging = Arc::new(ScriptedPower::new(vec![Some(3700), None, Some(3100), Some(3700), Some(4400)]));
        assert!(!guard(sagging, Some(2 << 20)).is_power_stable().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stable_samples_fails() {
        let power = Arc::new(StaticPower::new(3000));
        let kind = guard(power, Some(2 << 20)).run(1 << 20).await.err().map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::InsufficientPower));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_fails_closed() {
        let power: Arc<dyn PowerMonitor> = Arc::new(StaticPower::new(3700));
        assert!(!guard(power.clone(), None).check_memory(1));
        assert!(!guard(power.clone(), Some(100)).check_memory(101));
        assert!(guard(power.clone(), Some(101)).check_memory(101));

        let kind = guard(power, Some(512)).run(1 << 20).await.err().map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::InsufficientMemory));
    }

    proptest! {
        #[test]
        fn prop_power_decision_matches_ratio(samples in 1u32..20, stable_seed in 0u32..20, required in 0u8..=100) {
            let stable = stable_seed.min(samples);
            let report = PowerReport { samples, stable, required_percent: required };
            let ratio = f64::from(stable) / f64::from(samples) * 100.0;
            prop_assert_eq!(report.passed(), ratio + 1e-9 >= f64::from(required));
        }
    }
}
