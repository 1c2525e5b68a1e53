//! Boot-time probation and rollback
//!
//! Runs once near the start of boot. New firmware stays on probation until
//! it completes the grace period of healthy main-loop iterations; if it fails
//! to get there within the allowed number of boots, the previous partition is
//! restored together with the settings snapshot taken before the update.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::RollbackConfig;
use crate::device::{FlashDevice, SettingsStore, SystemControl};
use crate::error::{ErrorKind, FirmwareUpdateError, Result};
use crate::partition::{BootRecord, Partition};
use crate::session::{StatusCallback, StatusEvent, UpdateStatus};
use crate::storage::FileStore;
use crate::vault::ConfigVault;

/// Decision taken at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootAction {
    /// Running validated firmware
    Continue,
    /// Running new firmware on probation; `attempt` counts this boot
    OnProbation {
        /// Probation boots so far, including this one
        attempt: u32,
    },
    /// Probation exhausted
    RollbackRequired,
}

/// What a rollback did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Partition that was abandoned
    pub from: Partition,
    /// Partition now active
    pub to: Partition,
    /// Boot metadata of `to` was rewritten from the backup
    pub metadata_restored: bool,
    /// Settings were re-imported from the snapshot
    pub config_restored: bool,
}

/// Device-level partition and probation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Booted partition
    pub active: Partition,
    /// Next write target
    pub staging: Partition,
    /// Whether the running firmware awaits validation
    pub on_probation: bool,
    /// Probation boots counted so far
    pub boot_attempts: u32,
    /// Whether a settings snapshot is stored
    pub snapshot_present: bool,
    /// Boot record sequence number
    pub sequence: u64,
    /// SHA-256 of the active image, when known
    pub image_sha256: Option<String>,
}

/// Boot-time health check and rollback
pub struct RollbackController {
    flash: Arc<dyn FlashDevice>,
    vault: ConfigVault,
    settings: Arc<dyn SettingsStore>,
    system: Arc<dyn SystemControl>,
    config: RollbackConfig,
    healthy_iterations: u32,
    on_probation: bool,
    callback: Option<StatusCallback>,
}

impl std::fmt::Debug for RollbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackController")
            .field("config", &self.config)
            .field("healthy_iterations", &self.healthy_iterations)
            .field("on_probation", &self.on_probation)
            .finish_non_exhaustive()
    }
}

impl RollbackController {
    /// Controller over the device parts; the vault lives in `store`
    pub fn new(
        flash: Arc<dyn FlashDevice>,
        store: Arc<dyn FileStore>,
        settings: Arc<dyn SettingsStore>,
        system: Arc<dyn SystemControl>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            flash,
            vault: ConfigVault::new(store),
            settings,
            system,
            config,
            healthy_iterations: 0,
            on_probation: false,
            callback: None,
        }
    }

    /// Report rollback progress through `callback`
    #[must_use]
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn emit(&self, error: Option<ErrorKind>, message: impl Into<String>) {
        if let Some(callback) = &self.callback {
            callback(&StatusEvent {
                status: UpdateStatus::RollingBack,
                progress: 0,
                error,
                message: message.into(),
            });
        }
    }

    /// Count this boot against the probation budget.
    ///
    /// Call exactly once per boot.
    pub async fn on_boot(&mut self) -> Result<BootAction> {
        let record = self.flash.read_boot_record().await?;
        self.healthy_iterations = 0;
        if !record.on_probation() {
            self.on_probation = false;
            return Ok(BootAction::Continue);
        }
        if record.boot_attempts >= self.config.max_boot_attempts {
            warn!(
                active = %record.active,
                attempts = record.boot_attempts,
                "probation exhausted"
            );
            self.on_probation = true;
            return Ok(BootAction::RollbackRequired);
        }
        let next = record.with_boot_attempt();
        self.flash.write_boot_record(&next).await?;
        self.on_probation = true;
        info!(
            active = %next.active,
            attempt = next.boot_attempts,
            max = self.config.max_boot_attempts,
            "booting on probation"
        );
        Ok(BootAction::OnProbation {
            attempt: next.boot_attempts,
        })
    }

    /// Whether the running firmware has used up its probation boots
    pub async fn is_rollback_needed(&self) -> Result<bool> {
        let record = self.flash.read_boot_record().await?;
        Ok(record.on_probation() && record.boot_attempts >= self.config.max_boot_attempts)
    }

    /// Count one healthy main-loop iteration; returns `true` on the
    /// iteration that marks the firmware valid
    pub async fn record_healthy_iteration(&mut self) -> Result<bool> {
        if !self.on_probation {
            return Ok(false);
        }
        self.healthy_iterations = self.healthy_iterations.saturating_add(1);
        if self.healthy_iterations < self.config.grace_iterations {
            return Ok(false);
        }
        self.mark_valid().await?;
        Ok(true)
    }

    /// End probation and drop the pre-update snapshot
    pub async fn mark_valid(&mut self) -> Result<()> {
        let record = self.flash.read_boot_record().await?;
        if record.on_probation() {
            self.flash.write_boot_record(&record.validated()).await?;
            info!(active = %record.active, "firmware marked valid");
        }
        self.on_probation = false;
        self.vault.discard().await
    }

    /// Return to the previous partition, restore settings and reboot
    pub async fn rollback(&mut self) -> Result<RollbackReport> {
        let record = self.flash.read_boot_record().await?;
        let Some(target) = record.rolled_back() else {
            let err = FirmwareUpdateError::RollbackFailed(format!(
                "partition {} has no previous partition to return to",
                record.active
            ));
            error!(error = %err, "rollback impossible");
            self.emit(Some(err.kind()), err.to_string());
            return Err(err);
        };
        self.emit(None, format!("rolling back from {} to {}", record.active, target.active));
        warn!(from = %record.active, to = %target.active, "rolling back firmware");

        let metadata_restored = self.restore_boot_metadata(target.active).await;

        if let Err(e) = self.flash.write_boot_record(&target).await {
            let err = FirmwareUpdateError::RollbackFailed(format!("boot record write: {e}"));
            error!(error = %err, "rollback aborted");
            self.emit(Some(err.kind()), err.to_string());
            return Err(err);
        }

        let config_restored = match self.restore_settings().await {
            Ok(restored) => restored,
            Err(e) => {
                error!(error = %e, "settings restore failed");
                self.emit(Some(e.kind()), e.to_string());
                false
            }
        };

        self.on_probation = false;
        let report = RollbackReport {
            from: record.active,
            to: target.active,
            metadata_restored,
            config_restored,
        };
        info!(?report, "rollback complete, rebooting");
        self.emit(None, format!("rolled back to {}", target.active));
        self.system
            .reboot()
            .await
            .map_err(|e| FirmwareUpdateError::RollbackFailed(format!("reboot: {e}")))?;
        Ok(report)
    }

    async fn restore_boot_metadata(&self, partition: Partition) -> bool {
        let backup = match self.vault.load_boot_metadata().await {
            Ok(Some(backup)) if backup.partition == partition => backup,
            Ok(_) => return false,
            Err(e) => {
                warn!(error = %e, "boot metadata backup unusable");
                return false;
            }
        };
        match self.flash.read_boot_metadata(partition).await {
            Ok(current) if current == backup.data => false,
            _ => match self.flash.write_boot_metadata(partition, &backup.data).await {
                Ok(()) => {
                    info!(%partition, "boot metadata restored from backup");
                    true
                }
                Err(e) => {
                    warn!(%partition, error = %e, "boot metadata restore failed");
                    false
                }
            },
        }
    }

    async fn restore_settings(&self) -> Result<bool> {
        let snapshot = self
            .vault
            .load()
            .await
            .map_err(|e| FirmwareUpdateError::ConfigRestoreFailed(e.to_string()))?;
        let Some(snapshot) = snapshot else {
            warn!("no settings snapshot to restore");
            return Ok(false);
        };
        let settings = ConfigVault::restore(&snapshot)?;
        self.settings
            .import(&settings)
            .await
            .map_err(|e| FirmwareUpdateError::ConfigRestoreFailed(e.to_string()))?;
        self.vault.discard().await?;
        info!(entries = settings.len(), "settings restored from snapshot");
        Ok(true)
    }

    /// Run the boot check and roll back if probation is exhausted
    pub async fn run_boot_check(&mut self) -> Result<BootAction> {
        let action = self.on_boot().await?;
        if action == BootAction::RollbackRequired {
            self.rollback().await?;
        }
        Ok(action)
    }

    /// Current partition and probation summary
    pub async fn status(&self) -> Result<DeviceStatus> {
        let record: BootRecord = self.flash.read_boot_record().await?;
        let state = record.state();
        Ok(DeviceStatus {
            active: state.active,
            staging: state.staging,
            on_probation: record.on_probation(),
            boot_attempts: record.boot_attempts,
            snapshot_present: self.vault.load().await?.is_some(),
            sequence: record.sequence,
            image_sha256: record.image_sha256,
        })
    }
}
