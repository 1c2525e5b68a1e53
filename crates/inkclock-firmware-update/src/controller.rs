//! Partition controller: writes the staging partition and flips the boot record
//!
//! Nothing here touches the active partition. The only write that changes
//! what boots is [`PartitionController::switch_active`], a single boot record
//! write.

use std::sync::Arc;
use std::time::Duration;

use inkclock_crypto::{ImageHasher, Sha256Digest};
use inkclock_watchdog::{Watchdog, WatchdogGuard, WatchdogMetrics, WatchdogStatus};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::device::FlashDevice;
use crate::error::{FirmwareUpdateError, Result};
use crate::partition::{BootRecord, Partition, PartitionPhase, PartitionState};
use crate::vault::{BootMetadataBackup, ConfigSnapshot, ConfigVault};

/// Image written to the staging partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    /// Partition holding the image
    pub partition: Partition,
    /// Bytes written
    pub size: u64,
    /// Digest of the bytes written
    pub digest: Sha256Digest,
}

/// Drives one staging write and switch at a time
pub struct PartitionController {
    flash: Arc<dyn FlashDevice>,
    watchdog: Box<dyn Watchdog>,
    block_size: usize,
    watchdog_timeout: Duration,
    verify_after_write: bool,
    phase: PartitionPhase,
}

impl std::fmt::Debug for PartitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionController")
            .field("block_size", &self.block_size)
            .field("watchdog_timeout", &self.watchdog_timeout)
            .field("verify_after_write", &self.verify_after_write)
            .field("phase", &self.phase)
            .field("watchdog", &self.watchdog.status())
            .finish_non_exhaustive()
    }
}

impl PartitionController {
    /// Controller over `flash`, supervised by `watchdog`
    pub fn new(flash: Arc<dyn FlashDevice>, watchdog: Box<dyn Watchdog>, config: &UpdateConfig) -> Self {
        Self {
            flash,
            watchdog,
            block_size: config.block_size.max(1),
            watchdog_timeout: config.watchdog_timeout(),
            verify_after_write: config.verify_after_write,
            phase: PartitionPhase::Idle,
        }
    }

    /// Current phase
    pub fn phase(&self) -> PartitionPhase {
        self.phase
    }

    /// Watchdog status; `Disarmed` whenever no write is running
    pub fn watchdog_status(&self) -> WatchdogStatus {
        self.watchdog.status()
    }

    /// Watchdog lifetime counters
    pub fn watchdog_metrics(&self) -> WatchdogMetrics {
        self.watchdog.metrics()
    }

    /// Active and staging partition from the persisted boot record
    pub async fn state(&self) -> Result<PartitionState> {
        Ok(self.flash.read_boot_record().await?.state())
    }

    /// Return to `Idle` for a new attempt
    pub fn begin(&mut self) {
        if self.phase != PartitionPhase::Idle {
            debug!(from = %self.phase, "partition controller reset");
        }
        self.phase = PartitionPhase::Idle;
    }

    fn enter(&mut self, next: PartitionPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(from = %self.phase, to = %next, "unexpected partition phase transition");
        }
        debug!(from = %self.phase, to = %next, "partition phase");
        self.phase = next;
    }

    fn fail(&mut self, err: FirmwareUpdateError) -> FirmwareUpdateError {
        if !self.phase.is_terminal() {
            error!(phase = %self.phase, error = %err, "partition operation failed");
            self.phase = PartitionPhase::Failed;
        }
        err
    }

    /// Copy the active partition's boot metadata into the vault
    pub async fn backup_boot_metadata(&mut self, vault: &ConfigVault) -> Result<()> {
        self.enter(PartitionPhase::BackingUpPartition);
        match self.copy_boot_metadata(vault).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn copy_boot_metadata(&self, vault: &ConfigVault) -> Result<()> {
        let active = self.flash.read_boot_record().await?.active;
        let data = self.flash.read_boot_metadata(active).await.map_err(|e| {
            FirmwareUpdateError::ConfigBackupFailed(format!("boot metadata of {active}: {e}"))
        })?;
        let backup = BootMetadataBackup::new(active, data);
        vault
            .save_boot_metadata(&backup)
            .await
            .map_err(|e| FirmwareUpdateError::ConfigBackupFailed(e.to_string()))?;
        info!(partition = %active, bytes = backup.data.len(), "boot metadata backed up");
        Ok(())
    }

    /// Stream `size` bytes from `image` into the staging partition.
    ///
    /// The watchdog is armed for the whole write loop and reset after every
    /// block; each block must finish inside the remaining window. `progress`
    /// receives every completed 10 % step. The bytes written must hash to
    /// `expected`, the digest the verifier accepted.
    pub async fn stage_write<R>(
        &mut self,
        image: &mut R,
        size: u64,
        expected: &Sha256Digest,
        snapshot: &ConfigSnapshot,
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<StagedImage>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.enter(PartitionPhase::Writing);
        match self.write_staging(image, size, expected, snapshot, progress).await {
            Ok(staged) => Ok(staged),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn write_staging<R>(
        &mut self,
        image: &mut R,
        size: u64,
        expected: &Sha256Digest,
        snapshot: &ConfigSnapshot,
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<StagedImage>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !ConfigVault::is_valid(snapshot) {
            return Err(FirmwareUpdateError::ConfigBackupFailed(
                "no valid settings snapshot".into(),
            ));
        }
        if size == 0 {
            return Err(FirmwareUpdateError::InvalidManifest("firmware image is empty".into()));
        }

        let record = self.flash.read_boot_record().await?;
        if record.on_probation() {
            return Err(FirmwareUpdateError::OnProbation {
                active: record.active,
            });
        }
        let staging = record.active.other();
        let capacity = self
            .flash
            .partition_capacity(staging)
            .await
            .map_err(|e| FirmwareUpdateError::UpdateWriteFailed(e.to_string()))?;
        if size > capacity {
            return Err(FirmwareUpdateError::UpdateWriteFailed(format!(
                "image of {size} bytes exceeds partition {staging} capacity {capacity}"
            )));
        }
        self.flash
            .erase(staging)
            .await
            .map_err(|e| FirmwareUpdateError::UpdateWriteFailed(format!("erase {staging}: {e}")))?;

        info!(partition = %staging, size, block_size = self.block_size, "writing staging partition");
        let digest = write_blocks(
            self.flash.as_ref(),
            self.watchdog.as_mut(),
            BlockWrite {
                partition: staging,
                size,
                block_size: self.block_size,
                timeout: self.watchdog_timeout,
            },
            image,
            progress,
        )
        .await?;

        if !digest.ct_eq(expected) {
            return Err(FirmwareUpdateError::HashMismatch {
                expected: expected.to_hex(),
                actual: digest.to_hex(),
            });
        }

        if self.verify_after_write {
            self.enter(PartitionPhase::VerifyingWrite);
            let reread = self.hash_partition(staging, size).await?;
            if !reread.ct_eq(expected) {
                return Err(FirmwareUpdateError::UpdateWriteFailed(format!(
                    "read-back of partition {staging} hashes to {reread}"
                )));
            }
            debug!(partition = %staging, "staging read-back verified");
        }

        Ok(StagedImage {
            partition: staging,
            size,
            digest,
        })
    }

    async fn hash_partition(&self, partition: Partition, size: u64) -> Result<Sha256Digest> {
        let mut hasher = ImageHasher::new();
        let mut buf = vec![0u8; self.block_size];
        let mut offset = 0u64;
        while offset < size {
            let want = block_len(self.block_size, size - offset);
            let chunk = buf.get_mut(..want).unwrap_or_default();
            let n = self
                .flash
                .read_block(partition, offset, chunk)
                .await
                .map_err(|e| FirmwareUpdateError::UpdateWriteFailed(format!("read-back: {e}")))?;
            if n == 0 {
                return Err(FirmwareUpdateError::UpdateWriteFailed(format!(
                    "read-back of partition {partition} ended at {offset} of {size}"
                )));
            }
            hasher.update(chunk.get(..n).unwrap_or_default());
            offset += n as u64;
        }
        Ok(hasher.finalize())
    }

    /// Flip the boot record to the staged partition.
    ///
    /// This single atomic write is the point of no return.
    pub async fn switch_active(&mut self, staged: &StagedImage) -> Result<BootRecord> {
        self.enter(PartitionPhase::Switching);
        match self.write_switch(staged).await {
            Ok(record) => {
                self.enter(PartitionPhase::Done);
                Ok(record)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn write_switch(&self, staged: &StagedImage) -> Result<BootRecord> {
        let target = staged.partition;
        let current = self.flash.read_boot_record().await.map_err(|e| {
            FirmwareUpdateError::PartitionSwitchFailed {
                target,
                reason: format!("boot record unreadable: {e}"),
            }
        })?;
        if current.active == target {
            return Err(FirmwareUpdateError::PartitionSwitchFailed {
                target,
                reason: "target is already the active partition".into(),
            });
        }
        let next = current.switched_to(target, staged.digest.to_hex());
        self.flash
            .write_boot_record(&next)
            .await
            .map_err(|e| FirmwareUpdateError::PartitionSwitchFailed {
                target,
                reason: e.to_string(),
            })?;
        info!(from = %current.active, to = %target, sequence = next.sequence, "active partition switched");
        Ok(next)
    }
}

struct BlockWrite {
    partition: Partition,
    size: u64,
    block_size: usize,
    timeout: Duration,
}

fn block_len(block_size: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(block_size, |r| r.min(block_size))
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.saturating_mul(100) / total).unwrap_or(100)
}

async fn write_blocks<R>(
    flash: &dyn FlashDevice,
    watchdog: &mut dyn Watchdog,
    job: BlockWrite,
    image: &mut R,
    progress: &mut (dyn FnMut(u8) + Send),
) -> Result<Sha256Digest>
where
    R: AsyncRead + Unpin + Send,
{
    let mut guard = WatchdogGuard::arm(watchdog, job.timeout)
        .map_err(|e| FirmwareUpdateError::UpdateWriteFailed(format!("watchdog arm: {e}")))?;

    let mut hasher = ImageHasher::new();
    let mut buf = vec![0u8; job.block_size];
    let mut offset = 0u64;
    let mut block = 0u64;
    let mut reported = 0u8;

    while offset < job.size {
        let want = block_len(job.block_size, job.size - offset);
        let chunk = buf.get_mut(..want).unwrap_or_default();

        let step = async {
            image.read_exact(&mut *chunk).await.map_err(|e| {
                FirmwareUpdateError::UpdateWriteFailed(format!("source read at block {block}: {e}"))
            })?;
            flash
                .write_block(job.partition, offset, &*chunk)
                .await
                .map_err(|e| {
                    FirmwareUpdateError::UpdateWriteFailed(format!("block {block} write: {e}"))
                })
        };
        match tokio::time::timeout(guard.time_remaining(), step).await {
            Ok(written) => written?,
            Err(_) => {
                error!(block, offset, "watchdog window elapsed during block write");
                return Err(FirmwareUpdateError::WatchdogTimeout { block });
            }
        }

        hasher.update(chunk);
        guard.reset().map_err(|e| {
            if e.is_expired() {
                FirmwareUpdateError::WatchdogTimeout { block }
            } else {
                FirmwareUpdateError::UpdateWriteFailed(format!("watchdog reset: {e}"))
            }
        })?;

        offset += want as u64;
        block += 1;

        let percent = percent_of(offset, job.size);
        if percent / 10 > reported / 10 {
            reported = percent - percent % 10;
            debug!(percent = reported, block, "write progress");
            progress(reported);
        }
    }

    drop(guard);
    Ok(hasher.finalize())
}
