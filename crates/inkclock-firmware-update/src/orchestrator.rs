//! Update orchestrator
//!
//! Runs one update attempt end to end: manifest, verification, preflight,
//! settings backup, staging write and partition switch. Every failure ends the
//! session in a terminal `Failed` or `Invalid` state and is reported through
//! the returned [`UpdateResult`]; only a second concurrent attempt is turned
//! away with an error.

use std::sync::Arc;
use std::time::Duration;

use inkclock_crypto::digest::secret_eq;
use inkclock_watchdog::Watchdog;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::controller::PartitionController;
use crate::device::{FlashDevice, HeapMonitor, PowerMonitor, SettingsStore, SystemControl};
use crate::error::{ErrorKind, FirmwareUpdateError, Result};
use crate::manifest::{FirmwareManifest, ManifestValidator};
use crate::partition::{Partition, PartitionState};
use crate::preflight::PreflightGuard;
use crate::session::{SourceType, StatusCallback, UpdateSession, UpdateStatus};
use crate::storage::{FileStore, RemovableMedia};
use crate::transport::{FirmwareTransport, sibling_manifest_url};
use crate::vault::ConfigVault;
use crate::verifier::FirmwareVerifier;

/// Largest manifest accepted over the network
pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Collaborators the orchestrator drives
pub struct DeviceParts {
    /// Dual-partition flash
    pub flash: Arc<dyn FlashDevice>,
    /// Watchdog armed around the write loop
    pub watchdog: Box<dyn Watchdog>,
    /// Removable media carrying local updates
    pub media: Arc<dyn RemovableMedia>,
    /// Internal storage for the vault and download staging
    pub store: Arc<dyn FileStore>,
    /// Settings backed up before each attempt
    pub settings: Arc<dyn SettingsStore>,
    /// Supply voltage sensor
    pub power: Arc<dyn PowerMonitor>,
    /// Heap probe
    pub heap: Arc<dyn HeapMonitor>,
    /// Reboot control
    pub system: Arc<dyn SystemControl>,
    /// Network transport; network updates fail without one
    pub transport: Option<Arc<dyn FirmwareTransport>>,
}

/// Outcome of one update attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// Terminal status
    pub status: UpdateStatus,
    /// Image source
    pub source: SourceType,
    /// Failure kind, `None` on success
    pub error: Option<ErrorKind>,
    /// Final status message
    pub message: String,
    /// Active partition before the attempt
    pub previous_partition: Option<Partition>,
    /// Active partition after the attempt
    pub active_partition: Option<Partition>,
    /// Network GETs made, manifest and image combined
    pub download_attempts: u32,
    /// Bytes written to the staging partition
    pub bytes_written: u64,
    /// Wall time of the attempt
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl UpdateResult {
    /// Whether the partition switch happened
    pub fn is_success(&self) -> bool {
        self.status == UpdateStatus::Success
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Debug, Default)]
struct Attempt {
    download_attempts: u32,
    bytes_written: u64,
}

/// Coordinates update attempts from removable media or the network
pub struct UpdateOrchestrator {
    config: UpdateConfig,
    verifier: FirmwareVerifier,
    preflight: PreflightGuard,
    vault: ConfigVault,
    controller: tokio::sync::Mutex<PartitionController>,
    flash: Arc<dyn FlashDevice>,
    media: Arc<dyn RemovableMedia>,
    store: Arc<dyn FileStore>,
    settings: Arc<dyn SettingsStore>,
    system: Arc<dyn SystemControl>,
    transport: Option<Arc<dyn FirmwareTransport>>,
    session: parking_lot::Mutex<UpdateSession>,
    callback: Option<StatusCallback>,
}

impl std::fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("hardware_id", &self.config.hardware_id)
            .field("session", &*self.session.lock())
            .finish_non_exhaustive()
    }
}

impl UpdateOrchestrator {
    /// Orchestrator for `config` over `parts`
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareUpdateError::Config`] if the configuration is invalid.
    pub fn new(config: UpdateConfig, parts: DeviceParts) -> Result<Self> {
        config.validate()?;
        let verifier = FirmwareVerifier::new(config.key_ring()?);
        let preflight = PreflightGuard::new(parts.power, parts.heap, config.power.clone());
        let vault = ConfigVault::new(Arc::clone(&parts.store));
        let controller = PartitionController::new(Arc::clone(&parts.flash), parts.watchdog, &config);
        Ok(Self {
            config,
            verifier,
            preflight,
            vault,
            controller: tokio::sync::Mutex::new(controller),
            flash: parts.flash,
            media: parts.media,
            store: parts.store,
            settings: parts.settings,
            system: parts.system,
            transport: parts.transport,
            session: parking_lot::Mutex::new(UpdateSession::default()),
            callback: None,
        })
    }

    /// Report every status change through `callback`
    #[must_use]
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Current status
    pub fn get_status(&self) -> UpdateStatus {
        self.session.lock().status
    }

    /// Current progress in percent
    pub fn get_progress(&self) -> u8 {
        self.session.lock().progress
    }

    /// Failure of the current or last attempt
    pub fn get_last_error(&self) -> Option<ErrorKind> {
        self.session.lock().last_error
    }

    /// Copy of the session
    pub fn session(&self) -> UpdateSession {
        self.session.lock().clone()
    }

    /// Return a terminal session to `Idle`; returns whether it did
    pub fn acknowledge(&self) -> bool {
        let mut session = self.session.lock();
        if !session.status.is_terminal() {
            return false;
        }
        *session = UpdateSession::default();
        true
    }

    /// Active and staging partition
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareUpdateError::Device`] if the boot record is unreadable.
    pub async fn partition_state(&self) -> Result<PartitionState> {
        Ok(self.flash.read_boot_record().await?.state())
    }

    /// Check a bearer token against the configured key.
    ///
    /// An empty configured key disables the check. A `Bearer ` prefix is
    /// accepted and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareUpdateError::Unauthorized`] on a missing or wrong token.
    pub fn verify_authorization(&self, token: Option<&str>) -> Result<()> {
        if !self.config.authorization_required() {
            return Ok(());
        }
        let presented = bearer_value(token).unwrap_or_default();
        if secret_eq(presented.as_bytes(), self.config.auth_key.as_bytes()) {
            return Ok(());
        }
        warn!("network update rejected: bad authorization token");
        Err(FirmwareUpdateError::Unauthorized)
    }

    /// Install `firmware.bin` from removable media.
    ///
    /// The media is mounted for the attempt and released on every path. The
    /// attempt is refused while the running firmware is still on probation.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareUpdateError::UpdateInProgress`] if another attempt is
    /// running. Every other failure is reported in the result.
    pub async fn check_local_media(&self) -> Result<UpdateResult> {
        let Ok(mut controller) = self.controller.try_lock() else {
            warn!("local media update refused: update already in progress");
            return Err(FirmwareUpdateError::UpdateInProgress);
        };
        let started = Instant::now();
        let previous = self.current_active().await;
        self.begin_session(SourceType::LocalMedia, "checking local media");

        let mut attempt = Attempt::default();
        let result = self.run_local(&mut controller, &mut attempt).await;
        Ok(self
            .finish(SourceType::LocalMedia, result, attempt, previous, started)
            .await)
    }

    async fn run_local(
        &self,
        controller: &mut PartitionController,
        attempt: &mut Attempt,
    ) -> Result<Partition> {
        self.ensure_validated().await?;
        self.media
            .mount()
            .await
            .map_err(|e| FirmwareUpdateError::FileNotFound(format!("media unavailable: {e}")))?;
        debug!("local media mounted");
        let result = self.install_from_media(controller, attempt).await;
        if let Err(e) = self.media.unmount().await {
            warn!(error = %e, "failed to release local media");
        }
        result
    }

    async fn install_from_media(
        &self,
        controller: &mut PartitionController,
        attempt: &mut Attempt,
    ) -> Result<Partition> {
        let media = self.media.as_ref();
        let manifest_path = &self.config.media.manifest_path;
        let image_path = &self.config.media.image_path;

        let manifest_bytes = media.read_all(manifest_path).await.map_err(|e| {
            FirmwareUpdateError::FileNotFound(format!("{manifest_path}: {e}"))
        })?;
        if !media.exists(image_path).await? {
            return Err(FirmwareUpdateError::FileNotFound(image_path.clone()));
        }
        let manifest = self.validate_manifest(&manifest_bytes)?;
        let source_len = media.len(image_path).await?;
        self.install(controller, media, image_path, &manifest, source_len, attempt)
            .await
    }

    /// Download an image from `url` and install it.
    ///
    /// The manifest is fetched from the same directory as the image. The
    /// manifest and the image each get up to `download.max_attempts`
    /// requests; a stalled or short body counts as a failed attempt and a
    /// partial image file is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`FirmwareUpdateError::UpdateInProgress`] if another attempt is
    /// running. Every other failure is reported in the result.
    pub async fn start_network_update(
        &self,
        url: &str,
        auth_token: Option<&str>,
    ) -> Result<UpdateResult> {
        let Ok(mut controller) = self.controller.try_lock() else {
            warn!(url, "network update refused: update already in progress");
            return Err(FirmwareUpdateError::UpdateInProgress);
        };
        let started = Instant::now();
        let previous = self.current_active().await;
        self.begin_session(SourceType::Network, format!("checking {url}"));

        let mut attempt = Attempt::default();
        let result = self
            .run_network(&mut controller, url, auth_token, &mut attempt)
            .await;
        Ok(self
            .finish(SourceType::Network, result, attempt, previous, started)
            .await)
    }

    async fn run_network(
        &self,
        controller: &mut PartitionController,
        url: &str,
        auth_token: Option<&str>,
        attempt: &mut Attempt,
    ) -> Result<Partition> {
        self.verify_authorization(auth_token)?;
        self.ensure_validated().await?;
        let transport = self.transport.as_deref().ok_or_else(|| {
            FirmwareUpdateError::DownloadFailed {
                attempts: 0,
                reason: "no network transport configured".into(),
            }
        })?;
        let bearer = bearer_value(auth_token);

        let manifest_url = sibling_manifest_url(url, &self.config.media.manifest_path);
        let manifest_bytes = self
            .fetch_manifest(transport, &manifest_url, bearer, attempt)
            .await?;
        let manifest = self.validate_manifest(&manifest_bytes)?;

        let staging_path = self.config.download.staging_path.as_str();
        let result = async {
            let len = self
                .download_with_retries(transport, url, bearer, attempt)
                .await?;
            self.install(controller, self.store.as_ref(), staging_path, &manifest, len, attempt)
                .await
        }
        .await;

        match self.store.remove(staging_path).await {
            Ok(true) => debug!(path = staging_path, "download staging file removed"),
            Ok(false) => {}
            Err(e) => warn!(path = staging_path, error = %e, "failed to remove download staging file"),
        }
        result
    }

    /// Refuse to overwrite the last known-good image while the running
    /// firmware has not been marked valid
    async fn ensure_validated(&self) -> Result<()> {
        let record = self.flash.read_boot_record().await?;
        if record.on_probation() {
            warn!(
                active = %record.active,
                boot_attempts = record.boot_attempts,
                "update refused: running firmware is on probation"
            );
            return Err(FirmwareUpdateError::OnProbation {
                active: record.active,
            });
        }
        Ok(())
    }

    async fn fetch_manifest(
        &self,
        transport: &dyn FirmwareTransport,
        url: &str,
        bearer: Option<&str>,
        attempt: &mut Attempt,
    ) -> Result<Vec<u8>> {
        let max_attempts = self.config.download.max_attempts;
        let mut last_failure = String::new();
        for n in 1..=max_attempts {
            attempt.download_attempts += 1;
            match self.fetch_manifest_once(transport, url, bearer).await? {
                Ok(bytes) => {
                    debug!(attempt = n, bytes = bytes.len(), "manifest fetched");
                    return Ok(bytes);
                }
                Err(reason) => {
                    warn!(attempt = n, max_attempts, %reason, "manifest fetch failed");
                    last_failure = reason;
                }
            }
        }
        Err(FirmwareUpdateError::DownloadFailed {
            attempts: max_attempts,
            reason: format!("manifest {url}: {last_failure}"),
        })
    }

    /// One manifest GET; the inner error is a retryable failure
    async fn fetch_manifest_once(
        &self,
        transport: &dyn FirmwareTransport,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<std::result::Result<Vec<u8>, String>> {
        let timeout = self.config.download.read_timeout();
        let mut download = match tokio::time::timeout(timeout, transport.get(url, bearer)).await {
            Err(_) => return Ok(Err(format!("no response within {} ms", timeout.as_millis()))),
            Ok(Err(e)) => return Ok(Err(e.to_string())),
            Ok(Ok(download)) => download,
        };

        let mut bytes = Vec::new();
        loop {
            let chunk = match tokio::time::timeout(timeout, download.body.next_chunk()).await {
                Err(_) => {
                    return Ok(Err(format!(
                        "no data for {} ms after {} bytes",
                        timeout.as_millis(),
                        bytes.len()
                    )));
                }
                Ok(Err(e)) => return Ok(Err(e.to_string())),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > MAX_MANIFEST_BYTES {
                return Err(FirmwareUpdateError::InvalidManifest(format!(
                    "manifest exceeds {MAX_MANIFEST_BYTES} bytes"
                )));
            }
        }

        if let Some(total) = download.content_length
            && bytes.len() as u64 != total
        {
            return Ok(Err(format!("body ended after {} of {total} bytes", bytes.len())));
        }
        Ok(Ok(bytes))
    }

    async fn download_with_retries(
        &self,
        transport: &dyn FirmwareTransport,
        url: &str,
        bearer: Option<&str>,
        attempt: &mut Attempt,
    ) -> Result<u64> {
        let max_attempts = self.config.download.max_attempts;
        let staging_path = self.config.download.staging_path.as_str();
        self.set_status(UpdateStatus::Downloading, 0, format!("downloading {url}"));

        let mut last_failure = String::new();
        for n in 1..=max_attempts {
            attempt.download_attempts += 1;
            match self.download_once(transport, url, bearer, staging_path).await {
                Ok(len) => {
                    info!(attempt = n, bytes = len, "download complete");
                    return Ok(len);
                }
                Err(reason) => {
                    warn!(attempt = n, max_attempts, %reason, "download attempt failed");
                    if let Err(e) = self.store.remove(staging_path).await {
                        warn!(error = %e, "failed to remove partial download");
                    }
                    last_failure = reason;
                }
            }
        }
        Err(FirmwareUpdateError::DownloadFailed {
            attempts: max_attempts,
            reason: last_failure,
        })
    }

    async fn download_once(
        &self,
        transport: &dyn FirmwareTransport,
        url: &str,
        bearer: Option<&str>,
        staging_path: &str,
    ) -> std::result::Result<u64, String> {
        let timeout = self.config.download.read_timeout();
        let mut download = tokio::time::timeout(timeout, transport.get(url, bearer))
            .await
            .map_err(|_| format!("no response within {} ms", timeout.as_millis()))?
            .map_err(|e| e.to_string())?;
        let declared = download.content_length;
        let mut file = self
            .store
            .create(staging_path)
            .await
            .map_err(|e| format!("staging file: {e}"))?;

        let mut received = 0u64;
        let mut reported = 0u8;
        loop {
            let chunk = match tokio::time::timeout(timeout, download.body.next_chunk()).await {
                Err(_) => {
                    return Err(format!(
                        "no data for {} ms after {received} bytes",
                        timeout.as_millis()
                    ));
                }
                Ok(Err(e)) => return Err(e.to_string()),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("staging write: {e}"))?;
            received += chunk.len() as u64;

            if let Some(total) = declared.filter(|total| *total > 0) {
                let percent = u8::try_from(received.saturating_mul(100) / total).unwrap_or(100);
                if percent / 10 > reported / 10 {
                    reported = percent - percent % 10;
                    debug!(percent = reported, received, "download progress");
                    self.set_status(UpdateStatus::Downloading, reported, format!("downloaded {reported}%"));
                }
            }
        }
        file.shutdown()
            .await
            .map_err(|e| format!("staging flush: {e}"))?;

        if let Some(total) = declared
            && received != total
        {
            return Err(format!("body ended after {received} of {total} bytes"));
        }
        if received == 0 {
            return Err("empty response body".into());
        }
        Ok(received)
    }

    fn validate_manifest(&self, bytes: &[u8]) -> Result<FirmwareManifest> {
        ManifestValidator::validate(bytes, &self.config.hardware_id).inspect_err(|e| {
            if e.kind() == ErrorKind::HardwareMismatch {
                self.report_error(e, "firmware does not support this hardware");
            }
        })
    }

    async fn install<S>(
        &self,
        controller: &mut PartitionController,
        source: &S,
        image_path: &str,
        manifest: &FirmwareManifest,
        source_len: u64,
        attempt: &mut Attempt,
    ) -> Result<Partition>
    where
        S: FileStore + ?Sized,
    {
        let size = manifest.resolve_size(source_len)?;

        self.set_status(UpdateStatus::Checking, 0, "verifying image");
        let reader = source
            .open(image_path)
            .await
            .map_err(|e| FirmwareUpdateError::FileNotFound(format!("{image_path}: {e}")))?;
        let verified = self
            .verifier
            .verify(reader, manifest)
            .await
            .inspect_err(|e| self.report_error(e, "image rejected"))?;
        if verified.size != size {
            return Err(FirmwareUpdateError::SizeMismatch {
                expected: size,
                actual: verified.size,
            });
        }
        self.set_status(UpdateStatus::Checking, 0, format!("image verified, signed by {}", verified.signer));

        self.set_status(UpdateStatus::Updating, 0, "checking power and memory");
        self.preflight
            .run(self.config.memory_required_bytes)
            .await
            .inspect_err(|e| self.report_error(e, "preflight failed"))?;
        self.set_status(UpdateStatus::Updating, 0, "preflight passed");

        let settings = self
            .settings
            .export()
            .await
            .map_err(|e| FirmwareUpdateError::ConfigBackupFailed(format!("settings export: {e}")))?;
        let active = controller.state().await?.active;
        let snapshot = self.vault.backup(settings, active).await?;

        controller.begin();
        if self.config.backup_boot_metadata {
            controller.backup_boot_metadata(&self.vault).await?;
        }

        let mut image = source
            .open(image_path)
            .await
            .map_err(|e| FirmwareUpdateError::FileNotFound(format!("{image_path}: {e}")))?;
        let staged = controller
            .stage_write(&mut image, size, &verified.digest, &snapshot, &mut |percent| {
                self.set_status(UpdateStatus::Updating, percent, format!("written {percent}%"));
            })
            .await?;
        attempt.bytes_written = staged.size;

        let record = controller.switch_active(&staged).await?;
        self.set_status(
            UpdateStatus::Updating,
            100,
            format!("switched active partition to {}", record.active),
        );
        Ok(record.active)
    }

    async fn finish(
        &self,
        source: SourceType,
        result: Result<Partition>,
        attempt: Attempt,
        previous: Option<Partition>,
        started: Instant,
    ) -> UpdateResult {
        let (status, error, message, active) = match result {
            Ok(active) => {
                info!(?source, %active, "firmware update succeeded");
                (
                    UpdateStatus::Success,
                    None,
                    format!("firmware installed to partition {active}"),
                    Some(active),
                )
            }
            Err(err) => {
                error!(?source, error = %err, "firmware update failed");
                (
                    err.terminal_status(),
                    Some(err.kind()),
                    err.to_string(),
                    self.current_active().await,
                )
            }
        };

        {
            let mut session = self.session.lock();
            session.status = status;
            session.last_error = error;
            session.message.clone_from(&message);
            if status == UpdateStatus::Success {
                session.progress = 100;
            }
        }
        self.emit();

        if status == UpdateStatus::Success && self.config.reboot_on_success {
            if let Err(e) = self.system.reboot().await {
                warn!(error = %e, "reboot request failed");
            }
        } else if error == Some(ErrorKind::WatchdogTimeout) {
            warn!("watchdog expired during flashing, resetting device");
            if let Err(e) = self.system.hard_reset().await {
                error!(error = %e, "hard reset request failed");
            }
        }

        UpdateResult {
            status,
            source,
            error,
            message,
            previous_partition: previous,
            active_partition: active,
            download_attempts: attempt.download_attempts,
            bytes_written: attempt.bytes_written,
            duration: started.elapsed(),
        }
    }

    async fn current_active(&self) -> Option<Partition> {
        match self.flash.read_boot_record().await {
            Ok(record) => Some(record.active),
            Err(e) => {
                warn!(error = %e, "boot record unreadable");
                None
            }
        }
    }

    fn begin_session(&self, source: SourceType, message: impl Into<String>) {
        {
            let mut session = self.session.lock();
            *session = UpdateSession::start(source);
            session.message = message.into();
        }
        info!(?source, "update check started");
        self.emit();
    }

    fn set_status(&self, status: UpdateStatus, progress: u8, message: impl Into<String>) {
        {
            let mut session = self.session.lock();
            session.status = status;
            session.progress = progress.min(100);
            session.message = message.into();
        }
        self.emit();
    }

    fn report_error(&self, err: &FirmwareUpdateError, context: &str) {
        {
            let mut session = self.session.lock();
            session.last_error = Some(err.kind());
            session.message = format!("{context}: {err}");
        }
        self.emit();
    }

    fn emit(&self) {
        let Some(callback) = &self.callback else {
            return;
        };
        let event = self.session.lock().event();
        callback(&event);
    }
}

fn bearer_value(token: Option<&str>) -> Option<&str> {
    token
        .map(str::trim)
        .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).trim())
        .filter(|t| !t.is_empty())
}
