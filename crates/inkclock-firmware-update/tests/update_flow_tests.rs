//! Integration tests for the update lifecycle

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use inkclock_crypto::{Ed25519Signer, KeyPair, Sha256Digest, TrustedKeyConfig};
use inkclock_firmware_update::prelude::*;
use inkclock_firmware_update::vault::SNAPSHOT_PATH;
use inkclock_watchdog::SoftwareWatchdog;
use tokio::sync::Mutex;

const IMAGE_URL: &str = "https://ota.inkclock.example/fw/firmware.bin";
const MANIFEST_URL: &str = "https://ota.inkclock.example/fw/firmware_info.json";
const CAPACITY: u64 = 64 * 1024;

/// Settings store whose next exports can be made to fail
struct FlakySettings {
    values: Mutex<BTreeMap<String, String>>,
    failing_exports: Mutex<u32>,
}

impl FlakySettings {
    fn new() -> Self {
        Self {
            values: Mutex::new(BTreeMap::from([(
                "display.refresh".to_string(),
                "15m".to_string(),
            )])),
            failing_exports: Mutex::new(0),
        }
    }

    async fn fail_next_exports(&self, count: u32) {
        *self.failing_exports.lock().await = count;
    }
}

#[async_trait::async_trait]
impl SettingsStore for FlakySettings {
    async fn export(&self) -> std::result::Result<BTreeMap<String, String>, DeviceError> {
        let mut failing = self.failing_exports.lock().await;
        if *failing > 0 {
            *failing -= 1;
            return Err(DeviceError::fault("settings partition busy"));
        }
        Ok(self.values.lock().await.clone())
    }

    async fn import(&self, settings: &BTreeMap<String, String>) -> std::result::Result<(), DeviceError> {
        *self.values.lock().await = settings.clone();
        Ok(())
    }
}

struct Fixture {
    flash: Arc<MemoryFlash>,
    media: Arc<MemoryStore>,
    store: Arc<MemoryStore>,
    settings: Arc<dyn SettingsStore>,
    power: Arc<StaticPower>,
    system: Arc<RecordingSystem>,
    transport: Arc<ScriptedTransport>,
    keypair: KeyPair,
    config: UpdateConfig,
    events: Arc<parking_lot::Mutex<Vec<StatusEvent>>>,
}

impl Fixture {
    fn new() -> Self {
        let keypair = KeyPair::generate("release");
        let config = UpdateConfig {
            block_size: 1024,
            watchdog_timeout_ms: 1000,
            trusted_keys: vec![TrustedKeyConfig {
                id: "release".to_string(),
                public_key: keypair.public_key.to_base64(),
                comment: None,
            }],
            ..UpdateConfig::default()
        };
        Self {
            flash: Arc::new(MemoryFlash::new(CAPACITY)),
            media: Arc::new(MemoryStore::removable()),
            store: Arc::new(MemoryStore::new()),
            settings: Arc::new(MemorySettings::new(BTreeMap::from([(
                "wifi.ssid".to_string(),
                "home".to_string(),
            )]))),
            power: Arc::new(StaticPower::new(3700)),
            system: Arc::new(RecordingSystem::new()),
            transport: Arc::new(ScriptedTransport::new()),
            keypair,
            config,
            events: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    fn orchestrator(&self) -> Result<UpdateOrchestrator> {
        let parts = DeviceParts {
            flash: self.flash.clone(),
            watchdog: Box::new(SoftwareWatchdog::with_default_timeout()),
            media: self.media.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
            power: self.power.clone(),
            heap: Arc::new(StaticHeap::new(Some(4 << 20))),
            system: self.system.clone(),
            transport: Some(self.transport.clone() as Arc<dyn FirmwareTransport>),
        };
        let sink = self.events.clone();
        Ok(UpdateOrchestrator::new(self.config.clone(), parts)?
            .with_status_callback(Box::new(move |event: &StatusEvent| sink.lock().push(event.clone()))))
    }

    fn manifest_for(&self, image: &[u8], hardware: &[&str]) -> Result<String> {
        let digest = Sha256Digest::of(image);
        let manifest = FirmwareManifest {
            supported_hardware_ids: hardware.iter().map(|h| h.to_string()).collect::<BTreeSet<_>>(),
            image_size: Some(image.len() as u64),
            expected_hash_hex: digest.to_hex(),
            signature: Ed25519Signer::sign_digest(&digest, &self.keypair.signing_key),
            public_key_ref: "release".to_string(),
            version: Some("2.0.0".to_string()),
        };
        Ok(manifest.to_json()?)
    }

    fn put_on_media(&self, image: &[u8], hardware: &[&str]) -> Result<()> {
        self.media.insert("firmware.bin", image.to_vec());
        self.media.insert("firmware_info.json", self.manifest_for(image, hardware)?);
        Ok(())
    }

    fn publish(&self, image: &[u8]) -> Result<()> {
        self.transport
            .serve(MANIFEST_URL, self.manifest_for(image, &["ESP32"])?.into_bytes());
        Ok(())
    }

    fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

mod local_media {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_switches_partition() -> Result<()> {
        let fx = Fixture::new();
        let firmware = image(20_000);
        fx.put_on_media(&firmware, &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.previous_partition, Some(Partition::A));
        assert_eq!(result.active_partition, Some(Partition::B));
        assert_eq!(result.bytes_written, 20_000);
        assert_eq!(orchestrator.get_status(), UpdateStatus::Success);
        assert_eq!(orchestrator.get_progress(), 100);
        assert_eq!(orchestrator.get_last_error(), None);

        let record = fx.flash.boot_record();
        assert_eq!(record.active, Partition::B);
        assert!(record.pending_verify);
        assert_eq!(
            fx.flash.partition_bytes(Partition::B).get(..20_000),
            Some(firmware.as_slice())
        );
        assert_eq!(fx.flash.bytes_written(Partition::A), 0);
        assert!(fx.store.contains(SNAPSHOT_PATH));
        assert_eq!(fx.system.reboots(), 1);
        assert_eq!(fx.media.mount_counts(), (1, 1));

        let writes: Vec<u8> = fx
            .events()
            .iter()
            .filter(|e| e.status == UpdateStatus::Updating && e.message.starts_with("written"))
            .map(|e| e.progress)
            .collect();
        assert_eq!(writes, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(fx.events().last().map(|e| e.status), Some(UpdateStatus::Success));

        assert!(orchestrator.acknowledge());
        assert_eq!(orchestrator.get_status(), UpdateStatus::Idle);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_hardware_is_invalid_without_mutation() -> Result<()> {
        let fx = Fixture::new();
        fx.put_on_media(&image(8192), &["ESP8266"])?;
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert_eq!(result.status, UpdateStatus::Invalid);
        assert_eq!(result.error, Some(ErrorKind::HardwareMismatch));
        assert_eq!(fx.flash.total_bytes_written(), 0);
        assert_eq!(fx.flash.record_writes(), 0);
        assert_eq!(fx.power.reads(), 0);
        assert!(!fx.store.contains(SNAPSHOT_PATH));
        assert_eq!(fx.media.mount_counts(), (1, 1));
        assert!(fx
            .events()
            .iter()
            .any(|e| e.error == Some(ErrorKind::HardwareMismatch) && e.status == UpdateStatus::Checking));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_mismatch_leaves_partitions_unchanged() -> Result<()> {
        let fx = Fixture::new();
        let before = fx.flash.boot_record();
        let signed = image(4096);
        let mut tampered = signed.clone();
        if let Some(byte) = tampered.get_mut(2000) {
            *byte ^= 0xFF;
        }
        fx.media.insert("firmware_info.json", fx.manifest_for(&signed, &["ESP32"])?);
        fx.media.insert("firmware.bin", tampered);
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::HashMismatch));
        assert_eq!(fx.flash.boot_record(), before);
        assert_eq!(fx.flash.total_bytes_written(), 0);
        assert_eq!(orchestrator.get_last_error(), Some(ErrorKind::HashMismatch));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stable_power_fails_before_backup() -> Result<()> {
        let mut fx = Fixture::new();
        fx.power = Arc::new(StaticPower::new(3100));
        fx.put_on_media(&image(4096), &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::InsufficientPower));
        assert_eq!(fx.power.reads(), 5);
        assert!(!fx.store.contains(SNAPSHOT_PATH));
        assert_eq!(fx.flash.total_bytes_written(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_hard_resets_into_old_partition() -> Result<()> {
        let fx = Fixture::new();
        fx.flash.set_write_delay(Duration::from_secs(2));
        fx.put_on_media(&image(4096), &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::WatchdogTimeout));
        assert_eq!(fx.system.hard_resets(), 1);
        assert_eq!(fx.system.reboots(), 0);
        assert_eq!(fx.flash.power_cycle().active, Partition::A);
        assert_eq!(fx.flash.record_writes(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_image_is_file_not_found() -> Result<()> {
        let fx = Fixture::new();
        fx.media.insert("firmware_info.json", fx.manifest_for(&image(10), &["ESP32"])?);
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert_eq!(result.error, Some(ErrorKind::FileNotFound));
        assert_eq!(result.status, UpdateStatus::Failed);
        assert!(!fx.media.is_mounted());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_export_failure_aborts() -> Result<()> {
        let mut fx = Fixture::new();
        let settings = Arc::new(FlakySettings::new());
        settings.fail_next_exports(1).await;
        fx.settings = settings.clone();
        fx.put_on_media(&image(4096), &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;
        assert_eq!(result.error, Some(ErrorKind::ConfigBackupFailed));
        assert_eq!(fx.flash.total_bytes_written(), 0);

        assert!(orchestrator.acknowledge());
        let retry = orchestrator.check_local_media().await?;
        assert!(retry.is_success(), "{retry:?}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_record_write_failure_keeps_active() -> Result<()> {
        let fx = Fixture::new();
        fx.flash.fail_record_writes(true);
        fx.put_on_media(&image(4096), &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.check_local_media().await?;

        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::PartitionSwitchFailed));
        assert_eq!(result.active_partition, Some(Partition::A));
        assert_eq!(fx.flash.boot_record().active, Partition::A);
        assert!(!fx.flash.boot_record().pending_verify);
        assert_eq!(fx.system.reboots(), 0);
        let last = fx.events().last().cloned();
        assert_eq!(last.as_ref().map(|e| e.status), Some(UpdateStatus::Failed));
        assert_eq!(
            last.and_then(|e| e.error),
            Some(ErrorKind::PartitionSwitchFailed)
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_refused_until_firmware_marked_valid() -> Result<()> {
        let fx = Fixture::new();
        let known_good = image(4096);
        fx.flash.load_partition(Partition::A, known_good.clone());
        fx.put_on_media(&image(6000), &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;
        assert!(orchestrator.check_local_media().await?.is_success());
        assert!(orchestrator.acknowledge());

        let record = fx.flash.boot_record();
        let snapshot = fx.store.get(SNAPSHOT_PATH);
        fx.put_on_media(&image(5000), &["ESP32"])?;

        let refused = orchestrator.check_local_media().await?;

        assert_eq!(refused.status, UpdateStatus::Failed);
        assert_eq!(refused.error, Some(ErrorKind::UpdateInProgress));
        assert!(refused.message.contains("on probation"));
        assert_eq!(fx.flash.boot_record(), record);
        assert_eq!(fx.flash.bytes_written(Partition::A), 0);
        assert_eq!(
            fx.flash.partition_bytes(Partition::A).get(..4096),
            Some(known_good.as_slice())
        );
        assert_eq!(fx.store.get(SNAPSHOT_PATH), snapshot);
        assert_eq!(fx.media.mount_counts(), (1, 1));

        let mut boot = RollbackController::new(
            fx.flash.clone(),
            fx.store.clone(),
            fx.settings.clone(),
            fx.system.clone(),
            fx.config.rollback.clone(),
        );
        boot.mark_valid().await?;
        assert!(orchestrator.acknowledge());

        let next = orchestrator.check_local_media().await?;
        assert!(next.is_success(), "{next:?}");
        assert_eq!(fx.flash.boot_record().active, Partition::A);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_is_refused_while_running() -> Result<()> {
        let fx = Fixture::new();
        fx.put_on_media(&image(4096), &["ESP32"])?;
        let orchestrator = fx.orchestrator()?;

        let (first, second) = tokio::join!(
            orchestrator.check_local_media(),
            orchestrator.check_local_media()
        );

        assert!(first?.is_success());
        assert!(matches!(second, Err(FirmwareUpdateError::UpdateInProgress)));
        Ok(())
    }
}

mod network {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_two_timeouts_then_success() -> Result<()> {
        let fx = Fixture::new();
        let firmware = image(12_000);
        fx.publish(&firmware)?;
        for _ in 0..2 {
            fx.transport.respond(
                IMAGE_URL,
                ScriptedResponse::Stall {
                    data: firmware.clone(),
                    sent: 3000,
                },
            );
        }
        fx.transport.serve(IMAGE_URL, firmware.clone());
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.start_network_update(IMAGE_URL, None).await?;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.download_attempts, 4);
        assert_eq!(fx.transport.requests_for(MANIFEST_URL), 1);
        assert_eq!(fx.transport.requests_for(IMAGE_URL), 3);
        assert!(!fx.store.contains("firmware_download.bin"));
        assert_eq!(fx.flash.boot_record().active, Partition::B);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_manifest_is_retried() -> Result<()> {
        let fx = Fixture::new();
        let firmware = image(6000);
        let manifest = fx.manifest_for(&firmware, &["ESP32"])?.into_bytes();
        fx.transport.respond(
            MANIFEST_URL,
            ScriptedResponse::Stall {
                data: manifest.clone(),
                sent: 16,
            },
        );
        fx.transport.serve(MANIFEST_URL, manifest);
        fx.transport.serve(IMAGE_URL, firmware);
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.start_network_update(IMAGE_URL, None).await?;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(fx.transport.requests_for(MANIFEST_URL), 2);
        assert_eq!(fx.transport.requests_for(IMAGE_URL), 1);
        assert_eq!(result.download_attempts, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_manifest_exhausts_attempts() -> Result<()> {
        let fx = Fixture::new();
        fx.transport.serve(IMAGE_URL, image(2048));
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.start_network_update(IMAGE_URL, None).await?;

        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::DownloadFailed));
        assert_eq!(fx.transport.requests_for(MANIFEST_URL), 3);
        assert_eq!(fx.transport.requests_for(IMAGE_URL), 0);
        assert_eq!(result.download_attempts, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_bodies_exhaust_attempts() -> Result<()> {
        let fx = Fixture::new();
        let firmware = image(12_000);
        fx.publish(&firmware)?;
        for _ in 0..3 {
            fx.transport.respond(
                IMAGE_URL,
                ScriptedResponse::Truncated {
                    data: firmware.clone(),
                    sent: 5000,
                },
            );
        }
        let orchestrator = fx.orchestrator()?;

        let result = orchestrator.start_network_update(IMAGE_URL, None).await?;

        assert_eq!(result.status, UpdateStatus::Failed);
        assert_eq!(result.error, Some(ErrorKind::DownloadFailed));
        assert_eq!(result.download_attempts, 4);
        assert_eq!(fx.transport.requests_for(IMAGE_URL), 3);
        assert!(!fx.store.contains("firmware_download.bin"));
        assert_eq!(fx.flash.total_bytes_written(), 0);
        assert!(!fx.store.contains(SNAPSHOT_PATH));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization() -> Result<()> {
        let mut fx = Fixture::new();
        fx.config.auth_key = "s3cret".to_string();
        let firmware = image(2048);
        fx.publish(&firmware)?;
        fx.transport.serve(IMAGE_URL, firmware);
        let orchestrator = fx.orchestrator()?;

        let denied = orchestrator
            .start_network_update(IMAGE_URL, Some("Bearer wrong"))
            .await?;
        assert_eq!(denied.error, Some(ErrorKind::Unauthorized));
        let missing = orchestrator.start_network_update(IMAGE_URL, None).await?;
        assert_eq!(missing.error, Some(ErrorKind::Unauthorized));
        assert_eq!(fx.transport.requests_for(IMAGE_URL), 0);

        let allowed = orchestrator
            .start_network_update(IMAGE_URL, Some("Bearer s3cret"))
            .await?;
        assert!(allowed.is_success(), "{allowed:?}");
        assert!(fx
            .transport
            .bearers()
            .iter()
            .all(|b| b.as_deref() == Some("s3cret")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_transport_fails_download() -> Result<()> {
        let fx = Fixture::new();
        let parts = DeviceParts {
            flash: fx.flash.clone(),
            watchdog: Box::new(SoftwareWatchdog::with_default_timeout()),
            media: fx.media.clone(),
            store: fx.store.clone(),
            settings: fx.settings.clone(),
            power: fx.power.clone(),
            heap: Arc::new(StaticHeap::new(Some(4 << 20))),
            system: fx.system.clone(),
            transport: None,
        };
        let orchestrator = UpdateOrchestrator::new(fx.config.clone(), parts)?;
        let result = orchestrator.start_network_update(IMAGE_URL, None).await?;
        assert_eq!(result.error, Some(ErrorKind::DownloadFailed));
        Ok(())
    }
}

mod boot {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bad_update_rolls_back_with_settings() -> Result<()> {
        let fx = Fixture::new();
        fx.put_on_media(&image(6000), &["ESP32"])?;
        let result = fx.orchestrator()?.check_local_media().await?;
        assert!(result.is_success());

        fx.settings
            .import(&BTreeMap::from([("wifi.ssid".to_string(), "broken".to_string())]))
            .await?;

        let rollback_config = fx.config.rollback.clone();
        for attempt in 1..=rollback_config.max_boot_attempts {
            let mut boot = RollbackController::new(
                fx.flash.clone(),
                fx.store.clone(),
                fx.settings.clone(),
                fx.system.clone(),
                rollback_config.clone(),
            );
            assert_eq!(boot.run_boot_check().await?, BootAction::OnProbation { attempt });
        }

        let mut boot = RollbackController::new(
            fx.flash.clone(),
            fx.store.clone(),
            fx.settings.clone(),
            fx.system.clone(),
            rollback_config,
        );
        assert_eq!(boot.run_boot_check().await?, BootAction::RollbackRequired);

        let status = boot.status().await?;
        assert_eq!(status.active, Partition::A);
        assert!(!status.on_probation);
        assert!(!status.snapshot_present);
        assert_eq!(
            fx.settings.export().await?.get("wifi.ssid").map(String::as_str),
            Some("home")
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_update_is_kept() -> Result<()> {
        let mut fx = Fixture::new();
        fx.config.rollback.grace_iterations = 10;
        fx.put_on_media(&image(6000), &["ESP32"])?;
        assert!(fx.orchestrator()?.check_local_media().await?.is_success());

        let mut boot = RollbackController::new(
            fx.flash.clone(),
            fx.store.clone(),
            fx.settings.clone(),
            fx.system.clone(),
            fx.config.rollback.clone(),
        );
        assert_eq!(boot.run_boot_check().await?, BootAction::OnProbation { attempt: 1 });
        let mut validated = false;
        for _ in 0..10 {
            validated |= boot.record_healthy_iteration().await?;
        }
        assert!(validated);
        assert!(!boot.is_rollback_needed().await?);
        assert_eq!(boot.run_boot_check().await?, BootAction::Continue);
        assert_eq!(fx.flash.boot_record().active, Partition::B);
        assert!(!fx.store.contains(SNAPSHOT_PATH));
        Ok(())
    }
}

mod directory_backed {
    use super::*;

    #[tokio::test]
    async fn test_update_on_directory_device() -> Result<()> {
        let device = tempfile::tempdir()?;
        let sd = tempfile::tempdir()?;
        let fx = Fixture::new();
        let firmware = image(9000);
        std::fs::write(sd.path().join("firmware.bin"), &firmware)?;
        std::fs::write(
            sd.path().join("firmware_info.json"),
            fx.manifest_for(&firmware, &["esp32"])?,
        )?;

        let flash = Arc::new(DirectoryFlash::new(device.path(), CAPACITY));
        let parts = DeviceParts {
            flash: flash.clone(),
            watchdog: Box::new(SoftwareWatchdog::with_default_timeout()),
            media: Arc::new(DirectoryStore::removable(sd.path())),
            store: Arc::new(DirectoryStore::new(device.path())),
            settings: Arc::new(JsonFileSettings::new(device.path().join("settings.json"))),
            power: fx.power.clone(),
            heap: Arc::new(StaticHeap::new(Some(4 << 20))),
            system: fx.system.clone(),
            transport: None,
        };
        let orchestrator = UpdateOrchestrator::new(fx.config.clone(), parts)?;

        let result = orchestrator.check_local_media().await?;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(flash.read_boot_record().await?.active, Partition::B);
        let written = std::fs::read(flash.partition_path(Partition::B))?;
        assert_eq!(written, firmware);
        assert!(device.path().join("vault/config_snapshot.json").exists());
        Ok(())
    }
}
