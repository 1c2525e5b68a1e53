//! Host-side device assembly for directory-backed device images

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use inkclock_firmware_update::prelude::*;
use inkclock_watchdog::SoftwareWatchdog;
use portable_atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

use crate::commands::DeviceArgs;
use crate::error::CliError;

/// Config file looked up inside the device directory
pub const DEVICE_CONFIG_FILE: &str = "update_config.json";

/// Settings file inside the device directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Reset requests cannot restart a host, so they are logged and counted.
#[derive(Debug, Default)]
pub struct HostSystem {
    reboots: AtomicU32,
    hard_resets: AtomicU32,
}

impl HostSystem {
    pub fn reboot_requested(&self) -> bool {
        self.reboots.load(Ordering::Acquire) > 0 || self.hard_resets.load(Ordering::Acquire) > 0
    }
}

#[async_trait::async_trait]
impl SystemControl for HostSystem {
    async fn reboot(&self) -> std::result::Result<(), DeviceError> {
        self.reboots.fetch_add(1, Ordering::AcqRel);
        info!("reboot requested; run `inkclock-ota boot` to continue");
        Ok(())
    }

    async fn hard_reset(&self) -> std::result::Result<(), DeviceError> {
        self.hard_resets.fetch_add(1, Ordering::AcqRel);
        warn!("hard reset requested; run `inkclock-ota boot` to continue");
        Ok(())
    }
}

/// Resolve the update configuration: an explicit path, the device default, or built-in defaults
pub async fn load_config(explicit: Option<&Path>, device_dir: &Path) -> Result<UpdateConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = device_dir.join(DEVICE_CONFIG_FILE);
            if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                info!("no {DEVICE_CONFIG_FILE} in device directory, using defaults");
                return Ok(UpdateConfig::default());
            }
            candidate
        }
    };
    UpdateConfig::load(&path)
        .await
        .map_err(|e| CliError::InvalidConfiguration(e.to_string()).into())
}

/// Collaborators for a device kept in a directory
pub struct HostDevice {
    pub root: PathBuf,
    pub flash: Arc<DirectoryFlash>,
    pub store: Arc<DirectoryStore>,
    pub settings: Arc<JsonFileSettings>,
    pub system: Arc<HostSystem>,
}

impl HostDevice {
    pub fn open(args: &DeviceArgs) -> Self {
        let root = args.device.clone();
        Self {
            flash: Arc::new(DirectoryFlash::new(&root, args.capacity)),
            store: Arc::new(DirectoryStore::new(&root)),
            settings: Arc::new(JsonFileSettings::new(root.join(SETTINGS_FILE))),
            system: Arc::new(HostSystem::default()),
            root,
        }
    }

    /// Parts for an update from `media`, with supply and heap fixed from the arguments
    pub fn parts(&self, args: &DeviceArgs, media: &Path) -> DeviceParts {
        DeviceParts {
            flash: self.flash.clone(),
            watchdog: Box::new(SoftwareWatchdog::with_default_timeout()),
            media: Arc::new(DirectoryStore::removable(media)),
            store: self.store.clone(),
            settings: self.settings.clone(),
            power: Arc::new(StaticPower::new(args.supply_mv)),
            heap: Arc::new(StaticHeap::new(Some(args.free_heap))),
            system: self.system.clone(),
            transport: None,
        }
    }

    pub fn rollback_controller(&self, config: &UpdateConfig) -> RollbackController {
        RollbackController::new(
            self.flash.clone(),
            self.store.clone(),
            self.settings.clone(),
            self.system.clone(),
            config.rollback.clone(),
        )
    }
}
