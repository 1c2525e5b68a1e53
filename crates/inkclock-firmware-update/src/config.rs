//! Update engine configuration
//!
//! Loaded from a JSON file on the device. Every field has a default, so a
//! partial file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use inkclock_crypto::{KeyRing, TrustedKeyConfig};
use serde::{Deserialize, Serialize};

use crate::error::{FirmwareUpdateError, Result};

/// Default free heap required before an update, in bytes
pub const DEFAULT_MEMORY_REQUIRED: u64 = 1024 * 1024;

/// Default flash block size, in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Supply voltage sampling before flashing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Number of samples taken
    pub samples: u32,
    /// Delay between samples in milliseconds
    pub sample_interval_ms: u64,
    /// Lower edge of the safe band in millivolts
    pub min_millivolts: u32,
    /// Upper edge of the safe band in millivolts
    pub max_millivolts: u32,
    /// Share of samples that must be inside the band
    pub min_stable_percent: u8,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            samples: 5,
            sample_interval_ms: 100,
            min_millivolts: 3400,
            max_millivolts: 4300,
            min_stable_percent: 80,
        }
    }
}

impl PowerConfig {
    /// Delay between samples
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Whether a reading is inside the safe band
    pub fn in_band(&self, millivolts: u32) -> bool {
        (self.min_millivolts..=self.max_millivolts).contains(&millivolts)
    }
}

/// Network download behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Read-inactivity timeout per chunk, in milliseconds
    pub read_timeout_ms: u64,
    /// Staging file for the downloaded image, relative to the device store
    pub staging_path: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            read_timeout_ms: 30_000,
            staging_path: "firmware_download.bin".to_string(),
        }
    }
}

impl DownloadConfig {
    /// Read-inactivity timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Boot probation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Boots allowed on probation before rolling back
    pub max_boot_attempts: u32,
    /// Healthy main-loop iterations before the new firmware is marked valid
    pub grace_iterations: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_boot_attempts: 3,
            grace_iterations: 100,
        }
    }
}

/// File names on removable media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Firmware image
    pub image_path: String,
    /// Manifest
    pub manifest_path: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            image_path: "firmware.bin".to_string(),
            manifest_path: "firmware_info.json".to_string(),
        }
    }
}

/// Update engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Hardware id of this device, matched against `supported_hardware`
    pub hardware_id: String,
    /// Flash block size; the watchdog is reset after every block
    pub block_size: usize,
    /// Watchdog window per block, in milliseconds
    pub watchdog_timeout_ms: u32,
    /// Power preflight
    pub power: PowerConfig,
    /// Free heap required before starting
    pub memory_required_bytes: u64,
    /// Network download
    pub download: DownloadConfig,
    /// Bearer token for network updates; empty disables the check
    pub auth_key: String,
    /// Keys allowed to sign firmware
    pub trusted_keys: Vec<TrustedKeyConfig>,
    /// Re-read and re-hash the staging partition after writing
    pub verify_after_write: bool,
    /// Snapshot the active partition's boot metadata before writing
    pub backup_boot_metadata: bool,
    /// Reboot after a successful switch
    pub reboot_on_success: bool,
    /// Boot probation
    pub rollback: RollbackConfig,
    /// Removable media layout
    pub media: MediaConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            hardware_id: "ESP32".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            watchdog_timeout_ms: 5000,
            power: PowerConfig::default(),
            memory_required_bytes: DEFAULT_MEMORY_REQUIRED,
            download: DownloadConfig::default(),
            auth_key: String::new(),
            trusted_keys: Vec::new(),
            verify_after_write: true,
            backup_boot_metadata: true,
            reboot_on_success: true,
            rollback: RollbackConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Parse from JSON text and validate
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| FirmwareUpdateError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file and validate
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            FirmwareUpdateError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Write as pretty JSON
    pub async fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, text).await.map_err(|e| {
            FirmwareUpdateError::Config(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Check ranges and parse the trusted keys
    pub fn validate(&self) -> Result<()> {
        if self.hardware_id.trim().is_empty() {
            return Err(FirmwareUpdateError::Config(
                "hardware_id must not be empty".into(),
            ));
        }
        if !(256..=65536).contains(&self.block_size) {
            return Err(FirmwareUpdateError::Config(format!(
                "block_size must be between 256 and 65536, got {}",
                self.block_size
            )));
        }
        inkclock_watchdog::config::validate_timeout(self.watchdog_timeout())
            .map_err(|e| FirmwareUpdateError::Config(e.to_string()))?;
        if self.power.samples == 0 {
            return Err(FirmwareUpdateError::Config(
                "power.samples must be at least 1".into(),
            ));
        }
        if self.power.min_millivolts >= self.power.max_millivolts {
            return Err(FirmwareUpdateError::Config(
                "power.min_millivolts must be below power.max_millivolts".into(),
            ));
        }
        if self.power.min_stable_percent > 100 {
            return Err(FirmwareUpdateError::Config(
                "power.min_stable_percent must be at most 100".into(),
            ));
        }
        if self.download.max_attempts == 0 || self.download.read_timeout_ms == 0 {
            return Err(FirmwareUpdateError::Config(
                "download.max_attempts and download.read_timeout_ms must be positive".into(),
            ));
        }
        if self.rollback.max_boot_attempts == 0 {
            return Err(FirmwareUpdateError::Config(
                "rollback.max_boot_attempts must be at least 1".into(),
            ));
        }
        self.key_ring()?;
        Ok(())
    }

    /// Watchdog window per block
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.watchdog_timeout_ms))
    }

    /// Build the key ring from `trusted_keys`
    pub fn key_ring(&self) -> Result<KeyRing> {
        KeyRing::from_config(&self.trusted_keys)
            .map_err(|e| FirmwareUpdateError::Config(format!("trusted_keys: {e}")))
    }

    /// Whether network updates require a bearer token
    pub fn authorization_required(&self) -> bool {
        !self.auth_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() -> Result<()> {
        let config = UpdateConfig::default();
        config.validate()?;
        assert_eq!(config.power.samples, 5);
        assert_eq!(config.power.sample_interval(), Duration::from_millis(100));
        assert_eq!(config.memory_required_bytes, 1024 * 1024);
        assert_eq!(config.download.max_attempts, 3);
        assert_eq!(config.download.read_timeout(), Duration::from_secs(30));
        assert!(!config.authorization_required());
        Ok(())
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> Result<()> {
        let config = UpdateConfig::from_json(
            r#"{ "hardware_id": "ESP32-S3", "power": { "min_stable_percent": 60 } }"#,
        )?;
        assert_eq!(config.hardware_id, "ESP32-S3");
        assert_eq!(config.power.min_stable_percent, 60);
        assert_eq!(config.power.samples, 5);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            r#"{ "block_size": 16 }"#,
            r#"{ "watchdog_timeout_ms": 1 }"#,
            r#"{ "power": { "samples": 0 } }"#,
            r#"{ "power": { "min_millivolts": 5000, "max_millivolts": 3000 } }"#,
            r#"{ "download": { "max_attempts": 0 } }"#,
            r#"{ "trusted_keys": [ { "id": "k", "public_key": "not base64!" } ] }"#,
        ];
        for case in cases {
            assert!(
                matches!(
                    UpdateConfig::from_json(case),
                    Err(FirmwareUpdateError::Config(_))
                ),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_power_band() {
        let power = PowerConfig::default();
        assert!(power.in_band(3700));
        assert!(power.in_band(3400));
        assert!(!power.in_band(3399));
        assert!(!power.in_band(4301));
    }

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| FirmwareUpdateError::Config(e.to_string()))?;
        let path = dir.path().join("update.json");
        let config = UpdateConfig {
            auth_key: "secret".into(),
            ..UpdateConfig::default()
        };
        config.save(&path).await?;
        let loaded = UpdateConfig::load(&path).await?;
        assert_eq!(loaded, config);
        assert!(loaded.authorization_required());
        Ok(())
    }
}
