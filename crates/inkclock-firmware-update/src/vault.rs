//! Configuration vault
//!
//! Critical settings are snapshotted into internal storage, outside both
//! firmware partitions, before every update attempt. The snapshot stays until
//! the new firmware is marked valid, and is restored if it is rolled back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, FirmwareUpdateError, Result};
use crate::partition::Partition;
use crate::storage::FileStore;

/// Default snapshot location in internal storage
pub const SNAPSHOT_PATH: &str = "vault/config_snapshot.json";

/// Default boot metadata backup location
pub const BOOT_METADATA_PATH: &str = "vault/boot_metadata.json";

/// Serialized critical settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Partition that was active when the snapshot was taken
    pub partition: Partition,
    /// Exported settings
    pub settings: BTreeMap<String, String>,
    /// CRC-32 over the canonical JSON of `settings`
    pub checksum: u32,
    /// Set once the snapshot has been written and read back intact
    pub valid: bool,
}

impl ConfigSnapshot {
    /// Snapshot of `settings` with its checksum; not yet valid
    pub fn new(settings: BTreeMap<String, String>, partition: Partition) -> Result<Self> {
        let checksum = settings_checksum(&settings)?;
        Ok(Self {
            created_at: Utc::now(),
            partition,
            settings,
            checksum,
            valid: false,
        })
    }

    /// Whether the checksum still matches the settings
    pub fn checksum_matches(&self) -> bool {
        settings_checksum(&self.settings).is_ok_and(|sum| sum == self.checksum)
    }
}

/// Copy of one partition's boot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootMetadataBackup {
    /// Partition the metadata belongs to
    pub partition: Partition,
    /// CRC-32 of `data`
    pub checksum: u32,
    /// Raw metadata bytes
    pub data: Vec<u8>,
}

impl BootMetadataBackup {
    /// Backup of `data` for `partition`
    pub fn new(partition: Partition, data: Vec<u8>) -> Self {
        Self {
            partition,
            checksum: crc32fast::hash(&data),
            data,
        }
    }

    /// Whether `data` still matches its checksum
    pub fn is_intact(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }
}

fn settings_checksum(settings: &BTreeMap<String, String>) -> Result<u32> {
    let canonical = serde_json::to_vec(settings)?;
    Ok(crc32fast::hash(&canonical))
}

/// Stores settings snapshots and boot metadata backups
pub struct ConfigVault {
    store: Arc<dyn FileStore>,
    snapshot_path: String,
    metadata_path: String,
}

impl std::fmt::Debug for ConfigVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigVault")
            .field("snapshot_path", &self.snapshot_path)
            .field("metadata_path", &self.metadata_path)
            .finish_non_exhaustive()
    }
}

impl ConfigVault {
    /// Vault at the default paths of `store`
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self::with_paths(store, SNAPSHOT_PATH, BOOT_METADATA_PATH)
    }

    /// Vault at custom paths
    pub fn with_paths(
        store: Arc<dyn FileStore>,
        snapshot_path: impl Into<String>,
        metadata_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            snapshot_path: snapshot_path.into(),
            metadata_path: metadata_path.into(),
        }
    }

    /// Write a snapshot of `settings`, read it back and verify it.
    ///
    /// The returned snapshot is `valid` only if the stored copy parsed and its
    /// checksum matched.
    pub async fn backup(
        &self,
        settings: BTreeMap<String, String>,
        active: Partition,
    ) -> Result<ConfigSnapshot> {
        let mut snapshot = ConfigSnapshot::new(settings, active)
            .map_err(|e| FirmwareUpdateError::ConfigBackupFailed(e.to_string()))?;
        snapshot.valid = true;

        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| FirmwareUpdateError::ConfigBackupFailed(e.to_string()))?;
        self.store
            .write_all(&self.snapshot_path, &bytes)
            .await
            .map_err(|e| FirmwareUpdateError::ConfigBackupFailed(format!("write failed: {e}")))?;

        let stored = self
            .load()
            .await
            .map_err(|e| FirmwareUpdateError::ConfigBackupFailed(format!("read-back failed: {e}")))?
            .ok_or_else(|| FirmwareUpdateError::ConfigBackupFailed("snapshot vanished".into()))?;
        if stored != snapshot || !Self::is_valid(&stored) {
            warn!(path = %self.snapshot_path, "settings snapshot read-back differs");
            return Err(FirmwareUpdateError::ConfigBackupFailed(
                "read-back does not match written snapshot".into(),
            ));
        }

        info!(
            entries = snapshot.settings.len(),
            checksum = snapshot.checksum,
            "settings snapshot stored"
        );
        Ok(snapshot)
    }

    /// Whether `snapshot` is flagged valid and its checksum matches
    pub fn is_valid(snapshot: &ConfigSnapshot) -> bool {
        snapshot.valid && snapshot.checksum_matches()
    }

    /// Stored snapshot, if any
    pub async fn load(&self) -> Result<Option<ConfigSnapshot>> {
        match self.store.read_all(&self.snapshot_path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Settings to re-import, after checking the snapshot
    pub fn restore(snapshot: &ConfigSnapshot) -> Result<BTreeMap<String, String>> {
        if !Self::is_valid(snapshot) {
            return Err(FirmwareUpdateError::ConfigRestoreFailed(
                "snapshot failed its checksum".into(),
            ));
        }
        Ok(snapshot.settings.clone())
    }

    /// Delete the stored snapshot and boot metadata backup
    pub async fn discard(&self) -> Result<()> {
        for path in [&self.snapshot_path, &self.metadata_path] {
            if self.store.remove(path).await? {
                debug!(path = %path, "vault entry discarded");
            }
        }
        Ok(())
    }

    /// Store a copy of a partition's boot metadata
    pub async fn save_boot_metadata(&self, backup: &BootMetadataBackup) -> Result<()> {
        let bytes = serde_json::to_vec(backup)?;
        self.store.write_all(&self.metadata_path, &bytes).await?;
        Ok(())
    }

    /// Stored boot metadata backup, if any
    pub async fn load_boot_metadata(&self) -> Result<Option<BootMetadataBackup>> {
        match self.store.read_all(&self.metadata_path).await {
            Ok(bytes) => {
                let backup: BootMetadataBackup = serde_json::from_slice(&bytes)?;
                if !backup.is_intact() {
                    return Err(DeviceError::Corrupt("boot metadata backup checksum".into()).into());
                }
                Ok(Some(backup))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sim::MemoryStore;

    fn settings() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("wifi.ssid".to_string(), "home".to_string()),
            ("display.rotation".to_string(), "90".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_backup_round_trip() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let vault = ConfigVault::new(store.clone());

        let snapshot = vault.backup(settings(), Partition::A).await?;
        assert!(snapshot.valid);
        assert!(ConfigVault::is_valid(&snapshot));
        assert!(store.contains(SNAPSHOT_PATH));

        let loaded = vault.load().await?;
        assert_eq!(loaded.as_ref(), Some(&snapshot));
        assert_eq!(ConfigVault::restore(&snapshot)?, settings());

        vault.discard().await?;
        assert_eq!(vault.load().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_snapshot_is_invalid() -> Result<()> {
        let vault = ConfigVault::new(Arc::new(MemoryStore::new()));
        let mut snapshot = vault.backup(settings(), Partition::B).await?;
        snapshot
            .settings
            .insert("wifi.ssid".to_string(), "evil".to_string());
        assert!(!ConfigVault::is_valid(&snapshot));
        let kind = ConfigVault::restore(&snapshot).err().map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::ConfigRestoreFailed));
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_write_failure() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let vault = ConfigVault::new(store);
        let kind = vault
            .backup(settings(), Partition::A)
            .await
            .err()
            .map(|e| e.kind());
        assert_eq!(kind, Some(ErrorKind::ConfigBackupFailed));
    }

    #[tokio::test]
    async fn test_boot_metadata_backup() -> Result<()> {
        let vault = ConfigVault::new(Arc::new(MemoryStore::new()));
        assert_eq!(vault.load_boot_metadata().await?, None);

        let backup = BootMetadataBackup::new(Partition::A, vec![0xE9, 0x03, 0x02, 0x20]);
        vault.save_boot_metadata(&backup).await?;
        assert_eq!(vault.load_boot_metadata().await?, Some(backup));
        Ok(())
    }
}
