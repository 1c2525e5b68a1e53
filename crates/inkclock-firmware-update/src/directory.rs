//! Directory-backed device parts for host tooling and tests
//!
//! Layout under the device root:
//!
//! ```text
//! boot_record.json      persisted BootRecord, replaced by rename
//! partition_a.bin       partition images
//! partition_b.bin
//! boot_meta_a.bin       per-partition boot metadata
//! boot_meta_b.bin
//! ```

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::device::{FlashDevice, SettingsStore};
use crate::error::DeviceError;
use crate::partition::{BootRecord, Partition};
use crate::storage::write_atomically;

/// Boot record file name
pub const BOOT_RECORD_FILE: &str = "boot_record.json";

/// Flash emulated by files in a directory
#[derive(Debug, Clone)]
pub struct DirectoryFlash {
    root: PathBuf,
    capacity: u64,
}

impl DirectoryFlash {
    /// Flash rooted at `root` with `capacity` bytes per partition
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            root: root.into(),
            capacity,
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a partition image
    pub fn partition_path(&self, partition: Partition) -> PathBuf {
        self.root.join(match partition {
            Partition::A => "partition_a.bin",
            Partition::B => "partition_b.bin",
        })
    }

    fn metadata_path(&self, partition: Partition) -> PathBuf {
        self.root.join(match partition {
            Partition::A => "boot_meta_a.bin",
            Partition::B => "boot_meta_b.bin",
        })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<(), DeviceError> {
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > self.capacity) {
            return Err(DeviceError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FlashDevice for DirectoryFlash {
    async fn read_boot_record(&self) -> Result<BootRecord, DeviceError> {
        match tokio::fs::read(self.root.join(BOOT_RECORD_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| DeviceError::Corrupt(format!("{BOOT_RECORD_FILE}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BootRecord::initial(Partition::A)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_boot_record(&self, record: &BootRecord) -> Result<(), DeviceError> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| DeviceError::Corrupt(e.to_string()))?;
        write_atomically(&self.root.join(BOOT_RECORD_FILE), &bytes).await?;
        debug!(active = %record.active, sequence = record.sequence, "boot record written");
        Ok(())
    }

    async fn partition_capacity(&self, _partition: Partition) -> Result<u64, DeviceError> {
        Ok(self.capacity)
    }

    async fn erase(&self, partition: Partition) -> Result<(), DeviceError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let file = tokio::fs::File::create(self.partition_path(partition)).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn write_block(
        &self,
        partition: Partition,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_bounds(offset, data.len())?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.partition_path(partition))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_block(
        &self,
        partition: Partition,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, DeviceError> {
        self.check_bounds(offset, buf.len())?;
        let mut file = tokio::fs::File::open(self.partition_path(partition)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(buf.get_mut(filled..).unwrap_or_default()).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn read_boot_metadata(&self, partition: Partition) -> Result<Vec<u8>, DeviceError> {
        match tokio::fs::read(self.metadata_path(partition)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_boot_metadata(
        &self,
        partition: Partition,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        write_atomically(&self.metadata_path(partition), data).await
    }
}

/// Settings kept as a flat JSON object in one file
#[derive(Debug, Clone)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    /// Settings stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl SettingsStore for JsonFileSettings {
    async fn export(&self) -> Result<BTreeMap<String, String>, DeviceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| DeviceError::Corrupt(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn import(&self, settings: &BTreeMap<String, String>) -> Result<(), DeviceError> {
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| DeviceError::Corrupt(e.to_string()))?;
        write_atomically(&self.path, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn test_fresh_device_boots_a() -> TestResult {
        let dir = tempfile::tempdir()?;
        let flash = DirectoryFlash::new(dir.path(), 4096);
        assert_eq!(flash.read_boot_record().await?, BootRecord::initial(Partition::A));
        assert!(flash.read_boot_metadata(Partition::B).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_block_write_and_read_back() -> TestResult {
        let dir = tempfile::tempdir()?;
        let flash = DirectoryFlash::new(dir.path(), 4096);
        flash.erase(Partition::B).await?;
        flash.write_block(Partition::B, 0, &[1u8; 1024]).await?;
        flash.write_block(Partition::B, 1024, &[2u8; 100]).await?;

        let mut buf = vec![0u8; 2048];
        let n = flash.read_block(Partition::B, 0, &mut buf).await?;
        assert_eq!(n, 1124);
        assert_eq!(buf.get(1023..1025), Some(&[1u8, 2u8][..]));

        assert!(matches!(
            flash.write_block(Partition::B, 4000, &[0u8; 200]).await,
            Err(DeviceError::OutOfBounds { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_boot_record_replaced_atomically() -> TestResult {
        let dir = tempfile::tempdir()?;
        let flash = DirectoryFlash::new(dir.path(), 4096);
        let record = BootRecord::initial(Partition::A).switched_to(Partition::B, "ff".repeat(32));
        flash.write_boot_record(&record).await?;
        assert_eq!(flash.read_boot_record().await?, record);
        assert!(!dir.path().join("boot_record.json.tmp").exists());

        std::fs::write(dir.path().join(BOOT_RECORD_FILE), b"{ torn")?;
        assert!(matches!(
            flash.read_boot_record().await,
            Err(DeviceError::Corrupt(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_json_settings() -> TestResult {
        let dir = tempfile::tempdir()?;
        let settings = JsonFileSettings::new(dir.path().join("settings.json"));
        assert!(settings.export().await?.is_empty());
        let values = BTreeMap::from([("tz".to_string(), "Europe/Berlin".to_string())]);
        settings.import(&values).await?;
        assert_eq!(settings.export().await?, values);
        Ok(())
    }
}
