//! File storage used for removable media, the settings vault and download staging

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::DeviceError;

/// Boxed reader returned by [`FileStore::open`]
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer returned by [`FileStore::create`]
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Flat file storage addressed by relative paths
///
/// A leading `/` is accepted and ignored, so `/firmware.bin` and
/// `firmware.bin` name the same file.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Whether `path` exists
    async fn exists(&self, path: &str) -> Result<bool, DeviceError>;

    /// Length of `path` in bytes
    async fn len(&self, path: &str) -> Result<u64, DeviceError>;

    /// Open `path` for streaming reads
    async fn open(&self, path: &str) -> Result<FileReader, DeviceError>;

    /// Create or truncate `path` for streaming writes
    async fn create(&self, path: &str) -> Result<FileWriter, DeviceError>;

    /// Read the whole file
    async fn read_all(&self, path: &str) -> Result<Vec<u8>, DeviceError>;

    /// Replace the whole file atomically
    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), DeviceError>;

    /// Remove `path`; `Ok(false)` if it did not exist
    async fn remove(&self, path: &str) -> Result<bool, DeviceError>;
}

/// Storage that must be mounted before use and released afterwards
#[async_trait::async_trait]
pub trait RemovableMedia: FileStore {
    /// Mount the media
    async fn mount(&self) -> Result<(), DeviceError>;

    /// Release the media
    async fn unmount(&self) -> Result<(), DeviceError>;
}

/// Normalize a store path to a relative path without parent components
pub fn normalize_path(path: &str) -> Result<PathBuf, DeviceError> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(DeviceError::InvalidPath(path.to_string()));
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DeviceError::InvalidPath(path.to_string()));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(DeviceError::InvalidPath(path.to_string()));
    }
    Ok(normalized)
}

/// [`FileStore`] over a host directory
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    mounted: AtomicBool,
}

impl DirectoryStore {
    /// Internal storage rooted at `root`; always available
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: AtomicBool::new(true),
        }
    }

    /// Removable media rooted at `root`; unavailable until mounted
    pub fn removable(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: AtomicBool::new(false),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the store is currently mounted
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, DeviceError> {
        if !self.is_mounted() {
            return Err(DeviceError::NotMounted);
        }
        Ok(self.root.join(normalize_path(path)?))
    }
}

#[async_trait::async_trait]
impl FileStore for DirectoryStore {
    async fn exists(&self, path: &str) -> Result<bool, DeviceError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    async fn len(&self, path: &str) -> Result<u64, DeviceError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::metadata(&full).await?.len())
    }

    async fn open(&self, path: &str) -> Result<FileReader, DeviceError> {
        let full = self.resolve(path)?;
        let file = tokio::fs::File::open(&full).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<FileWriter, DeviceError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&full).await?;
        Ok(Box::new(file))
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read(&full).await?)
    }

    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), DeviceError> {
        let full = self.resolve(path)?;
        write_atomically(&full, data).await
    }

    async fn remove(&self, path: &str) -> Result<bool, DeviceError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl RemovableMedia for DirectoryStore {
    async fn mount(&self) -> Result<(), DeviceError> {
        let metadata = tokio::fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(DeviceError::InvalidPath(self.root.display().to_string()));
        }
        self.mounted.store(true, Ordering::Release);
        debug!(root = %self.root.display(), "media mounted");
        Ok(())
    }

    async fn unmount(&self) -> Result<(), DeviceError> {
        self.mounted.store(false, Ordering::Release);
        debug!(root = %self.root.display(), "media unmounted");
        Ok(())
    }
}

/// Write `data` to a sibling temporary file, sync it, then rename over `path`
pub async fn write_atomically(path: &Path, data: &[u8]) -> Result<(), DeviceError> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_normalize_path() -> Result<(), DeviceError> {
        assert_eq!(normalize_path("/firmware.bin")?, PathBuf::from("firmware.bin"));
        assert_eq!(normalize_path("./a/b.json")?, PathBuf::from("a/b.json"));
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_store_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = DirectoryStore::new(dir.path());

        store.write_all("vault/snapshot.json", b"{}").await?;
        assert!(store.exists("/vault/snapshot.json").await?);
        assert_eq!(store.read_all("vault/snapshot.json").await?, b"{}");
        assert!(!dir.path().join("vault/snapshot.json.tmp").exists());

        let mut writer = store.create("download.bin").await?;
        writer.write_all(b"chunk-1chunk-2").await?;
        writer.shutdown().await?;
        drop(writer);
        assert_eq!(store.len("download.bin").await?, 14);

        let mut reader = store.open("download.bin").await?;
        let mut text = String::new();
        reader.read_to_string(&mut text).await?;
        assert_eq!(text, "chunk-1chunk-2");

        assert!(store.remove("download.bin").await?);
        assert!(!store.remove("download.bin").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_removable_requires_mount() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("firmware.bin"), b"image")?;
        let media = DirectoryStore::removable(dir.path());

        assert!(matches!(
            media.exists("firmware.bin").await,
            Err(DeviceError::NotMounted)
        ));
        media.mount().await?;
        assert!(media.exists("/firmware.bin").await?);
        media.unmount().await?;
        assert!(!media.is_mounted());
        Ok(())
    }
}
