//! Convenience re-exports for common firmware update types

pub use crate::config::{DownloadConfig, MediaConfig, PowerConfig, RollbackConfig, UpdateConfig};
pub use crate::controller::{PartitionController, StagedImage};
pub use crate::device::{FlashDevice, HeapMonitor, PowerMonitor, SettingsStore, SystemControl};
pub use crate::directory::{DirectoryFlash, JsonFileSettings};
pub use crate::error::{DeviceError, ErrorKind, FirmwareUpdateError};
pub use crate::manifest::{FirmwareManifest, ManifestFile, ManifestValidator};
pub use crate::orchestrator::{DeviceParts, UpdateOrchestrator, UpdateResult};
pub use crate::partition::{BootRecord, Partition, PartitionPhase, PartitionState};
pub use crate::preflight::{PowerReport, PreflightGuard};
pub use crate::rollback::{BootAction, DeviceStatus, RollbackController, RollbackReport};
pub use crate::session::{SourceType, StatusCallback, StatusEvent, UpdateSession, UpdateStatus};
pub use crate::sim::{
    MemoryFlash, MemorySettings, MemoryStore, RecordingSystem, ScriptedPower, ScriptedResponse,
    ScriptedTransport, StaticHeap, StaticPower,
};
pub use crate::storage::{DirectoryStore, FileStore, RemovableMedia};
pub use crate::transport::{ByteStream, Download, FirmwareTransport};
pub use crate::vault::{BootMetadataBackup, ConfigSnapshot, ConfigVault};
pub use crate::verifier::{FirmwareVerifier, VerifiedImage};
