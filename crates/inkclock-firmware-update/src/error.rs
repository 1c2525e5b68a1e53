//! Error types for firmware update operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::Partition;
use crate::session::UpdateStatus;

/// Public error taxonomy reported through status callbacks and `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Image or manifest missing from the source
    FileNotFound,
    /// Manifest is malformed or incomplete
    InvalidManifest,
    /// Device hardware id not in the manifest's supported set
    HardwareMismatch,
    /// Free heap below the configured requirement
    InsufficientMemory,
    /// Supply voltage not stable enough to flash
    InsufficientPower,
    /// Image digest (or size) differs from the manifest
    HashMismatch,
    /// Signature does not verify against a trusted key
    SignatureMismatch,
    /// Writing or re-reading the staging partition failed
    UpdateWriteFailed,
    /// Boot record switch failed
    PartitionSwitchFailed,
    /// Settings snapshot could not be written or verified
    ConfigBackupFailed,
    /// Settings snapshot could not be restored
    ConfigRestoreFailed,
    /// A block write did not complete inside the watchdog window
    WatchdogTimeout,
    /// Bearer token rejected
    Unauthorized,
    /// Every download attempt failed
    DownloadFailed,
    /// Another update holds the pipeline, or the last one awaits validation
    UpdateInProgress,
    /// Boot-time rollback could not complete
    RollbackFailed,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Stable numeric code for device status reports
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::FileNotFound => 1,
            ErrorKind::InvalidManifest => 2,
            ErrorKind::HardwareMismatch => 3,
            ErrorKind::InsufficientMemory => 4,
            ErrorKind::InsufficientPower => 5,
            ErrorKind::HashMismatch => 6,
            ErrorKind::SignatureMismatch => 7,
            ErrorKind::UpdateWriteFailed => 8,
            ErrorKind::PartitionSwitchFailed => 9,
            ErrorKind::ConfigBackupFailed => 10,
            ErrorKind::ConfigRestoreFailed => 11,
            ErrorKind::WatchdogTimeout => 12,
            ErrorKind::Unauthorized => 13,
            ErrorKind::DownloadFailed => 14,
            ErrorKind::UpdateInProgress => 15,
            ErrorKind::RollbackFailed => 16,
            ErrorKind::Unknown => 255,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure reported by a storage, power or system collaborator
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hardware reported a fault
    #[error("Device fault: {0}")]
    Fault(String),

    /// Access outside a partition
    #[error("Access out of bounds: offset {offset} + {len} exceeds capacity {capacity}")]
    OutOfBounds {
        /// Byte offset of the access
        offset: u64,
        /// Length of the access
        len: usize,
        /// Partition capacity
        capacity: u64,
    },

    /// Removable media is not mounted
    #[error("Media not mounted")]
    NotMounted,

    /// Path escapes the store root or is otherwise unusable
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Persisted record failed to parse
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl DeviceError {
    /// Create a fault error
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }

    /// Whether this error means the requested item does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeviceError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Errors that can occur during firmware update operations
#[derive(Error, Debug)]
pub enum FirmwareUpdateError {
    /// Source file missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Manifest is malformed or incomplete
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Device is not in the manifest's supported set
    #[error("Hardware {device} not supported by firmware (supported: {supported:?})")]
    HardwareMismatch {
        /// This device's hardware id
        device: String,
        /// Ids the manifest supports
        supported: Vec<String>,
    },

    /// Not enough free heap to run the update
    #[error("Insufficient memory: {available} bytes free, {required} required")]
    InsufficientMemory {
        /// Bytes required
        required: u64,
        /// Bytes available, 0 when unreadable
        available: u64,
    },

    /// Supply voltage was not stable
    #[error("Insufficient power: {stable_percent}% of samples stable, {required_percent}% required")]
    InsufficientPower {
        /// Share of samples inside the safe band
        stable_percent: u8,
        /// Configured threshold
        required_percent: u8,
    },

    /// Image digest differs from the manifest
    #[error("Hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch {
        /// Digest declared by the manifest
        expected: String,
        /// Digest of the streamed image
        actual: String,
    },

    /// Image length differs from the manifest
    #[error("Size mismatch: manifest declares {expected} bytes, image has {actual}")]
    SizeMismatch {
        /// Declared size
        expected: u64,
        /// Streamed size
        actual: u64,
    },

    /// Signature does not verify
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Staging write failed
    #[error("Update write failed: {0}")]
    UpdateWriteFailed(String),

    /// Boot record switch failed
    #[error("Partition switch to {target} failed: {reason}")]
    PartitionSwitchFailed {
        /// Partition that should have become active
        target: Partition,
        /// Underlying failure
        reason: String,
    },

    /// Settings backup failed
    #[error("Config backup failed: {0}")]
    ConfigBackupFailed(String),

    /// Settings restore failed
    #[error("Config restore failed: {0}")]
    ConfigRestoreFailed(String),

    /// A block write overran the watchdog window
    #[error("Watchdog timeout while writing block {block}")]
    WatchdogTimeout {
        /// Index of the block being written
        block: u64,
    },

    /// Bearer token rejected
    #[error("Unauthorized")]
    Unauthorized,

    /// All download attempts failed
    #[error("Download failed after {attempts} attempts: {reason}")]
    DownloadFailed {
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// Pipeline already held
    #[error("Update already in progress")]
    UpdateInProgress,

    /// The last update has not been marked valid yet
    #[error("Firmware in partition {active} is on probation; mark it valid before updating")]
    OnProbation {
        /// Partition running the unvalidated firmware
        active: Partition,
    },

    /// Rollback could not complete
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Collaborator failure outside a stage-specific mapping
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for FirmwareUpdateError {
    fn from(e: serde_json::Error) -> Self {
        FirmwareUpdateError::SerializationError(e.to_string())
    }
}

impl FirmwareUpdateError {
    /// Public error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            FirmwareUpdateError::FileNotFound(_) => ErrorKind::FileNotFound,
            FirmwareUpdateError::InvalidManifest(_) => ErrorKind::InvalidManifest,
            FirmwareUpdateError::HardwareMismatch { .. } => ErrorKind::HardwareMismatch,
            FirmwareUpdateError::InsufficientMemory { .. } => ErrorKind::InsufficientMemory,
            FirmwareUpdateError::InsufficientPower { .. } => ErrorKind::InsufficientPower,
            FirmwareUpdateError::HashMismatch { .. } | FirmwareUpdateError::SizeMismatch { .. } => {
                ErrorKind::HashMismatch
            }
            FirmwareUpdateError::SignatureMismatch(_) => ErrorKind::SignatureMismatch,
            FirmwareUpdateError::UpdateWriteFailed(_) => ErrorKind::UpdateWriteFailed,
            FirmwareUpdateError::PartitionSwitchFailed { .. } => ErrorKind::PartitionSwitchFailed,
            FirmwareUpdateError::ConfigBackupFailed(_) => ErrorKind::ConfigBackupFailed,
            FirmwareUpdateError::ConfigRestoreFailed(_) => ErrorKind::ConfigRestoreFailed,
            FirmwareUpdateError::WatchdogTimeout { .. } => ErrorKind::WatchdogTimeout,
            FirmwareUpdateError::Unauthorized => ErrorKind::Unauthorized,
            FirmwareUpdateError::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            FirmwareUpdateError::UpdateInProgress | FirmwareUpdateError::OnProbation { .. } => {
                ErrorKind::UpdateInProgress
            }
            FirmwareUpdateError::RollbackFailed(_) => ErrorKind::RollbackFailed,
            FirmwareUpdateError::Config(_)
            | FirmwareUpdateError::Device(_)
            | FirmwareUpdateError::SerializationError(_) => ErrorKind::Unknown,
        }
    }

    /// Terminal session status for this error
    pub fn terminal_status(&self) -> UpdateStatus {
        match self.kind() {
            ErrorKind::InvalidManifest | ErrorKind::HardwareMismatch => UpdateStatus::Invalid,
            _ => UpdateStatus::Failed,
        }
    }
}

/// Result type for firmware update operations
pub type Result<T> = std::result::Result<T, FirmwareUpdateError>;
