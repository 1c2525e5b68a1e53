//! Update session state and status events

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Public update status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// No update running
    #[default]
    Idle,
    /// Reading and validating the manifest and image
    Checking,
    /// Fetching the image over the network
    Downloading,
    /// Preflight, backup, flashing and switching
    Updating,
    /// Boot record switched to the new image
    Success,
    /// Aborted after the manifest was accepted
    Failed,
    /// Manifest rejected
    Invalid,
    /// Boot-time rollback in progress
    RollingBack,
}

impl UpdateStatus {
    /// Whether the session has ended and awaits acknowledgement
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateStatus::Success | UpdateStatus::Failed | UpdateStatus::Invalid
        )
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Where the image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// Removable storage
    LocalMedia,
    /// HTTP download
    Network,
}

/// State of the current update attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSession {
    /// Current status
    pub status: UpdateStatus,
    /// Percent complete, 0..=100
    pub progress: u8,
    /// Last failure of this attempt
    pub last_error: Option<ErrorKind>,
    /// Image source of this attempt
    pub source: Option<SourceType>,
    /// Last status message
    pub message: String,
}

impl UpdateSession {
    /// Fresh session for `source`
    pub fn start(source: SourceType) -> Self {
        Self {
            status: UpdateStatus::Checking,
            progress: 0,
            last_error: None,
            source: Some(source),
            message: String::new(),
        }
    }

    /// Snapshot as a status event
    pub fn event(&self) -> StatusEvent {
        StatusEvent {
            status: self.status,
            progress: self.progress,
            error: self.last_error,
            message: self.message.clone(),
        }
    }
}

/// Payload of the status callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Status at the time of the event
    pub status: UpdateStatus,
    /// Percent complete
    pub progress: u8,
    /// Failure, if the event reports one
    pub error: Option<ErrorKind>,
    /// Human-readable stage description
    pub message: String,
}

/// Receives status events; called inline on the update task
pub type StatusCallback = Box<dyn Fn(&StatusEvent) + Send + Sync>;
