//! Error types for the inkclock-ota CLI

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Update failed ({kind}): {message}")]
    UpdateFailed { kind: String, message: String },

    #[error("Release rejected: {0}")]
    ReleaseRejected(String),

    #[error("Invalid release: {0}")]
    InvalidRelease(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
