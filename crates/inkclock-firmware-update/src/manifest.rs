//! Firmware manifest (`firmware_info.json`) parsing and validation
//!
//! ```json
//! {
//!   "supported_hardware": ["ESP32", "ESP32-S3"],
//!   "sha256": "<64 hex chars>",
//!   "signature": "<base64 or hex Ed25519 signature over the digest>",
//!   "public_key": "<key id, fingerprint or trusted base64 key>",
//!   "size": 1048576,
//!   "version": "2.4.0"
//! }
//! ```
//!
//! `size` and `version` are optional.

use std::collections::BTreeSet;

use inkclock_crypto::{Sha256Digest, Signature};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FirmwareUpdateError, Result};

/// Wire form of the manifest file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Hardware ids this image runs on
    #[serde(default)]
    pub supported_hardware: Option<Vec<String>>,
    /// Hex SHA-256 of the image
    #[serde(default)]
    pub sha256: Option<String>,
    /// Signature text
    #[serde(default)]
    pub signature: Option<String>,
    /// Signing key reference
    #[serde(default)]
    pub public_key: Option<String>,
    /// Image length in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Release version, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A validated manifest; immutable once parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareManifest {
    /// Hardware ids, as written in the manifest
    pub supported_hardware_ids: BTreeSet<String>,
    /// Declared image length; the source file length is used when absent
    pub image_size: Option<u64>,
    /// Lowercase hex SHA-256 of the image
    pub expected_hash_hex: String,
    /// Decoded signature bytes
    pub signature: Signature,
    /// Signing key reference
    pub public_key_ref: String,
    /// Release version
    pub version: Option<String>,
}

impl FirmwareManifest {
    /// Whether `hardware_id` is supported, ignoring case and surrounding whitespace
    pub fn supports(&self, hardware_id: &str) -> bool {
        let wanted = hardware_id.trim();
        self.supported_hardware_ids
            .iter()
            .any(|id| id.trim().eq_ignore_ascii_case(wanted))
    }

    /// Image length to stream: the declared size, else the source length
    pub fn resolve_size(&self, source_len: u64) -> Result<u64> {
        let size = self.image_size.unwrap_or(source_len);
        if size == 0 {
            return Err(FirmwareUpdateError::InvalidManifest(
                "firmware image is empty".into(),
            ));
        }
        Ok(size)
    }

    /// Wire form, with the signature in base64
    pub fn to_file(&self) -> ManifestFile {
        ManifestFile {
            supported_hardware: Some(self.supported_hardware_ids.iter().cloned().collect()),
            sha256: Some(self.expected_hash_hex.clone()),
            signature: Some(self.signature.to_base64()),
            public_key: Some(self.public_key_ref.clone()),
            size: self.image_size,
            version: self.version.clone(),
        }
    }

    /// Pretty JSON wire form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_file())?)
    }
}

/// Validates manifests against the running device
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestValidator;

impl ManifestValidator {
    /// Parse `bytes` and check them against `hardware_id`.
    ///
    /// Hardware compatibility is decided here, before any image byte is read.
    pub fn validate(bytes: &[u8], hardware_id: &str) -> Result<FirmwareManifest> {
        let file: ManifestFile = serde_json::from_slice(bytes)
            .map_err(|e| FirmwareUpdateError::InvalidManifest(format!("malformed JSON: {e}")))?;
        let manifest = Self::from_file(file)?;

        if !manifest.supports(hardware_id) {
            warn!(
                device = hardware_id,
                supported = ?manifest.supported_hardware_ids,
                "firmware does not support this hardware"
            );
            return Err(FirmwareUpdateError::HardwareMismatch {
                device: hardware_id.to_string(),
                supported: manifest.supported_hardware_ids.into_iter().collect(),
            });
        }

        debug!(
            sha256 = %manifest.expected_hash_hex,
            key = %manifest.public_key_ref,
            "manifest accepted"
        );
        Ok(manifest)
    }

    /// Check required fields and formats of a wire manifest
    pub fn from_file(file: ManifestFile) -> Result<FirmwareManifest> {
        let supported_hardware_ids: BTreeSet<String> = file
            .supported_hardware
            .ok_or_else(|| missing("supported_hardware"))?
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if supported_hardware_ids.is_empty() {
            return Err(FirmwareUpdateError::InvalidManifest(
                "supported_hardware is empty".into(),
            ));
        }

        let sha256 = non_empty(file.sha256, "sha256")?;
        let digest = Sha256Digest::from_hex(&sha256)
            .map_err(|e| FirmwareUpdateError::InvalidManifest(format!("sha256: {e}")))?;

        let signature_text = non_empty(file.signature, "signature")?;
        let signature = Signature::from_text(&signature_text)
            .map_err(|e| FirmwareUpdateError::InvalidManifest(format!("signature: {e}")))?;

        let public_key_ref = non_empty(file.public_key, "public_key")?;

        if file.size == Some(0) {
            return Err(FirmwareUpdateError::InvalidManifest(
                "size must be positive".into(),
            ));
        }

        Ok(FirmwareManifest {
            supported_hardware_ids,
            image_size: file.size,
            expected_hash_hex: digest.to_hex(),
            signature,
            public_key_ref,
            version: file.version,
        })
    }
}

fn missing(field: &str) -> FirmwareUpdateError {
    FirmwareUpdateError::InvalidManifest(format!("missing field `{field}`"))
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(missing(field)),
    }
}
