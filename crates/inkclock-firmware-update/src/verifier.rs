//! Streaming image verification: digest first, then signature

use inkclock_crypto::{Ed25519Verifier, ImageHasher, KeyRing, Sha256Digest};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use crate::error::{FirmwareUpdateError, Result};
use crate::manifest::FirmwareManifest;

/// Read buffer used while hashing
pub const VERIFY_CHUNK_SIZE: usize = 4096;

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedImage {
    /// Digest of the streamed image
    pub digest: Sha256Digest,
    /// Bytes streamed
    pub size: u64,
    /// Id of the key that signed the image
    pub signer: String,
}

/// Checks an image stream against its manifest
#[derive(Debug, Clone)]
pub struct FirmwareVerifier {
    keyring: KeyRing,
}

impl FirmwareVerifier {
    /// Verifier trusting the keys in `keyring`
    pub fn new(keyring: KeyRing) -> Self {
        Self { keyring }
    }

    /// Trusted keys
    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    /// Stream `image` through SHA-256 and check it against `manifest`.
    ///
    /// The image is never buffered whole. The digest is compared before the
    /// signature is looked at; the size cross-check sits between the two.
    pub async fn verify<R>(&self, mut image: R, manifest: &FirmwareManifest) -> Result<VerifiedImage>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut hasher = ImageHasher::new();
        let mut buf = vec![0u8; VERIFY_CHUNK_SIZE];
        loop {
            let n = image
                .read(&mut buf)
                .await
                .map_err(|e| FirmwareUpdateError::FileNotFound(format!("image read failed: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(buf.get(..n).unwrap_or_default());
        }

        let size = hasher.bytes_hashed();
        if size == 0 {
            return Err(FirmwareUpdateError::InvalidManifest(
                "firmware image is empty".into(),
            ));
        }

        let digest = hasher.finalize();
        if !digest.matches_hex(&manifest.expected_hash_hex) {
            warn!(expected = %manifest.expected_hash_hex, actual = %digest, "image hash mismatch");
            return Err(FirmwareUpdateError::HashMismatch {
                expected: manifest.expected_hash_hex.clone(),
                actual: digest.to_hex(),
            });
        }

        if let Some(expected) = manifest.image_size
            && expected != size
        {
            return Err(FirmwareUpdateError::SizeMismatch {
                expected,
                actual: size,
            });
        }

        let key = self.keyring.resolve(&manifest.public_key_ref).map_err(|e| {
            FirmwareUpdateError::SignatureMismatch(format!("signing key not trusted: {e}"))
        })?;
        let valid = Ed25519Verifier::verify_digest(&digest, &manifest.signature, &key)
            .map_err(|e| FirmwareUpdateError::SignatureMismatch(e.to_string()))?;
        if !valid {
            warn!(key = %key.identifier, "image signature rejected");
            return Err(FirmwareUpdateError::SignatureMismatch(format!(
                "signature does not verify with key {}",
                key.identifier
            )));
        }

        info!(size, sha256 = %digest, signer = %key.identifier, "firmware image verified");
        Ok(VerifiedImage {
            digest,
            size,
            signer: key.identifier,
        })
    }
}
