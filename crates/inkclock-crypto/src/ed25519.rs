//! Ed25519 firmware signatures
//!
//! Firmware images are signed over their 32-byte SHA-256 digest, not over the
//! raw image, so a verifier that has already streamed the image through
//! [`ImageHasher`](crate::digest::ImageHasher) never needs it again.
//!
//! Key generation uses `OsRng`. Key and signature comparisons are constant
//! time.

use crate::digest::Sha256Digest;
use crate::error::{CryptoError, CryptoResult};
use crate::utils;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Ed25519 public key length in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 public key wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKey {
    /// Raw public key bytes
    pub key_bytes: [u8; PUBLIC_KEY_LEN],
    /// Key id used as `public_key` reference in manifests
    pub identifier: String,
    /// Optional comment or description
    pub comment: Option<String>,
}

impl PublicKey {
    /// Create a new public key from raw bytes
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN], identifier: impl Into<String>) -> Self {
        Self {
            key_bytes: bytes,
            identifier: identifier.into(),
            comment: None,
        }
    }

    /// Parse a base64 public key
    pub fn from_base64(encoded: &str, identifier: impl Into<String>) -> CryptoResult<Self> {
        let bytes = utils::decode_base64(encoded.trim())?;
        let key_bytes: [u8; PUBLIC_KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_LEN,
                    actual: bytes.len(),
                })?;
        let key = Self::from_bytes(key_bytes, identifier);
        key.to_verifying_key()?;
        Ok(key)
    }

    /// Base64 form, as written into configuration and manifests
    pub fn to_base64(&self) -> String {
        utils::encode_base64(&self.key_bytes)
    }

    /// Create a public key with a comment
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Get the fingerprint of this public key (SHA256 hash in hex)
    pub fn fingerprint(&self) -> String {
        utils::compute_key_fingerprint(&self.key_bytes)
    }

    /// Convert to ed25519_dalek VerifyingKey
    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.key_bytes)
            .map_err(|e| CryptoError::KeyFormatError(format!("Invalid public key: {e}")))
    }

    /// Compare two public keys in constant time
    pub fn ct_eq(&self, other: &PublicKey) -> bool {
        self.key_bytes.ct_eq(&other.key_bytes).into()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl Eq for PublicKey {}

/// Ed25519 signature wrapper
#[derive(Debug, Clone)]
pub struct Signature {
    /// Raw signature bytes
    pub signature_bytes: [u8; SIGNATURE_LEN],
}

impl Signature {
    /// Create a new signature from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            signature_bytes: bytes,
        }
    }

    /// Build a signature from a decoded byte slice
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let signature_bytes: [u8; SIGNATURE_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidSignatureLength {
                    expected: SIGNATURE_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self { signature_bytes })
    }

    /// Parse a manifest signature in base64 or hex
    pub fn from_text(text: &str) -> CryptoResult<Self> {
        let bytes = crate::digest::decode_signature_text(text)?;
        Self::from_slice(&bytes)
    }

    /// Encode signature as base64 string
    pub fn to_base64(&self) -> String {
        utils::encode_base64(&self.signature_bytes)
    }

    /// Convert to ed25519_dalek Signature
    pub fn to_dalek_signature(&self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.signature_bytes)
    }

    /// Compare two signatures in constant time
    pub fn ct_eq(&self, other: &Signature) -> bool {
        self.signature_bytes.ct_eq(&other.signature_bytes).into()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl Eq for Signature {}

/// Ed25519 key pair for signing releases
#[derive(Debug)]
pub struct KeyPair {
    /// The signing (private) key
    pub signing_key: SigningKey,
    /// The public key derived from the signing key
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random Ed25519 key pair
    pub fn generate(identifier: impl Into<String>) -> Self {
        use rand::rngs::OsRng;

        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key, identifier)
    }

    /// Create a key pair from an existing signing key
    pub fn from_signing_key(signing_key: SigningKey, identifier: impl Into<String>) -> Self {
        let public_key = PublicKey::from_bytes(signing_key.verifying_key().to_bytes(), identifier);
        Self {
            signing_key,
            public_key,
        }
    }

    /// Load a key pair from raw signing key bytes
    pub fn from_bytes(signing_key_bytes: &[u8; 32], identifier: impl Into<String>) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(signing_key_bytes), identifier)
    }

    /// Load a key pair from a base64 signing key
    pub fn from_base64(encoded: &str, identifier: impl Into<String>) -> CryptoResult<Self> {
        let bytes = utils::decode_base64(encoded.trim())?;
        let secret: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;
        Ok(Self::from_bytes(&secret, identifier))
    }

    /// Get the signing key bytes (for secure storage)
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key fingerprint
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }
}

/// Ed25519 signer for firmware digests
#[derive(Debug)]
pub struct Ed25519Signer;

impl Ed25519Signer {
    /// Sign arbitrary data with a signing key
    pub fn sign(data: &[u8], signing_key: &SigningKey) -> Signature {
        Signature::from_bytes(signing_key.sign(data).to_bytes())
    }

    /// Sign an image digest
    pub fn sign_digest(digest: &Sha256Digest, signing_key: &SigningKey) -> Signature {
        Self::sign(digest.as_bytes(), signing_key)
    }
}

/// Ed25519 signature verifier
#[derive(Debug)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    /// Verify an Ed25519 signature against data and public key
    pub fn verify(data: &[u8], signature: &Signature, public_key: &PublicKey) -> CryptoResult<bool> {
        let verifying_key = public_key.to_verifying_key()?;
        let dalek_signature = signature.to_dalek_signature();
        Ok(verifying_key.verify(data, &dalek_signature).is_ok())
    }

    /// Verify a signature over an image digest
    pub fn verify_digest(
        digest: &Sha256Digest,
        signature: &Signature,
        public_key: &PublicKey,
    ) -> CryptoResult<bool> {
        Self::verify(digest.as_bytes(), signature, public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let keypair = KeyPair::generate("release-2026");
        assert_eq!(keypair.public_key.identifier, "release-2026");
        assert_eq!(keypair.fingerprint().len(), 64);
    }

    #[test]
    fn test_sign_and_verify_digest() -> CryptoResult<()> {
        let keypair = KeyPair::generate("release");
        let digest = Sha256Digest::of(b"firmware image bytes");

        let signature = Ed25519Signer::sign_digest(&digest, &keypair.signing_key);
        assert!(Ed25519Verifier::verify_digest(
            &digest,
            &signature,
            &keypair.public_key
        )?);

        let other = Sha256Digest::of(b"tampered image bytes");
        assert!(!Ed25519Verifier::verify_digest(
            &other,
            &signature,
            &keypair.public_key
        )?);
        Ok(())
    }

    #[test]
    fn test_wrong_key_rejects() -> CryptoResult<()> {
        let signer = KeyPair::generate("a");
        let other = KeyPair::generate("b");
        let digest = Sha256Digest::of(b"image");
        let signature = Ed25519Signer::sign_digest(&digest, &signer.signing_key);
        assert!(!Ed25519Verifier::verify_digest(
            &digest,
            &signature,
            &other.public_key
        )?);
        Ok(())
    }

    #[test]
    fn test_public_key_base64_round_trip() -> CryptoResult<()> {
        let keypair = KeyPair::generate("release");
        let parsed = PublicKey::from_base64(&keypair.public_key.to_base64(), "release")?;
        assert!(parsed.ct_eq(&keypair.public_key));
        Ok(())
    }

    #[test]
    fn test_keypair_from_base64() -> CryptoResult<()> {
        let original = KeyPair::generate("release");
        let encoded = utils::encode_base64(&original.signing_key_bytes());
        let restored = KeyPair::from_base64(&encoded, "release")?;
        assert!(original.public_key.ct_eq(&restored.public_key));
        Ok(())
    }

    #[test]
    fn test_signature_from_text_lengths() {
        assert!(matches!(
            Signature::from_text(&utils::encode_base64(&[0u8; 32])),
            Err(CryptoError::InvalidSignatureLength { actual: 32, .. })
        ));
        assert!(Signature::from_text(&hex::encode([7u8; 64])).is_ok());
    }

    #[test]
    fn test_invalid_public_key_length() {
        let result = PublicKey::from_base64(&utils::encode_base64(&[0u8; 16]), "short");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }
}
