//! Cryptographic primitives for InkClock firmware updates
//!
//! - [`digest`]: streaming SHA-256 over firmware images and constant-time compares
//! - [`ed25519`]: Ed25519 signing and verification over image digests
//! - [`keyring`]: resolution of manifest key references to trusted keys
//! - [`error`]: error types for cryptographic operations
//!
//! # Example
//!
//! ```
//! use inkclock_crypto::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = KeyPair::generate("release-2026");
//! let digest = Sha256Digest::of(b"firmware image");
//! let signature = Ed25519Signer::sign_digest(&digest, &keypair.signing_key);
//!
//! let mut ring = KeyRing::new();
//! ring.add_key(keypair.public_key.clone())?;
//! let key = ring.resolve("release-2026")?;
//! assert!(Ed25519Verifier::verify_digest(&digest, &signature, &key)?);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod digest;
pub mod ed25519;
pub mod error;
pub mod keyring;
pub mod prelude;

pub use digest::{ImageHasher, Sha256Digest};
pub use ed25519::{Ed25519Signer, Ed25519Verifier, KeyPair, PublicKey, Signature};
pub use error::{CryptoError, CryptoResult};
pub use keyring::{KeyEntry, KeyRing, TrustedKeyConfig};

/// Trust level for a signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TrustLevel {
    /// Present in the key ring and usable
    Trusted,
    /// Not in the key ring
    Unknown,
    /// Present but revoked
    Distrusted,
}

/// Encoding helpers shared by keys, signatures and the key ring
pub mod utils {
    use crate::error::CryptoError;
    use sha2::{Digest, Sha256};

    /// Compute SHA256 fingerprint of a public key
    pub fn compute_key_fingerprint(public_key: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        hex::encode(hasher.finalize())
    }

    /// Encode bytes as base64 (Standard alphabet with padding)
    pub fn encode_base64(data: &[u8]) -> String {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        STANDARD.encode(data)
    }

    /// Decode base64 to bytes
    pub fn decode_base64(data: &str) -> Result<Vec<u8>, CryptoError> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};
        STANDARD.decode(data).map_err(CryptoError::from)
    }
}
