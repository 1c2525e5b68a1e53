//! Prelude for inkclock-crypto
//!
//! ```
//! use inkclock_crypto::prelude::*;
//!
//! let keypair = KeyPair::generate("release");
//! assert_eq!(keypair.fingerprint().len(), 64);
//! ```

pub use crate::TrustLevel;
pub use crate::digest::{ImageHasher, Sha256Digest, decode_signature_text, secret_eq};
pub use crate::ed25519::{Ed25519Signer, Ed25519Verifier, KeyPair, PublicKey, Signature};
pub use crate::error::{CryptoError, CryptoResult};
pub use crate::keyring::{KeyEntry, KeyRing, TrustedKeyConfig};
