//! Failures of key handling, digest parsing and signature checks

use thiserror::Error;

/// Why a key, digest or signature was rejected
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Signature does not match the digest under the resolved key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Key reference names no key in the key ring
    #[error("Untrusted signer: {0}")]
    UntrustedSigner(String),

    /// Key text is not valid base64 or not a valid Ed25519 point
    #[error("Key format error: {0}")]
    KeyFormatError(String),

    /// Decoded key has the wrong number of bytes
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Ed25519 key length
        expected: usize,
        /// Decoded length
        actual: usize,
    },

    /// Signature text is neither base64 nor hex
    #[error("Signature format error: {0}")]
    SignatureFormatError(String),

    /// Decoded signature has the wrong number of bytes
    #[error("Invalid signature length: expected {expected} bytes, got {actual}")]
    InvalidSignatureLength {
        /// Ed25519 signature length
        expected: usize,
        /// Decoded length
        actual: usize,
    },

    /// Digest text is not 64 hex characters
    #[error("Digest format error: {0}")]
    DigestFormatError(String),

    /// Two trusted keys share an id
    #[error("Duplicate key id: {0}")]
    DuplicateKey(String),
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::KeyFormatError(format!("Base64 decode error: {e}"))
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sha256Digest;
    use crate::ed25519::Signature;

    #[test]
    fn test_malformed_digest_text() {
        for text in ["xyz", "abcd", ""] {
            assert!(
                matches!(Sha256Digest::from_hex(text), Err(CryptoError::DigestFormatError(_))),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn test_malformed_signature_text() {
        assert!(matches!(
            Signature::from_text("   "),
            Err(CryptoError::SignatureFormatError(_))
        ));
        assert!(matches!(
            Signature::from_text("%%not-base64%%"),
            Err(CryptoError::SignatureFormatError(_))
        ));
    }

    #[test]
    fn test_bad_base64_is_a_key_format_error() {
        let err = crate::utils::decode_base64("@@@").err();
        assert!(matches!(err, Some(CryptoError::KeyFormatError(_))));
        assert!(err.is_some_and(|e| e.to_string().starts_with("Key format error")));
    }

    #[test]
    fn test_length_errors_name_both_sizes() {
        let err = CryptoError::InvalidSignatureLength {
            expected: 64,
            actual: 32,
        };
        assert_eq!(
            err.to_string(),
            "Invalid signature length: expected 64 bytes, got 32"
        );
    }
}
