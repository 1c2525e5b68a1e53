//! SHA-256 digests for firmware images
//!
//! Images are hashed incrementally as they stream from media or network, so
//! no image is ever buffered whole.

use crate::error::{CryptoError, CryptoResult};
use crate::utils;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

/// A finished SHA-256 digest
#[derive(Clone, Copy, Debug)]
pub struct Sha256Digest(pub [u8; DIGEST_LEN]);

impl Sha256Digest {
    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = ImageHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Parse a 64 character hex digest, ignoring case and surrounding whitespace
    pub fn from_hex(text: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| CryptoError::DigestFormatError(format!("{e}")))?;
        let array: [u8; DIGEST_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::DigestFormatError(format!(
                "expected {DIGEST_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Constant-time comparison against a hex digest from a manifest.
    ///
    /// Hex case is ignored. Text that does not parse never matches.
    pub fn matches_hex(&self, expected_hex: &str) -> bool {
        match Self::from_hex(expected_hex) {
            Ok(expected) => self.ct_eq(&expected),
            Err(_) => false,
        }
    }

    /// Compare two digests in constant time
    pub fn ct_eq(&self, other: &Sha256Digest) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl PartialEq for Sha256Digest {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl Eq for Sha256Digest {}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental SHA-256 over an image stream, counting the bytes it has seen
#[derive(Clone, Default)]
pub struct ImageHasher {
    inner: Sha256,
    bytes: u64,
}

impl ImageHasher {
    /// Start a new digest
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the digest
    pub fn finalize(self) -> Sha256Digest {
        Sha256Digest(self.inner.finalize().into())
    }
}

impl std::fmt::Debug for ImageHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHasher")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// Decode a manifest signature.
///
/// Manifests produced by older packaging tools carry hex; current ones carry
/// base64. A 128 character all-hex string is read as hex, anything else as
/// base64.
pub fn decode_signature_text(text: &str) -> CryptoResult<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CryptoError::SignatureFormatError("empty signature".into()));
    }
    if text.len() == 128 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(text).map_err(|e| CryptoError::SignatureFormatError(e.to_string()));
    }
    utils::decode_base64(text).map_err(|e| CryptoError::SignatureFormatError(e.to_string()))
}

/// Constant-time equality of two secrets of possibly different lengths.
///
/// The length check leaks only whether lengths differ.
pub fn secret_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_known_digest() {
        let digest = Sha256Digest::of(b"hello");
        assert_eq!(digest.to_hex(), HELLO_SHA256);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut hasher = ImageHasher::new();
        for chunk in data.chunks(1024) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.bytes_hashed(), 10_000);
        assert_eq!(hasher.finalize(), Sha256Digest::of(&data));
    }

    #[test]
    fn test_matches_hex_ignores_case() {
        let digest = Sha256Digest::of(b"hello");
        assert!(digest.matches_hex(&HELLO_SHA256.to_uppercase()));
        assert!(digest.matches_hex(&format!(" {HELLO_SHA256}\n")));
        assert!(!digest.matches_hex("2cf24d"));
        assert!(!digest.matches_hex("zz"));
    }

    #[test]
    fn test_decode_signature_hex_and_base64() -> CryptoResult<()> {
        let raw = [0xABu8; 64];
        assert_eq!(decode_signature_text(&hex::encode(raw))?, raw.to_vec());
        assert_eq!(
            decode_signature_text(&hex::encode_upper(raw))?,
            raw.to_vec()
        );
        assert_eq!(decode_signature_text(&utils::encode_base64(&raw))?, raw.to_vec());
        assert!(decode_signature_text("").is_err());
        assert!(decode_signature_text("not*base64").is_err());
        Ok(())
    }

    #[test]
    fn test_secret_eq() {
        assert!(secret_eq(b"token", b"token"));
        assert!(!secret_eq(b"token", b"tokex"));
        assert!(!secret_eq(b"token", b"token2"));
    }
}
