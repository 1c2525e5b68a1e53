//! Trusted release keys
//!
//! A manifest names its signing key through `public_key`. The reference is
//! resolved here and only keys already present in the ring are ever used
//! to verify a signature:
//! - a key id (`"release-2026"`)
//! - a key fingerprint (SHA-256 of the key, hex)
//! - an inline base64 key, accepted only if its fingerprint is in the ring

use crate::TrustLevel;
use crate::ed25519::PublicKey;
use crate::error::{CryptoError, CryptoResult};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Configuration form of a trusted key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKeyConfig {
    /// Key id referenced by manifests
    pub id: String,
    /// Base64 Ed25519 public key
    pub public_key: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Key ring entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    /// The public key
    pub public_key: PublicKey,
    /// Trust level for this key
    pub trust_level: TrustLevel,
    /// When this entry was added
    pub added_at: chrono::DateTime<chrono::Utc>,
}

/// Set of release keys trusted by a device
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    /// Fingerprint to entry
    entries: BTreeMap<String, KeyEntry>,
}

impl KeyRing {
    /// Empty key ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key ring from configuration entries
    pub fn from_config(keys: &[TrustedKeyConfig]) -> CryptoResult<Self> {
        let mut ring = Self::new();
        for key in keys {
            let mut public_key = PublicKey::from_base64(&key.public_key, key.id.clone())?;
            public_key.comment = key.comment.clone();
            ring.add_key(public_key)?;
        }
        debug!(keys = ring.len(), "key ring loaded");
        Ok(ring)
    }

    /// Configuration form of every trusted key, ordered by id
    pub fn to_config(&self) -> Vec<TrustedKeyConfig> {
        let mut keys: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.trust_level == TrustLevel::Trusted)
            .map(|entry| TrustedKeyConfig {
                id: entry.public_key.identifier.clone(),
                public_key: entry.public_key.to_base64(),
                comment: entry.public_key.comment.clone(),
            })
            .collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        keys
    }

    /// Add a trusted key. Ids must be unique.
    pub fn add_key(&mut self, public_key: PublicKey) -> CryptoResult<()> {
        if self.find_by_id(&public_key.identifier).is_some() {
            return Err(CryptoError::DuplicateKey(public_key.identifier));
        }
        self.entries.insert(
            public_key.fingerprint(),
            KeyEntry {
                public_key,
                trust_level: TrustLevel::Trusted,
                added_at: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    /// Mark a key as distrusted; it stays in the ring so inline copies are rejected too.
    pub fn distrust(&mut self, reference: &str) -> bool {
        let fingerprint = self
            .lookup(reference)
            .map(|entry| entry.public_key.fingerprint());
        match fingerprint.and_then(|fp| self.entries.get_mut(&fp)) {
            Some(entry) => {
                entry.trust_level = TrustLevel::Distrusted;
                true
            }
            None => false,
        }
    }

    /// Resolve a manifest key reference to a trusted public key
    pub fn resolve(&self, reference: &str) -> CryptoResult<PublicKey> {
        let reference = reference.trim();
        let entry = self.lookup(reference).or_else(|| self.lookup_inline(reference));
        match entry {
            Some(entry) if entry.trust_level == TrustLevel::Trusted => {
                Ok(entry.public_key.clone())
            }
            Some(entry) => {
                warn!(key = %entry.public_key.identifier, "manifest references a distrusted key");
                Err(CryptoError::UntrustedSigner(entry.public_key.identifier.clone()))
            }
            None => Err(CryptoError::UntrustedSigner(reference.to_string())),
        }
    }

    /// Trust level for a key reference
    pub fn trust_level(&self, reference: &str) -> TrustLevel {
        self.lookup(reference)
            .or_else(|| self.lookup_inline(reference))
            .map_or(TrustLevel::Unknown, |entry| entry.trust_level)
    }

    fn find_by_id(&self, id: &str) -> Option<&KeyEntry> {
        self.entries
            .values()
            .find(|entry| entry.public_key.identifier == id)
    }

    fn lookup(&self, reference: &str) -> Option<&KeyEntry> {
        self.find_by_id(reference)
            .or_else(|| self.entries.get(&reference.to_ascii_lowercase()))
    }

    fn lookup_inline(&self, reference: &str) -> Option<&KeyEntry> {
        let bytes = utils::decode_base64(reference).ok()?;
        self.entries.get(&utils::compute_key_fingerprint(&bytes))
    }

    /// Number of keys, trusted or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
