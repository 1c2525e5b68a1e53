//! Release signing keys

use std::path::Path;

use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use inkclock_crypto::{KeyPair, TrustedKeyConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::commands::KeygenArgs;
use crate::error::CliError;
use crate::output;

/// On-disk form of a signing key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub id: String,
    pub signing_key: String,
    pub public_key: String,
}

impl KeyFile {
    pub fn from_pair(pair: &KeyPair) -> Self {
        Self {
            id: pair.public_key.identifier.clone(),
            signing_key: STANDARD.encode(pair.signing_key_bytes()),
            public_key: pair.public_key.to_base64(),
        }
    }

    pub fn trusted_key(&self) -> TrustedKeyConfig {
        TrustedKeyConfig {
            id: self.id.clone(),
            public_key: self.public_key.clone(),
            comment: None,
        }
    }

    /// Load and check that the stored public key belongs to the signing key
    pub async fn load(path: &Path) -> Result<KeyPair> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CliError::KeyFile(format!("{}: {e}", path.display())))?;
        let file: KeyFile = serde_json::from_str(&text).map_err(CliError::from)?;
        let pair = KeyPair::from_base64(&file.signing_key, &file.id)
            .map_err(|e| CliError::KeyFile(format!("{}: {e}", path.display())))?;
        if pair.public_key.to_base64() != file.public_key {
            return Err(CliError::KeyFile(format!(
                "{}: public key does not match signing key",
                path.display()
            ))
            .into());
        }
        Ok(pair)
    }
}

pub async fn keygen(args: &KeygenArgs, json: bool) -> Result<()> {
    let path = args.out.join(format!("{}.key.json", args.id));
    if !args.force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(CliError::KeyFile(format!(
            "{} exists; pass --force to replace it",
            path.display()
        ))
        .into());
    }

    let pair = KeyPair::generate(&args.id);
    let file = KeyFile::from_pair(&pair);
    tokio::fs::create_dir_all(&args.out).await?;
    tokio::fs::write(&path, serde_json::to_string_pretty(&file)?).await?;
    info!(id = %args.id, fingerprint = %pair.fingerprint(), "signing key generated");

    let trusted = file.trusted_key();
    if json {
        output::print_json(&serde_json::json!({
            "success": true,
            "key_file": path,
            "trusted_key": trusted,
        }));
    } else {
        output::print_success(
            &format!("wrote {} (fingerprint {})", path.display(), pair.fingerprint()),
            serde_json::Value::Null,
            false,
        );
        println!("Add to trusted_keys in update_config.json:");
        output::print_json(&trusted);
    }
    Ok(())
}
