//! Signing and offline verification of release images

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use inkclock_crypto::{Ed25519Signer, Sha256Digest};
use inkclock_firmware_update::prelude::*;
use tracing::{debug, info};

use crate::commands::keys::KeyFile;
use crate::commands::{SignArgs, VerifyArgs, manifest_beside};
use crate::error::CliError;
use crate::host;
use crate::output;

pub async fn sign(args: &SignArgs, json: bool) -> Result<()> {
    let pair = KeyFile::load(&args.key).await?;
    let image = tokio::fs::read(&args.image).await?;
    if image.is_empty() {
        return Err(CliError::InvalidRelease(format!("{} is empty", args.image.display())).into());
    }

    let digest = Sha256Digest::of(&image);
    let manifest = FirmwareManifest {
        supported_hardware_ids: args.hardware.iter().cloned().collect::<BTreeSet<_>>(),
        image_size: Some(image.len() as u64),
        expected_hash_hex: digest.to_hex(),
        signature: Ed25519Signer::sign_digest(&digest, &pair.signing_key),
        public_key_ref: pair.public_key.identifier.clone(),
        version: args.version.clone(),
    };

    let out = manifest_beside(&args.image, args.out.as_ref());
    tokio::fs::write(&out, manifest.to_json()?).await?;
    info!(manifest = %out.display(), sha256 = %digest, "release signed");

    output::print_success(
        &format!("signed {} -> {}", args.image.display(), out.display()),
        serde_json::json!({
            "manifest": out,
            "sha256": digest.to_hex(),
            "size": image.len(),
            "key": manifest.public_key_ref,
        }),
        json,
    );
    Ok(())
}

pub async fn verify(args: &VerifyArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = host::load_config(config_path, Path::new(".")).await?;
    let hardware = args.hardware.as_deref().unwrap_or(&config.hardware_id);
    let manifest_path = manifest_beside(&args.image, args.manifest.as_ref());
    debug!(manifest = %manifest_path.display(), hardware, "verifying release");

    let bytes = tokio::fs::read(&manifest_path).await?;
    let manifest = ManifestValidator::validate(&bytes, hardware)
        .map_err(|e| CliError::InvalidRelease(e.to_string()))?;

    let verifier = FirmwareVerifier::new(
        config
            .key_ring()
            .map_err(|e| CliError::InvalidConfiguration(e.to_string()))?,
    );
    let image = tokio::fs::File::open(&args.image).await?;
    let verified = verifier
        .verify(image, &manifest)
        .await
        .map_err(|e| CliError::ReleaseRejected(e.to_string()))?;

    output::print_success(
        &format!(
            "{} verified: {} bytes, signed by {}",
            args.image.display(),
            verified.size,
            verified.signer
        ),
        serde_json::json!({
            "sha256": verified.digest.to_hex(),
            "size": verified.size,
            "signer": verified.signer,
            "version": manifest.version,
        }),
        json,
    );
    Ok(())
}
