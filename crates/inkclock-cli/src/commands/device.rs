//! Commands against a directory-backed device

use std::path::Path;

use anyhow::Result;
use inkclock_firmware_update::prelude::*;
use serde_json::json;
use tracing::info;

use crate::commands::DeviceArgs;
use crate::error::CliError;
use crate::host::{self, HostDevice};
use crate::output;

pub async fn apply_local(
    args: &DeviceArgs,
    media: &Path,
    config_path: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = host::load_config(config_path, &args.device).await?;
    let device = HostDevice::open(args);
    let mut orchestrator = UpdateOrchestrator::new(config, device.parts(args, media))
        .map_err(|e| CliError::InvalidConfiguration(e.to_string()))?;
    if !json {
        orchestrator = orchestrator.with_status_callback(Box::new(output::print_status_event));
    }

    let result = orchestrator.check_local_media().await?;
    output::print_update_result(&result, json);
    if device.system.reboot_requested() {
        info!(device = %device.root.display(), "device awaits its next boot");
    }

    match result.error {
        None => Ok(()),
        Some(kind) => Err(CliError::UpdateFailed {
            kind: kind.to_string(),
            message: result.message,
        }
        .into()),
    }
}

pub async fn boot(args: &DeviceArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = host::load_config(config_path, &args.device).await?;
    let device = HostDevice::open(args);
    let mut controller = device.rollback_controller(&config);
    if !json {
        controller = controller.with_status_callback(Box::new(output::print_status_event));
    }

    let action = controller.run_boot_check().await?;
    let status = controller.status().await?;
    if json {
        output::print_json(&json!({ "success": true, "action": action, "status": status }));
        return Ok(());
    }

    let message = match action {
        BootAction::Continue => format!("booted partition {}", status.active),
        BootAction::OnProbation { attempt } => format!(
            "booted partition {} on probation (boot {attempt} of {})",
            status.active, config.rollback.max_boot_attempts
        ),
        BootAction::RollbackRequired => format!("rolled back to partition {}", status.active),
    };
    output::print_success(&message, serde_json::Value::Null, false);
    Ok(())
}

pub async fn status(args: &DeviceArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = host::load_config(config_path, &args.device).await?;
    let device = HostDevice::open(args);
    let status = device.rollback_controller(&config).status().await?;
    output::print_device_status(&status, json);
    Ok(())
}

pub async fn mark_valid(args: &DeviceArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = host::load_config(config_path, &args.device).await?;
    let device = HostDevice::open(args);
    let mut controller = device.rollback_controller(&config);
    let was_on_probation = controller.status().await?.on_probation;
    controller.mark_valid().await?;

    let active = controller.status().await?.active;
    let message = if was_on_probation {
        format!("partition {active} marked valid")
    } else {
        format!("partition {active} was already valid")
    };
    output::print_success(&message, json!({ "active": active, "changed": was_on_probation }), json);
    Ok(())
}

pub async fn rollback(args: &DeviceArgs, config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = host::load_config(config_path, &args.device).await?;
    let device = HostDevice::open(args);
    let mut controller = device.rollback_controller(&config);
    if !json {
        controller = controller.with_status_callback(Box::new(output::print_status_event));
    }

    let report = controller.rollback().await?;
    output::print_success(
        &format!("rolled back from {} to {}", report.from, report.to),
        json!({ "report": report }),
        json,
    );
    Ok(())
}
