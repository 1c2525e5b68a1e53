//! inkclock-ota - InkClock firmware release and recovery CLI
//!
//! Signs release images, installs them into a directory-backed device and
//! drives the boot-time probation and rollback logic from the command line.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod host;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{DeviceArgs, KeygenArgs, SignArgs, VerifyArgs};
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "inkclock-ota")]
#[command(about = "InkClock firmware release and recovery CLI")]
#[command(version)]
#[command(long_about = "
inkclock-ota signs firmware releases and installs them into an A/B device
image kept in a directory. The same boot-time probation and rollback logic
the clock runs can be driven step by step with the boot, status and
mark-valid commands.

Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output in JSON format for machine parsing
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Update configuration file (defaults to update_config.json in the device directory)
    #[arg(long, global = true, env = "INKCLOCK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an Ed25519 release signing key
    Keygen(KeygenArgs),

    /// Write a signed firmware_info.json for an image
    Sign(SignArgs),

    /// Check an image and manifest against the trusted keys without installing
    Verify(VerifyArgs),

    /// Install firmware.bin from a media directory
    ApplyLocal {
        #[command(flatten)]
        device: DeviceArgs,

        /// Directory standing in for the removable media
        #[arg(long)]
        media: PathBuf,
    },

    /// Run the boot-time probation check, rolling back if needed
    Boot {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Show the active partition and probation state
    Status {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Accept the running firmware and end probation
    MarkValid {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Return to the previous partition now
    Rollback {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("inkclock_ota={log_level},inkclock_firmware_update={log_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match execute_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::UpdateFailed { .. }) => 2,
        Some(CliError::ReleaseRejected(_)) | Some(CliError::InvalidRelease(_)) => 3,
        Some(CliError::InvalidConfiguration(_)) | Some(CliError::JsonError(_)) => 4,
        Some(CliError::KeyFile(_)) => 5,
        _ => 1,
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match &cli.command {
        Commands::Keygen(args) => commands::keys::keygen(args, cli.json).await,
        Commands::Sign(args) => commands::release::sign(args, cli.json).await,
        Commands::Verify(args) => commands::release::verify(args, config, cli.json).await,
        Commands::ApplyLocal { device, media } => {
            commands::device::apply_local(device, media, config, cli.json).await
        }
        Commands::Boot { device } => commands::device::boot(device, config, cli.json).await,
        Commands::Status { device } => commands::device::status(device, config, cli.json).await,
        Commands::MarkValid { device } => {
            commands::device::mark_valid(device, config, cli.json).await
        }
        Commands::Rollback { device } => {
            commands::device::rollback(device, config, cli.json).await
        }
    }
}
