//! Command definitions and handlers

pub mod device;
pub mod keys;
pub mod release;

use std::path::PathBuf;

use clap::Args;

/// Location and simulated supply of a directory-backed device
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Directory holding the partitions, boot record and settings
    #[arg(long, env = "INKCLOCK_DEVICE_DIR")]
    pub device: PathBuf,

    /// Capacity of each partition in bytes
    #[arg(long, default_value_t = 4 << 20)]
    pub capacity: u64,

    /// Supply voltage reported to the preflight check, in millivolts
    #[arg(long, default_value_t = 3700)]
    pub supply_mv: u32,

    /// Free heap reported to the preflight check, in bytes
    #[arg(long, default_value_t = 8 << 20)]
    pub free_heap: u64,
}

#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    /// Key id that manifests reference
    #[arg(long, default_value = "release")]
    pub id: String,

    /// Directory the key file is written to
    #[arg(long, default_value = ".")]
    pub out: PathBuf,

    /// Replace an existing key file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SignArgs {
    /// Firmware image to sign
    #[arg(long)]
    pub image: PathBuf,

    /// Key file written by `keygen`
    #[arg(long)]
    pub key: PathBuf,

    /// Supported hardware id; repeat for several
    #[arg(long = "hardware", required = true)]
    pub hardware: Vec<String>,

    /// Release version recorded in the manifest
    #[arg(long)]
    pub version: Option<String>,

    /// Manifest output path (defaults to firmware_info.json next to the image)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Firmware image
    #[arg(long)]
    pub image: PathBuf,

    /// Manifest (defaults to firmware_info.json next to the image)
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Hardware id to check against (defaults to the configured one)
    #[arg(long)]
    pub hardware: Option<String>,
}

/// Manifest path beside `image` when none is given
pub fn manifest_beside(image: &std::path::Path, explicit: Option<&PathBuf>) -> PathBuf {
    match explicit {
        Some(path) => path.clone(),
        None => image.with_file_name("firmware_info.json"),
    }
}
