//! Firmware update and rollback engine for InkClock
//!
//! This crate installs signed firmware images into the idle half of an A/B
//! flash layout and recovers from bad updates at boot:
//! - Manifest validation with hardware compatibility checked before any image byte
//! - Streaming SHA-256 and Ed25519 verification, hash strictly before signature
//! - Power and memory preflight before anything persistent changes
//! - Settings snapshot before every attempt, restored on rollback
//! - Watchdog-bounded block writes with optional read-back verification
//! - A single atomic boot record write as the point of no return
//! - Boot probation with automatic rollback after repeated failed boots
//!
//! # Architecture
//!
//! - [`orchestrator`]: runs an attempt from local media or the network
//! - [`manifest`]: `firmware_info.json` parsing and hardware matching
//! - [`verifier`]: streaming digest and signature checks
//! - [`preflight`]: supply and heap checks
//! - [`vault`]: settings snapshots and boot metadata backups
//! - [`controller`]: staging writes and the partition switch
//! - [`rollback`]: boot-time probation and rollback
//! - [`partition`]: A/B model and persisted boot record
//! - [`device`], [`storage`], [`transport`]: collaborator contracts
//! - [`directory`], [`sim`]: directory-backed and in-memory collaborators
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use inkclock_firmware_update::prelude::*;
//! use inkclock_watchdog::SoftwareWatchdog;
//!
//! # async fn example() -> Result<(), FirmwareUpdateError> {
//! let parts = DeviceParts {
//!     flash: Arc::new(DirectoryFlash::new("/var/lib/inkclock", 4 << 20)),
//!     watchdog: Box::new(SoftwareWatchdog::with_default_timeout()),
//!     media: Arc::new(DirectoryStore::removable("/media/sd")),
//!     store: Arc::new(DirectoryStore::new("/var/lib/inkclock")),
//!     settings: Arc::new(JsonFileSettings::new("/var/lib/inkclock/settings.json")),
//!     power: Arc::new(StaticPower::new(3700)),
//!     heap: Arc::new(StaticHeap::new(Some(8 << 20))),
//!     system: Arc::new(RecordingSystem::new()),
//!     transport: None,
//! };
//! let orchestrator = UpdateOrchestrator::new(UpdateConfig::default(), parts)?;
//! let result = orchestrator.check_local_media().await?;
//! if !result.is_success() {
//!     println!("update failed: {:?}", result.error);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod controller;
pub mod device;
pub mod directory;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod partition;
pub mod preflight;
pub mod prelude;
pub mod rollback;
pub mod session;
pub mod sim;
pub mod storage;
pub mod transport;
pub mod vault;
pub mod verifier;

pub use config::UpdateConfig;
pub use error::{DeviceError, ErrorKind, FirmwareUpdateError, Result};
pub use manifest::{FirmwareManifest, ManifestFile, ManifestValidator};
pub use orchestrator::{DeviceParts, UpdateOrchestrator, UpdateResult};
pub use partition::{BootRecord, Partition, PartitionPhase, PartitionState};
pub use rollback::{BootAction, DeviceStatus, RollbackController, RollbackReport};
pub use session::{SourceType, StatusCallback, StatusEvent, UpdateSession, UpdateStatus};
pub use vault::{ConfigSnapshot, ConfigVault};
