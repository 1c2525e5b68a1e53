//! # inkclock-watchdog
//!
//! Watchdog supervision for the firmware flashing loop.
//!
//! A flash write that hangs must never leave the appliance stuck: the write
//! region is bounded by a watchdog rather than protected by a lock. This crate
//! provides:
//! - [`Watchdog`]: the `arm` / `reset` / `disarm` contract every watchdog backend implements
//! - [`SoftwareWatchdog`]: a deadline-tracking implementation for hosts and tests
//! - [`WatchdogGuard`]: a scoped guard that disarms on every exit path
//! - [`WatchdogToken`]: a snapshot of the armed flag and current deadline
//!
//! ## State Machine
//!
//! ```text
//! Disarmed ──arm()──► Armed ──(no reset within timeout)──► Expired
//!     ▲                 │                                     │
//!     └────disarm()─────┴──────────────disarm()───────────────┘
//! ```
//!
//! An `Expired` hardware watchdog hard-resets the device. Because the
//! partition switch only happens after the guarded write loop completes, the
//! reboot lands on the untouched, previously active firmware.
//!
//! ## Example
//!
//! ```rust
//! use inkclock_watchdog::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), WatchdogError> {
//! let mut watchdog = SoftwareWatchdog::with_default_timeout();
//! {
//!     let mut guard = WatchdogGuard::arm(&mut watchdog, Duration::from_secs(5))?;
//!     guard.reset()?;
//!     assert!(guard.token().armed);
//! }
//! // Dropping the guard disarmed the watchdog.
//! assert!(!watchdog.is_armed());
//! # Ok(())
//! # }
//! ```

#![deny(
    unsafe_op_in_unsafe_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    missing_docs,
    missing_debug_implementations
)]
#![warn(clippy::pedantic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
pub mod guard;
pub mod prelude;
pub mod software_impl;
pub mod state;
pub mod watchdog;

pub use config::WatchdogConfig;
pub use error::{WatchdogError, WatchdogResult};
pub use guard::WatchdogGuard;
pub use software_impl::SoftwareWatchdog;
pub use state::{WatchdogMetrics, WatchdogState, WatchdogStatus};
pub use watchdog::{Watchdog, WatchdogToken};
