//! Prelude for inkclock-watchdog.
//!
//! ```rust
//! use inkclock_watchdog::prelude::*;
//!
//! let watchdog = SoftwareWatchdog::with_default_timeout();
//! assert_eq!(watchdog.status(), WatchdogStatus::Disarmed);
//! ```

pub use crate::config::WatchdogConfig;
pub use crate::error::{WatchdogError, WatchdogResult};
pub use crate::guard::WatchdogGuard;
pub use crate::software_impl::SoftwareWatchdog;
pub use crate::state::{WatchdogMetrics, WatchdogState, WatchdogStatus};
pub use crate::watchdog::{Watchdog, WatchdogToken};
