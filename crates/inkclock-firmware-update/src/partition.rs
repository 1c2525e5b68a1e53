//! A/B partition model
//!
//! The boot record is the only persisted partition state. It is written in a
//! single atomic operation, which makes that write the point of no return for
//! an update.

use serde::{Deserialize, Serialize};

/// Firmware partition identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Partition {
    /// Partition A
    A,
    /// Partition B
    B,
}

impl Partition {
    /// Get the other partition
    pub fn other(self) -> Self {
        match self {
            Partition::A => Partition::B,
            Partition::B => Partition::A,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::A => write!(f, "A"),
            Partition::B => write!(f, "B"),
        }
    }
}

/// Which partition boots and which one receives the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    /// Booted partition
    pub active: Partition,
    /// Write target; always the complement of `active`
    pub staging: Partition,
}

impl PartitionState {
    /// State with `active` booting
    pub fn with_active(active: Partition) -> Self {
        Self {
            active,
            staging: active.other(),
        }
    }
}

/// Persisted boot selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    /// Partition the bootloader starts
    pub active: Partition,
    /// Partition that was active before the last switch
    pub previous: Option<Partition>,
    /// New firmware has not yet been marked valid
    pub pending_verify: bool,
    /// Boots since the switch while `pending_verify` was set
    pub boot_attempts: u32,
    /// Incremented on every write
    pub sequence: u64,
    /// SHA-256 of the image in `active`, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
    /// Time of the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BootRecord {
    /// Factory record: `active` boots, nothing pending
    pub fn initial(active: Partition) -> Self {
        Self {
            active,
            previous: None,
            pending_verify: false,
            boot_attempts: 0,
            sequence: 0,
            image_sha256: None,
            updated_at: None,
        }
    }

    /// Current partition state
    pub fn state(&self) -> PartitionState {
        PartitionState::with_active(self.active)
    }

    /// Whether the running firmware is on probation
    pub fn on_probation(&self) -> bool {
        self.pending_verify
    }

    /// Record that boots `target` on probation
    pub fn switched_to(&self, target: Partition, image_sha256: String) -> Self {
        Self {
            active: target,
            previous: Some(self.active),
            pending_verify: true,
            boot_attempts: 0,
            sequence: self.sequence.saturating_add(1),
            image_sha256: Some(image_sha256),
            updated_at: Some(chrono::Utc::now()),
        }
    }

    /// Record that returns to the previous partition, if there is one
    pub fn rolled_back(&self) -> Option<Self> {
        let previous = self.previous?;
        Some(Self {
            active: previous,
            previous: Some(self.active),
            pending_verify: false,
            boot_attempts: 0,
            sequence: self.sequence.saturating_add(1),
            image_sha256: None,
            updated_at: Some(chrono::Utc::now()),
        })
    }

    /// Record with one more probation boot counted
    pub fn with_boot_attempt(&self) -> Self {
        Self {
            boot_attempts: self.boot_attempts.saturating_add(1),
            sequence: self.sequence.saturating_add(1),
            updated_at: Some(chrono::Utc::now()),
            ..self.clone()
        }
    }

    /// Record with probation cleared
    pub fn validated(&self) -> Self {
        Self {
            pending_verify: false,
            boot_attempts: 0,
            sequence: self.sequence.saturating_add(1),
            updated_at: Some(chrono::Utc::now()),
            ..self.clone()
        }
    }
}

/// Partition controller phases
///
/// ```text
/// Idle -> BackingUpPartition -> Writing -> VerifyingWrite -> Switching -> Done
///   \__________________\___________\____________\______________\-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionPhase {
    /// No operation in progress
    #[default]
    Idle,
    /// Snapshotting the active partition's boot metadata
    BackingUpPartition,
    /// Writing blocks into the staging partition
    Writing,
    /// Re-reading and re-hashing the staging partition
    VerifyingWrite,
    /// Writing the boot record
    Switching,
    /// Boot record switched
    Done,
    /// Aborted; the active partition is untouched
    Failed,
}

impl PartitionPhase {
    /// Whether no further transition is expected in this attempt
    pub fn is_terminal(self) -> bool {
        matches!(self, PartitionPhase::Done | PartitionPhase::Failed)
    }

    /// Whether `next` may follow this phase
    pub fn can_transition_to(self, next: PartitionPhase) -> bool {
        use PartitionPhase::{
            BackingUpPartition, Done, Failed, Idle, Switching, VerifyingWrite, Writing,
        };
        match (self, next) {
            (Done | Failed, Idle) => true,
            (from, Failed) => !from.is_terminal(),
            (Idle, BackingUpPartition | Writing)
            | (BackingUpPartition, Writing)
            | (Writing, VerifyingWrite | Switching)
            | (VerifyingWrite, Switching)
            | (Switching, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PartitionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
