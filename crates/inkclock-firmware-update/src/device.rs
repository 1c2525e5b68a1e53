//! Hardware collaborators of the update engine
//!
//! Each trait is the narrow contract the engine needs from one piece of the
//! appliance. Directory-backed implementations live in [`crate::directory`],
//! in-memory ones with fault injection in [`crate::sim`].

use std::collections::BTreeMap;

use crate::error::DeviceError;
use crate::partition::{BootRecord, Partition};

/// Flash with two firmware partitions and an atomically written boot record
#[async_trait::async_trait]
pub trait FlashDevice: Send + Sync {
    /// Read the persisted boot record
    async fn read_boot_record(&self) -> Result<BootRecord, DeviceError>;

    /// Replace the boot record in one atomic operation.
    ///
    /// After a power loss the device boots with either the old or the new
    /// record, never a mix.
    async fn write_boot_record(&self, record: &BootRecord) -> Result<(), DeviceError>;

    /// Usable size of a partition in bytes
    async fn partition_capacity(&self, partition: Partition) -> Result<u64, DeviceError>;

    /// Erase a partition before writing
    async fn erase(&self, partition: Partition) -> Result<(), DeviceError>;

    /// Write one block at `offset`
    async fn write_block(
        &self,
        partition: Partition,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    /// Read into `buf` from `offset`, returning the bytes read
    async fn read_block(
        &self,
        partition: Partition,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, DeviceError>;

    /// Boot metadata (image header and bootloader descriptor) of a partition
    async fn read_boot_metadata(&self, partition: Partition) -> Result<Vec<u8>, DeviceError>;

    /// Rewrite a partition's boot metadata
    async fn write_boot_metadata(
        &self,
        partition: Partition,
        data: &[u8],
    ) -> Result<(), DeviceError>;
}

/// Generic key-value settings store; only export and import matter here
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    /// Export the critical settings
    async fn export(&self) -> Result<BTreeMap<String, String>, DeviceError>;

    /// Replace the critical settings
    async fn import(&self, settings: &BTreeMap<String, String>) -> Result<(), DeviceError>;
}

/// Supply voltage sensor
#[async_trait::async_trait]
pub trait PowerMonitor: Send + Sync {
    /// One supply voltage reading in millivolts
    async fn read_millivolts(&self) -> Result<u32, DeviceError>;
}

/// Heap usage probe
pub trait HeapMonitor: Send + Sync {
    /// Largest allocatable free heap in bytes
    fn free_heap_bytes(&self) -> Result<u64, DeviceError>;
}

/// Reboot control
#[async_trait::async_trait]
pub trait SystemControl: Send + Sync {
    /// Orderly restart into the partition named by the boot record
    async fn reboot(&self) -> Result<(), DeviceError>;

    /// Immediate reset, as performed by an expired hardware watchdog
    async fn hard_reset(&self) -> Result<(), DeviceError>;
}
