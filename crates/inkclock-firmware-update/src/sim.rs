//! In-memory device parts with fault injection
//!
//! Used by the test suites and by host tooling that needs a power, heap or
//! reboot stand-in. Locks are never held across an `.await`.

use std::collections::{BTreeMap, VecDeque};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::{info, warn};

use crate::device::{FlashDevice, HeapMonitor, PowerMonitor, SettingsStore, SystemControl};
use crate::error::DeviceError;
use crate::partition::{BootRecord, Partition};
use crate::storage::{FileReader, FileStore, FileWriter, RemovableMedia, normalize_path};
use crate::transport::{ByteStream, Download, FirmwareTransport};

#[derive(Debug)]
struct FlashInner {
    capacity: u64,
    partitions: BTreeMap<Partition, Vec<u8>>,
    metadata: BTreeMap<Partition, Vec<u8>>,
    record: BootRecord,
    bytes_written: BTreeMap<Partition, u64>,
    blocks_written: u64,
    record_writes: u32,
    fail_after_blocks: Option<u64>,
    write_delay: Option<Duration>,
    corrupt_writes: bool,
    fail_record_writes: bool,
}

/// Two partitions and a boot record held in memory
#[derive(Debug)]
pub struct MemoryFlash {
    inner: Mutex<FlashInner>,
}

impl MemoryFlash {
    /// Flash with `capacity` bytes per partition, booting A
    pub fn new(capacity: u64) -> Self {
        Self::with_record(capacity, BootRecord::initial(Partition::A))
    }

    /// Flash starting from `record`
    pub fn with_record(capacity: u64, record: BootRecord) -> Self {
        Self {
            inner: Mutex::new(FlashInner {
                capacity,
                partitions: BTreeMap::new(),
                metadata: BTreeMap::new(),
                record,
                bytes_written: BTreeMap::new(),
                blocks_written: 0,
                record_writes: 0,
                fail_after_blocks: None,
                write_delay: None,
                corrupt_writes: false,
                fail_record_writes: false,
            }),
        }
    }

    /// Fail every block write after the first `blocks` succeed
    pub fn fail_after_blocks(&self, blocks: u64) {
        let mut inner = self.inner.lock();
        inner.fail_after_blocks = Some(inner.blocks_written.saturating_add(blocks));
    }

    /// Delay every block write by `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.lock().write_delay = Some(delay);
    }

    /// Flip a bit in every block written
    pub fn corrupt_writes(&self, corrupt: bool) {
        self.inner.lock().corrupt_writes = corrupt;
    }

    /// Make boot record writes fail
    pub fn fail_record_writes(&self, fail: bool) {
        self.inner.lock().fail_record_writes = fail;
    }

    /// Replace a partition's boot metadata
    pub fn set_boot_metadata(&self, partition: Partition, data: Vec<u8>) {
        self.inner.lock().metadata.insert(partition, data);
    }

    /// A partition's boot metadata
    pub fn boot_metadata(&self, partition: Partition) -> Vec<u8> {
        self.inner.lock().metadata.get(&partition).cloned().unwrap_or_default()
    }

    /// Fill a partition directly, bypassing the write counters
    pub fn load_partition(&self, partition: Partition, data: Vec<u8>) {
        self.inner.lock().partitions.insert(partition, data);
    }

    /// Contents of a partition
    pub fn partition_bytes(&self, partition: Partition) -> Vec<u8> {
        self.inner.lock().partitions.get(&partition).cloned().unwrap_or_default()
    }

    /// Bytes written to `partition` through `write_block`
    pub fn bytes_written(&self, partition: Partition) -> u64 {
        self.inner.lock().bytes_written.get(&partition).copied().unwrap_or(0)
    }

    /// Bytes written to both partitions
    pub fn total_bytes_written(&self) -> u64 {
        self.inner.lock().bytes_written.values().sum()
    }

    /// Boot record writes performed
    pub fn record_writes(&self) -> u32 {
        self.inner.lock().record_writes
    }

    /// Current boot record
    pub fn boot_record(&self) -> BootRecord {
        self.inner.lock().record.clone()
    }

    /// What the bootloader would do after a hard reset
    pub fn power_cycle(&self) -> BootRecord {
        self.boot_record()
    }
}

fn bounds(offset: u64, len: usize, capacity: u64) -> Result<(usize, usize), DeviceError> {
    let out_of_bounds = || DeviceError::OutOfBounds {
        offset,
        len,
        capacity,
    };
    let end = offset.checked_add(len as u64).ok_or_else(out_of_bounds)?;
    if end > capacity {
        return Err(out_of_bounds());
    }
    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end = usize::try_from(end).map_err(|_| out_of_bounds())?;
    Ok((start, end))
}

#[async_trait::async_trait]
impl FlashDevice for MemoryFlash {
    async fn read_boot_record(&self) -> Result<BootRecord, DeviceError> {
        Ok(self.inner.lock().record.clone())
    }

    async fn write_boot_record(&self, record: &BootRecord) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.fail_record_writes {
            return Err(DeviceError::fault("boot record write rejected"));
        }
        inner.record = record.clone();
        inner.record_writes += 1;
        Ok(())
    }

    async fn partition_capacity(&self, _partition: Partition) -> Result<u64, DeviceError> {
        Ok(self.inner.lock().capacity)
    }

    async fn erase(&self, partition: Partition) -> Result<(), DeviceError> {
        self.inner.lock().partitions.insert(partition, Vec::new());
        Ok(())
    }

    async fn write_block(
        &self,
        partition: Partition,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let delay = self.inner.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if inner
            .fail_after_blocks
            .is_some_and(|limit| inner.blocks_written >= limit)
        {
            return Err(DeviceError::fault(format!(
                "injected write failure at offset {offset}"
            )));
        }
        let (start, end) = bounds(offset, data.len(), inner.capacity)?;
        let corrupt = inner.corrupt_writes;
        let image = inner.partitions.entry(partition).or_default();
        if image.len() < end {
            image.resize(end, 0xFF);
        }
        if let Some(target) = image.get_mut(start..end) {
            target.copy_from_slice(data);
            if corrupt && let Some(first) = target.first_mut() {
                *first ^= 0x01;
            }
        }
        *inner.bytes_written.entry(partition).or_default() += data.len() as u64;
        inner.blocks_written += 1;
        Ok(())
    }

    async fn read_block(
        &self,
        partition: Partition,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, DeviceError> {
        let inner = self.inner.lock();
        let (start, _) = bounds(offset, buf.len(), inner.capacity)?;
        let image = inner.partitions.get(&partition).map(Vec::as_slice).unwrap_or_default();
        let available = image.get(start..).unwrap_or_default();
        let n = available.len().min(buf.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..n), available.get(..n)) {
            dst.copy_from_slice(src);
        }
        Ok(n)
    }

    async fn read_boot_metadata(&self, partition: Partition) -> Result<Vec<u8>, DeviceError> {
        Ok(self.boot_metadata(partition))
    }

    async fn write_boot_metadata(
        &self,
        partition: Partition,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.set_boot_metadata(partition, data.to_vec());
        Ok(())
    }
}

type SharedFiles = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Flat file store held in memory; optionally removable
#[derive(Debug)]
pub struct MemoryStore {
    files: SharedFiles,
    mounted: AtomicBool,
    fail_writes: AtomicBool,
    mounts: AtomicU32,
    unmounts: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Internal storage; always mounted
    pub fn new() -> Self {
        Self {
            files: Arc::default(),
            mounted: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            mounts: AtomicU32::new(0),
            unmounts: AtomicU32::new(0),
        }
    }

    /// Removable media; unmounted until [`RemovableMedia::mount`]
    pub fn removable() -> Self {
        let store = Self::new();
        store.mounted.store(false, Ordering::Release);
        store
    }

    /// Place a file, regardless of mount state
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.files.lock().insert(key(path), data.into());
    }

    /// Whether a file exists, regardless of mount state
    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().contains_key(&key(path))
    }

    /// File contents, regardless of mount state
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(&key(path)).cloned()
    }

    /// Make writes and file creation fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Whether the store is mounted
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Number of mount and unmount calls
    pub fn mount_counts(&self) -> (u32, u32) {
        (
            self.mounts.load(Ordering::Acquire),
            self.unmounts.load(Ordering::Acquire),
        )
    }

    fn resolve(&self, path: &str) -> Result<String, DeviceError> {
        if !self.is_mounted() {
            return Err(DeviceError::NotMounted);
        }
        Ok(normalize_path(path)?.to_string_lossy().into_owned())
    }

    fn check_writable(&self) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(DeviceError::fault("storage is read-only"));
        }
        Ok(())
    }
}

fn key(path: &str) -> String {
    normalize_path(path).map_or_else(|_| path.to_string(), |p| p.to_string_lossy().into_owned())
}

fn not_found(path: &str) -> DeviceError {
    DeviceError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
}

#[async_trait::async_trait]
impl FileStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool, DeviceError> {
        let key = self.resolve(path)?;
        Ok(self.files.lock().contains_key(&key))
    }

    async fn len(&self, path: &str) -> Result<u64, DeviceError> {
        let key = self.resolve(path)?;
        self.files
            .lock()
            .get(&key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| not_found(path))
    }

    async fn open(&self, path: &str) -> Result<FileReader, DeviceError> {
        let data = self.read_all(path).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn create(&self, path: &str) -> Result<FileWriter, DeviceError> {
        let key = self.resolve(path)?;
        self.check_writable()?;
        self.files.lock().insert(key.clone(), Vec::new());
        Ok(Box::new(MemoryWriter {
            files: Arc::clone(&self.files),
            key,
        }))
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let key = self.resolve(path)?;
        self.files.lock().get(&key).cloned().ok_or_else(|| not_found(path))
    }

    async fn write_all(&self, path: &str, data: &[u8]) -> Result<(), DeviceError> {
        let key = self.resolve(path)?;
        self.check_writable()?;
        self.files.lock().insert(key, data.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<bool, DeviceError> {
        let key = self.resolve(path)?;
        Ok(self.files.lock().remove(&key).is_some())
    }
}

#[async_trait::async_trait]
impl RemovableMedia for MemoryStore {
    async fn mount(&self) -> Result<(), DeviceError> {
        self.mounts.fetch_add(1, Ordering::AcqRel);
        self.mounted.store(true, Ordering::Release);
        Ok(())
    }

    async fn unmount(&self) -> Result<(), DeviceError> {
        self.unmounts.fetch_add(1, Ordering::AcqRel);
        self.mounted.store(false, Ordering::Release);
        Ok(())
    }
}

/// Appends to one entry of a [`MemoryStore`]
struct MemoryWriter {
    files: SharedFiles,
    key: String,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.files
            .lock()
            .entry(self.key.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Settings held in memory
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
    fail_import: AtomicBool,
}

impl MemorySettings {
    /// Store holding `values`
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values: Mutex::new(values),
            fail_import: AtomicBool::new(false),
        }
    }

    /// Current values
    pub fn current(&self) -> BTreeMap<String, String> {
        self.values.lock().clone()
    }

    /// Change one value
    pub fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    /// Make imports fail
    pub fn fail_import(&self, fail: bool) {
        self.fail_import.store(fail, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettings {
    async fn export(&self) -> Result<BTreeMap<String, String>, DeviceError> {
        Ok(self.current())
    }

    async fn import(&self, settings: &BTreeMap<String, String>) -> Result<(), DeviceError> {
        if self.fail_import.load(Ordering::Acquire) {
            return Err(DeviceError::fault("settings store rejected import"));
        }
        *self.values.lock() = settings.clone();
        Ok(())
    }
}

/// Supply that always reads the same voltage
#[derive(Debug)]
pub struct StaticPower {
    millivolts: u32,
    reads: AtomicU32,
}

impl StaticPower {
    /// Supply reading `millivolts`
    pub fn new(millivolts: u32) -> Self {
        Self {
            millivolts,
            reads: AtomicU32::new(0),
        }
    }

    /// Readings taken so far
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl PowerMonitor for StaticPower {
    async fn read_millivolts(&self) -> Result<u32, DeviceError> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        Ok(self.millivolts)
    }
}

/// Supply replaying a fixed sequence; `None` entries and an exhausted
/// script read as sensor failures
#[derive(Debug)]
pub struct ScriptedPower {
    script: Mutex<VecDeque<Option<u32>>>,
}

impl ScriptedPower {
    /// Supply replaying `script`
    pub fn new(script: Vec<Option<u32>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait::async_trait]
impl PowerMonitor for ScriptedPower {
    async fn read_millivolts(&self) -> Result<u32, DeviceError> {
        self.script
            .lock()
            .pop_front()
            .flatten()
            .ok_or_else(|| DeviceError::fault("voltage sensor unavailable"))
    }
}

/// Heap probe with a fixed answer; `None` reads as a probe failure
#[derive(Debug, Clone, Copy)]
pub struct StaticHeap {
    free: Option<u64>,
}

impl StaticHeap {
    /// Probe reporting `free` bytes
    pub fn new(free: Option<u64>) -> Self {
        Self { free }
    }
}

impl HeapMonitor for StaticHeap {
    fn free_heap_bytes(&self) -> Result<u64, DeviceError> {
        self.free.ok_or_else(|| DeviceError::fault("heap probe unavailable"))
    }
}

/// Records reboot requests instead of performing them
#[derive(Debug, Default)]
pub struct RecordingSystem {
    reboots: AtomicU32,
    hard_resets: AtomicU32,
}

impl RecordingSystem {
    /// Fresh recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Orderly reboots requested
    pub fn reboots(&self) -> u32 {
        self.reboots.load(Ordering::Acquire)
    }

    /// Hard resets requested
    pub fn hard_resets(&self) -> u32 {
        self.hard_resets.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl SystemControl for RecordingSystem {
    async fn reboot(&self) -> Result<(), DeviceError> {
        self.reboots.fetch_add(1, Ordering::AcqRel);
        info!("reboot requested");
        Ok(())
    }

    async fn hard_reset(&self) -> Result<(), DeviceError> {
        self.hard_resets.fetch_add(1, Ordering::AcqRel);
        warn!("hard reset requested");
        Ok(())
    }
}

/// One scripted reply of [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Full body, delivered in `chunk_size` pieces
    Body {
        /// Body bytes
        data: Vec<u8>,
        /// Chunk size
        chunk_size: usize,
    },
    /// Delivers the first `sent` bytes, then never answers again
    Stall {
        /// Declared body
        data: Vec<u8>,
        /// Bytes delivered before stalling
        sent: usize,
    },
    /// Declares the full length but closes after `sent` bytes
    Truncated {
        /// Declared body
        data: Vec<u8>,
        /// Bytes delivered before closing
        sent: usize,
    },
    /// Request fails outright
    Refused(String),
}

impl ScriptedResponse {
    /// Whole body in 1 KiB chunks
    pub fn body(data: impl Into<Vec<u8>>) -> Self {
        Self::Body {
            data: data.into(),
            chunk_size: 1024,
        }
    }
}

/// Transport answering from per-URL scripts
///
/// Queued responses are used first; afterwards the URL's fixed body is
/// served, and unknown URLs are refused.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    queued: Mutex<BTreeMap<String, VecDeque<ScriptedResponse>>>,
    fixed: Mutex<BTreeMap<String, Vec<u8>>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedTransport {
    /// Transport with no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Always serve `data` at `url` once the queue is empty
    pub fn serve(&self, url: &str, data: impl Into<Vec<u8>>) {
        self.fixed.lock().insert(url.to_string(), data.into());
    }

    /// Queue one response for `url`
    pub fn respond(&self, url: &str, response: ScriptedResponse) {
        self.queued
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// Requests made for `url`
    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|(u, _)| u == url).count()
    }

    /// Bearer tokens sent, in request order
    pub fn bearers(&self) -> Vec<Option<String>> {
        self.requests.lock().iter().map(|(_, b)| b.clone()).collect()
    }
}

fn chunked(data: &[u8], chunk_size: usize) -> VecDeque<Vec<u8>> {
    data.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect()
}

#[async_trait::async_trait]
impl FirmwareTransport for ScriptedTransport {
    async fn get(&self, url: &str, bearer: Option<&str>) -> Result<Download, DeviceError> {
        self.requests
            .lock()
            .push((url.to_string(), bearer.map(str::to_string)));

        let queued = self.queued.lock().get_mut(url).and_then(VecDeque::pop_front);
        let response = match queued {
            Some(response) => response,
            None => match self.fixed.lock().get(url) {
                Some(data) => ScriptedResponse::body(data.clone()),
                None => ScriptedResponse::Refused(format!("404 {url}")),
            },
        };

        let (declared, chunks, stall) = match response {
            ScriptedResponse::Body { data, chunk_size } => {
                (data.len(), chunked(&data, chunk_size), false)
            }
            ScriptedResponse::Stall { data, sent } => {
                (data.len(), chunked(data.get(..sent).unwrap_or(data.as_slice()), 1024), true)
            }
            ScriptedResponse::Truncated { data, sent } => {
                (data.len(), chunked(data.get(..sent).unwrap_or(data.as_slice()), 1024), false)
            }
            ScriptedResponse::Refused(reason) => return Err(DeviceError::fault(reason)),
        };
        Ok(Download {
            content_length: Some(declared as u64),
            body: Box::new(ScriptedBody { chunks, stall }),
        })
    }
}

struct ScriptedBody {
    chunks: VecDeque<Vec<u8>>,
    stall: bool,
}

#[async_trait::async_trait]
impl ByteStream for ScriptedBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeviceError> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Ok(Some(chunk));
        }
        if self.stall {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }
}
