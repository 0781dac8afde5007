//! Download heap and download objects
//!
//! A user (or repair) download is split into one unfinished download
//! segment per covered file segment. Segments go onto a priority heap; the
//! download loop reserves memory and hands them to the worker pool, where
//! workers race sector fetches until `min_sectors` arrive and the first
//! observer erasure-decodes the segment into the destination.

use bytes::Bytes;
use dxstor_core::{DxError, Hash256, HostId, Result};
use dxstor_filesystem::Snapshot;
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

/// Extra latency target added per segment so earlier segments of a stream
/// are raced harder than later ones.
pub const PER_SEGMENT_LATENCY_STAGGER: Duration = Duration::from_millis(25);

/// Where decoded segment bytes land.
pub trait DownloadDestination: Send {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
}

/// Shared destination handle.
pub type Destination = Arc<Mutex<dyn DownloadDestination>>;

/// In-memory destination used by repair downloads.
pub struct DownloadBuffer {
    pub buf: Vec<u8>,
}

impl DownloadBuffer {
    pub fn new(length: u64) -> Self {
        Self {
            buf: vec![0u8; length as usize],
        }
    }
}

impl DownloadDestination for DownloadBuffer {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let offset = offset as usize;
        if offset + data.len() > self.buf.len() {
            return Err(DxError::Validation(format!(
                "write of {} bytes at {} exceeds buffer of {}",
                data.len(),
                offset,
                self.buf.len()
            )));
        }
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl DownloadDestination for std::fs::File {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        Ok(())
    }
}

/// Parameters for creating a download.
pub struct DownloadParams {
    pub file: Arc<Snapshot>,
    pub destination: Destination,
    /// Byte offset within the file.
    pub offset: u64,
    /// Bytes to download.
    pub length: u64,
    pub latency_target: Duration,
    /// Whether the download loop must reserve memory before distribution
    /// (false when the caller already holds the reservation).
    pub needs_memory: bool,
    pub overdrive: u32,
    pub priority: u64,
}

/// One in-flight download operation.
pub struct Download {
    pub priority: u64,
    pub overdrive: u32,
    pub latency_target: Duration,
    pub start_time: Instant,

    destination: Destination,
    segments_remaining: AtomicU64,
    failed: AtomicBool,
    err: Mutex<Option<DxError>>,
    complete_tx: watch::Sender<bool>,
    complete_rx: watch::Receiver<bool>,
}

impl Download {
    fn new(params: &DownloadParams, segments: u64) -> Arc<Self> {
        let (complete_tx, complete_rx) = watch::channel(false);
        let download = Arc::new(Self {
            priority: params.priority,
            overdrive: params.overdrive,
            latency_target: params.latency_target,
            start_time: Instant::now(),
            destination: params.destination.clone(),
            segments_remaining: AtomicU64::new(segments),
            failed: AtomicBool::new(false),
            err: Mutex::new(None),
            complete_tx,
            complete_rx,
        });
        if segments == 0 {
            let _ = download.complete_tx.send(true);
        }
        download
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_complete(&self) -> bool {
        *self.complete_rx.borrow()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(AtomicOrdering::SeqCst)
    }

    pub fn segments_remaining(&self) -> u64 {
        self.segments_remaining.load(AtomicOrdering::SeqCst)
    }

    /// One segment reached the destination.
    pub(crate) fn segment_done(&self) {
        if self.segments_remaining.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            let _ = self.complete_tx.send(true);
        }
    }

    /// A segment failed; the whole download fails with the first error.
    pub(crate) fn fail(&self, err: DxError) {
        if !self.failed.swap(true, AtomicOrdering::SeqCst) {
            *self.err.lock() = Some(err);
        }
        let _ = self.complete_tx.send(true);
    }

    /// Block until the download finishes, surfacing its error if any.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.complete_rx.clone();
        if rx
            .wait_for(|complete| *complete)
            .await
            .is_err()
        {
            return Err(DxError::Shutdown);
        }
        if self.is_failed() {
            return Err(self
                .err
                .lock()
                .take()
                .unwrap_or_else(|| DxError::Network("download failed".to_string())));
        }
        Ok(())
    }
}

/// Which sector of a segment a given host holds.
#[derive(Debug, Clone, Copy)]
pub struct DownloadSectorInfo {
    pub index: u32,
    pub root: Hash256,
}

/// Worker-synchronized state of one download segment.
pub struct DownloadState {
    pub completed_sectors: Vec<bool>,
    /// true ⇔ a fetch for the sector is in flight or done.
    pub sector_usage: Vec<bool>,
    pub sectors_completed: u32,
    pub sectors_registered: u32,
    pub workers_remaining: u32,
    pub failed_workers: u32,
    pub physical_data: Vec<Option<Bytes>>,
    /// Decode claimed; set exactly once.
    pub recovery_started: bool,
    /// Memory handed back and completion reported.
    pub finished: bool,
    pub memory_allocated: u64,
}

/// One segment of a download that has not finished yet.
pub struct UnfinishedDownloadSegment {
    pub download: Arc<Download>,
    pub file: Arc<Snapshot>,
    pub segment_index: u64,
    /// Host → sector assignment for this segment.
    pub segment_map: HashMap<HostId, DownloadSectorInfo>,

    /// Range of the decoded segment that the download covers.
    pub fetch_offset: u64,
    pub fetch_length: u64,
    /// Offset within the destination to write the range at.
    pub write_offset: u64,

    pub latency_target: Duration,
    pub overdrive: u32,
    pub priority: u64,
    pub needs_memory: bool,
    /// When the download loop handed the segment to workers; the
    /// overdrive gate compares against this.
    pub distributed_at: Mutex<Option<Instant>>,

    state: Mutex<DownloadState>,
}

impl UnfinishedDownloadSegment {
    pub fn state(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock()
    }

    /// How many sector fetches may be in flight right now. Starts at the
    /// missing-sector count and fans out by `overdrive` once the latency
    /// target has passed without the segment completing.
    pub fn allowed_in_flight(&self, state: &DownloadState) -> u32 {
        let missing = self
            .file
            .min_sectors()
            .saturating_sub(state.sectors_completed);
        let distributed_at = *self.distributed_at.lock();
        let overdrive_active = distributed_at
            .map(|at| at.elapsed() >= self.latency_target)
            .unwrap_or(false);
        if overdrive_active {
            missing + self.overdrive
        } else {
            missing
        }
    }

    /// Whether enough sectors arrived to decode; claims the decode for the
    /// caller when it returns true (at most once per segment).
    pub fn try_claim_recovery(state: &mut DownloadState, min_sectors: u32) -> bool {
        if !state.recovery_started && state.sectors_completed >= min_sectors {
            state.recovery_started = true;
            return true;
        }
        false
    }

    /// Whether the segment can no longer reach `min_sectors`.
    pub fn is_doomed(state: &DownloadState, min_sectors: u32) -> bool {
        !state.recovery_started
            && state.sectors_registered == 0
            && state.workers_remaining == 0
            && state.sectors_completed < min_sectors
    }
}

struct DownloadHeapItem(Arc<UnfinishedDownloadSegment>);

impl PartialEq for DownloadHeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DownloadHeapItem {}

impl Ord for DownloadHeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // higher priority first; earlier segments first within a priority
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.segment_index.cmp(&self.0.segment_index))
    }
}

impl PartialOrd for DownloadHeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority heap of download segments awaiting distribution.
pub struct DownloadHeap {
    heap: Mutex<BinaryHeap<DownloadHeapItem>>,
    pub new_downloads: Notify,
}

impl Default for DownloadHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadHeap {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            new_downloads: Notify::new(),
        }
    }

    pub fn push(&self, segment: Arc<UnfinishedDownloadSegment>) {
        self.heap.lock().push(DownloadHeapItem(segment));
        self.new_downloads.notify_one();
    }

    pub fn pop(&self) -> Option<Arc<UnfinishedDownloadSegment>> {
        self.heap.lock().pop().map(|item| item.0)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

/// Create a download over `[offset, offset + length)` of a file and queue
/// one unfinished segment per covered file segment.
pub fn new_download(heap: &DownloadHeap, params: DownloadParams) -> Result<Arc<Download>> {
    let file = params.file.clone();
    if params.offset + params.length > file.file_size() {
        return Err(DxError::Validation(format!(
            "download range [{}, {}) outside file of {} bytes",
            params.offset,
            params.offset + params.length,
            file.file_size()
        )));
    }
    if params.length == 0 {
        return Ok(Download::new(&params, 0));
    }

    let segment_size = file.segment_size();
    let (start_index, start_offset) = file.segment_index_by_offset(params.offset);
    let (mut end_index, end_offset) = file.segment_index_by_offset(params.offset + params.length);
    if end_index > 0 && end_offset == 0 {
        end_index -= 1;
    }

    let download = Download::new(&params, end_index - start_index + 1);

    let mut write_offset = 0u64;
    for index in start_index..=end_index {
        // host → sector map; a host never holds two sectors of one segment
        let mut segment_map = HashMap::new();
        for (sector_index, slot) in file.sectors(index)?.iter().enumerate() {
            if let Some(sector) = slot {
                if segment_map
                    .insert(
                        sector.host_id,
                        DownloadSectorInfo {
                            index: sector_index as u32,
                            root: sector.merkle_root,
                        },
                    )
                    .is_some()
                {
                    error!(
                        segment = index,
                        host = %sector.host_id,
                        "host holds multiple sectors of one segment"
                    );
                }
            }
        }

        let fetch_offset = if index == start_index { start_offset } else { 0 };
        let fetch_length = if index == end_index && end_offset != 0 {
            end_offset - fetch_offset
        } else {
            segment_size - fetch_offset
        };

        let n = file.num_sectors() as usize;
        let segment = Arc::new(UnfinishedDownloadSegment {
            download: download.clone(),
            file: file.clone(),
            segment_index: index,
            segment_map,
            fetch_offset,
            fetch_length,
            write_offset,
            latency_target: params.latency_target
                + PER_SEGMENT_LATENCY_STAGGER * (index - start_index) as u32,
            overdrive: params.overdrive,
            priority: params.priority,
            needs_memory: params.needs_memory,
            distributed_at: Mutex::new(None),
            state: Mutex::new(DownloadState {
                completed_sectors: vec![false; n],
                sector_usage: vec![false; n],
                sectors_completed: 0,
                sectors_registered: 0,
                workers_remaining: 0,
                failed_workers: 0,
                physical_data: vec![None; n],
                recovery_started: false,
                finished: false,
                memory_allocated: 0,
            }),
        });
        write_offset += fetch_length;
        heap.push(segment);
    }
    debug!(
        segments = end_index - start_index + 1,
        offset = params.offset,
        length = params.length,
        "download queued"
    );
    Ok(download)
}
