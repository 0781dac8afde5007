//! Upload heap
//!
//! A priority queue of segments that need sectors uploaded, shared by the
//! repair loop (producer) and the fetch-and-repair tasks (consumer). The
//! ordering key is `(priority DESC, unstuck first, health ASC, segment
//! index ASC)`: explicit priorities beat everything, then unstuck segments
//! beat stuck ones, then the least healthy segment wins.
//!
//! `UnfinishedUploadSegment` is the central runtime object of the upload
//! pipeline. Its mutable state lives behind one mutex; every counter
//! transition a worker makes happens under that lock, and the cleanup pass
//! reconciles the counters into the terminal states (complete, stuck,
//! released).

use dxstor_core::{FileId, HostId};
use dxstor_filesystem::FileEntry;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::worker::Worker;

/// Unique identifier of a segment within the repair machinery.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadSegmentId {
    pub file_id: FileId,
    pub index: u64,
}

impl fmt::Debug for UploadSegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadSegmentId({}, {})", self.file_id, self.index)
    }
}

/// Worker-synchronized state of an unfinished upload segment. All fields
/// are guarded by the segment's mutex.
///
/// Worker transitions:
/// - standby: append self to `workers_standby` (no counter change)
/// - drop: `workers_remaining -= 1`
/// - accept: mark `piece_usage`, `pieces_registered += 1`,
///   `workers_remaining -= 1`, remove own host from `unused_hosts`
/// - upload success: `pieces_registered -= 1`, `pieces_completed += 1`,
///   clear the piece's buffer, release its memory
/// - upload failure: unmark `piece_usage`, `pieces_registered -= 1`,
///   notify standby workers
pub struct UploadState {
    /// true ⇔ the sector is uploaded or a worker is registered for it.
    pub piece_usage: Vec<bool>,
    pub pieces_completed: u32,
    pub pieces_registered: u32,
    /// Workers that still might take a piece of this segment.
    pub workers_remaining: u32,
    /// Set exactly once, when the segment completes.
    pub released: bool,
    pub memory_released: u64,
    /// Hosts not yet storing any piece of this segment.
    pub unused_hosts: HashSet<HostId>,
    /// Workers parked until a piece frees up.
    pub workers_standby: Vec<Arc<Worker>>,
    pub logical_data: Option<Bytes>,
    pub physical_data: Vec<Option<Bytes>>,
}

/// A segment known to need repair, together with everything a worker needs
/// to upload its sectors.
pub struct UnfinishedUploadSegment {
    pub id: UploadSegmentId,
    pub file_entry: FileEntry,

    /// Segment index within the file.
    pub index: u64,
    /// Byte offset of the segment within the file.
    pub offset: u64,
    /// Logical bytes of the file covered (shorter for the tail segment).
    pub length: u64,
    pub sector_size: u64,
    pub memory_needed: u64,
    /// Erasure k.
    pub minimum_pieces: u32,
    /// Target piece count; canonically the erasure n.
    pub pieces_needed: u32,

    pub priority: u8,
    /// Stuck flag at push time; orders the heap and gates the
    /// stuck-repair success signal.
    pub stuck: bool,
    /// Whether the stuck loop queued this segment.
    pub stuck_repair: bool,
    /// Health at push time, for heap ordering.
    pub health: u32,

    state: Mutex<UploadState>,
}

impl UnfinishedUploadSegment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: UploadSegmentId,
        file_entry: FileEntry,
        index: u64,
        offset: u64,
        length: u64,
        sector_size: u64,
        minimum_pieces: u32,
        pieces_needed: u32,
        piece_usage: Vec<bool>,
        unused_hosts: HashSet<HostId>,
        stuck: bool,
        stuck_repair: bool,
        health: u32,
    ) -> Arc<Self> {
        let pieces_completed = piece_usage.iter().filter(|u| **u).count() as u32;
        let n = piece_usage.len();
        // logical fetch (k sectors) plus one buffer per physical sector
        let memory_needed = sector_size * (minimum_pieces as u64 + pieces_needed as u64);
        Arc::new(Self {
            id,
            file_entry,
            index,
            offset,
            length,
            sector_size,
            memory_needed,
            minimum_pieces,
            pieces_needed,
            priority: 0,
            stuck,
            stuck_repair,
            health,
            state: Mutex::new(UploadState {
                piece_usage,
                pieces_completed,
                pieces_registered: 0,
                workers_remaining: 0,
                released: false,
                memory_released: 0,
                unused_hosts,
                workers_standby: Vec::new(),
                logical_data: None,
                physical_data: vec![None; n],
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, UploadState> {
        self.state.lock()
    }

    /// Terminal check: either the upload finished or the workers ran out.
    pub fn segment_complete(state: &UploadState, pieces_needed: u32) -> bool {
        if state.pieces_completed >= pieces_needed && state.pieces_registered == 0 {
            return true;
        }
        state.workers_remaining == 0 && state.pieces_registered == 0
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        Self::segment_complete(&state, self.pieces_needed)
    }

    /// Drain the standby worker list for re-notification.
    pub fn take_standby_workers(&self) -> Vec<Arc<Worker>> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.workers_standby)
    }
}

impl fmt::Debug for UnfinishedUploadSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnfinishedUploadSegment")
            .field("id", &self.id)
            .field("stuck", &self.stuck)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

struct UploadHeapItem(Arc<UnfinishedUploadSegment>);

impl PartialEq for UploadHeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for UploadHeapItem {}

impl Ord for UploadHeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = &self.0;
        let b = &other.0;
        // greater = popped first
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.stuck.cmp(&a.stuck)) // unstuck (false) first
            .then_with(|| b.health.cmp(&a.health)) // lower health first
            .then_with(|| b.index.cmp(&a.index)) // lower index first
            .then_with(|| b.id.cmp(&a.id))
    }
}

impl PartialOrd for UploadHeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct UploadHeapInner {
    heap: BinaryHeap<UploadHeapItem>,
    /// Segments currently sitting in the heap.
    pending: HashSet<UploadSegmentId>,
    /// Segments popped and being repaired right now.
    repairing: HashSet<UploadSegmentId>,
}

/// The shared upload heap plus its wake signals.
pub struct UploadHeap {
    inner: Mutex<UploadHeapInner>,
    /// A segment was pushed.
    pub segment_coming: Notify,
    /// A new upload entered the system.
    pub new_uploads: Notify,
}

impl Default for UploadHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadHeap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UploadHeapInner {
                heap: BinaryHeap::new(),
                pending: HashSet::new(),
                repairing: HashSet::new(),
            }),
            segment_coming: Notify::new(),
            new_uploads: Notify::new(),
        }
    }

    /// Push a segment unless it is already queued or being repaired.
    pub fn push(&self, segment: Arc<UnfinishedUploadSegment>) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.contains(&segment.id) || inner.repairing.contains(&segment.id) {
            return false;
        }
        inner.pending.insert(segment.id);
        inner.heap.push(UploadHeapItem(segment));
        drop(inner);
        self.segment_coming.notify_one();
        true
    }

    /// Pop the best segment and mark it as being repaired.
    pub fn pop(&self) -> Option<Arc<UnfinishedUploadSegment>> {
        let mut inner = self.inner.lock();
        let item = inner.heap.pop()?;
        inner.pending.remove(&item.0.id);
        inner.repairing.insert(item.0.id);
        Some(item.0)
    }

    /// Forget a finished repair so the segment can be queued again.
    pub fn remove_repairing(&self, id: &UploadSegmentId) {
        self.inner.lock().repairing.remove(id);
    }

    /// Whether the segment is queued or being repaired.
    pub fn is_tracked(&self, id: &UploadSegmentId) -> bool {
        let inner = self.inner.lock();
        inner.pending.contains(id) || inner.repairing.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn repairing_count(&self) -> usize {
        self.inner.lock().repairing.len()
    }
}
