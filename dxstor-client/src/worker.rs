//! Workers
//!
//! One worker per active contract. A worker owns a guarded upload queue and
//! a guarded download queue, prefers download work, and for each upload
//! segment decides accept / standby / drop under the segment's lock. All
//! counter transitions follow the segment-state contract documented on
//! [`UploadState`](crate::uploadheap::UploadState).

use bytes::Bytes;
use dxstor_core::crypto::TAG_SIZE;
use dxstor_core::merkle::{leaves_count, MerkleRangeProof};
use dxstor_core::{merkle_root, DxError, HostId, Result, SectorCipher};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::contracts::{ContractId, ContractMeta, SectorRequest};
use crate::download::UnfinishedDownloadSegment;
use crate::repair::cleanup_upload_segment;
use crate::uploadheap::UnfinishedUploadSegment;
use crate::ClientContext;

/// Base cooldown after an upload failure; doubles per consecutive failure.
const COOLDOWN_BASE: Duration = Duration::from_secs(3);

/// Upper bound on the failure cooldown.
const COOLDOWN_MAX: Duration = Duration::from_secs(3600);

/// Poll interval while a download segment is gated behind the overdrive
/// latency target.
const OVERDRIVE_POLL: Duration = Duration::from_millis(50);

enum UploadDecision {
    Drop,
    Standby,
    Accept { index: u32, data: Bytes },
}

enum DownloadDecision {
    Drop,
    Gated,
    Fetch { index: u32, root: dxstor_core::Hash256 },
}

/// A long-lived task bound to one contracted host.
pub struct Worker {
    pub contract_id: ContractId,
    pub host_id: HostId,
    ctx: Arc<ClientContext>,

    upload_queue: Mutex<VecDeque<Arc<UnfinishedUploadSegment>>>,
    download_queue: Mutex<VecDeque<Arc<UnfinishedDownloadSegment>>>,
    wake: Notify,
    killed: AtomicBool,

    consecutive_upload_failures: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Worker {
    pub fn new(contract: &ContractMeta, ctx: Arc<ClientContext>) -> Arc<Self> {
        Arc::new(Self {
            contract_id: contract.id,
            host_id: contract.host_id,
            ctx,
            upload_queue: Mutex::new(VecDeque::new()),
            download_queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            killed: AtomicBool::new(false),
            consecutive_upload_failures: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
        })
    }

    /// Ask the worker to exit; it drains both queues before stopping.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Whether upload failures currently bench this worker.
    pub fn on_upload_cooldown(&self) -> bool {
        let until = *self.cooldown_until.lock();
        until.map_or(false, |until| Instant::now() < until)
    }

    fn bench_for(&self, cooldown: Duration) {
        *self.cooldown_until.lock() = Some(Instant::now() + cooldown);
    }

    fn bump_cooldown(&self) {
        let failures = self
            .consecutive_upload_failures
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        let cooldown = COOLDOWN_BASE
            .saturating_mul(1u32 << (failures - 1).min(20))
            .min(COOLDOWN_MAX);
        self.bench_for(cooldown);
        debug!(host = %self.host_id, failures, ?cooldown, "worker on upload cooldown");
    }

    fn reset_cooldown(&self) {
        self.consecutive_upload_failures.store(0, Ordering::SeqCst);
        *self.cooldown_until.lock() = None;
    }

    /// Enqueue an upload segment; killed workers refuse and immediately
    /// give up their share of the segment.
    pub fn queue_upload_segment(self: &Arc<Self>, segment: Arc<UnfinishedUploadSegment>) {
        if self.is_killed() {
            segment.state().workers_remaining -= 1;
            cleanup_upload_segment(&segment, &self.ctx);
            return;
        }
        self.upload_queue.lock().push_back(segment);
        self.wake.notify_one();
    }

    /// Enqueue a download segment; killed workers refuse and give up their
    /// share immediately.
    pub fn queue_download_segment(self: &Arc<Self>, segment: Arc<UnfinishedDownloadSegment>) {
        if self.is_killed() {
            segment.state().workers_remaining -= 1;
            finish_download_segment(&segment, &self.ctx);
            return;
        }
        self.download_queue.lock().push_back(segment);
        self.wake.notify_one();
    }

    /// Worker main loop: drain downloads before uploads, park on the wake
    /// signal, exit by draining both queues on kill or shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.ctx.shutdown.clone();
        debug!(host = %self.host_id, "worker started");
        loop {
            if self.is_killed() || *shutdown.borrow() {
                self.drain();
                debug!(host = %self.host_id, "worker exited");
                return;
            }
            let next_download = self.download_queue.lock().pop_front();
            if let Some(segment) = next_download {
                self.process_download_segment(segment).await;
                continue;
            }
            let next_upload = self.upload_queue.lock().pop_front();
            if let Some(segment) = next_upload {
                self.process_upload_segment(segment).await;
                continue;
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Give up every queued segment: decrement `workers_remaining` and run
    /// the reconciliation so the memory they reserve is released.
    fn drain(&self) {
        let uploads: Vec<_> = self.upload_queue.lock().drain(..).collect();
        for segment in uploads {
            segment.state().workers_remaining -= 1;
            cleanup_upload_segment(&segment, &self.ctx);
        }
        let downloads: Vec<_> = self.download_queue.lock().drain(..).collect();
        for segment in downloads {
            segment.state().workers_remaining -= 1;
            finish_download_segment(&segment, &self.ctx);
        }
    }

    // ===== upload path =====

    async fn process_upload_segment(self: &Arc<Self>, segment: Arc<UnfinishedUploadSegment>) {
        let decision = {
            let mut state = segment.state();
            let complete =
                UnfinishedUploadSegment::segment_complete(&state, segment.pieces_needed);
            let candidate = state.unused_hosts.contains(&self.host_id);
            if complete || state.released || !candidate || self.on_upload_cooldown() {
                state.workers_remaining -= 1;
                UploadDecision::Drop
            } else if state.pieces_completed + state.pieces_registered >= segment.pieces_needed {
                // every open piece is already claimed; park in case one of
                // the registered uploads fails
                state.workers_standby.push(self.clone());
                UploadDecision::Standby
            } else {
                let slot = state
                    .piece_usage
                    .iter()
                    .enumerate()
                    .position(|(i, used)| !*used && state.physical_data[i].is_some());
                match slot {
                    None => {
                        state.workers_remaining -= 1;
                        UploadDecision::Drop
                    }
                    Some(index) => {
                        state.piece_usage[index] = true;
                        state.pieces_registered += 1;
                        state.workers_remaining -= 1;
                        state.unused_hosts.remove(&self.host_id);
                        let data = state.physical_data[index]
                            .clone()
                            .unwrap_or_default();
                        UploadDecision::Accept {
                            index: index as u32,
                            data,
                        }
                    }
                }
            }
        };

        match decision {
            UploadDecision::Standby => {}
            UploadDecision::Drop => cleanup_upload_segment(&segment, &self.ctx),
            UploadDecision::Accept { index, data } => {
                self.upload_piece(&segment, index, data).await;
                cleanup_upload_segment(&segment, &self.ctx);
            }
        }
    }

    async fn upload_piece(&self, segment: &Arc<UnfinishedUploadSegment>, index: u32, data: Bytes) {
        let root = merkle_root(&data);
        let result = self.ctx.host_client.upload_sector(self.host_id, data).await;
        match result {
            Ok(()) => {
                if let Err(e) = segment.file_entry.write().add_sector(
                    segment.index,
                    index,
                    self.host_id,
                    root,
                ) {
                    // the sector is on the host; keep the upload counted
                    error!(
                        id = ?segment.id,
                        sector = index,
                        error = %e,
                        "failed to record uploaded sector"
                    );
                }
                {
                    let mut state = segment.state();
                    state.pieces_registered -= 1;
                    state.pieces_completed += 1;
                    state.physical_data[index as usize] = None;
                    state.memory_released += segment.sector_size;
                }
                self.ctx.memory.return_memory(segment.sector_size);
                self.reset_cooldown();
                debug!(id = ?segment.id, sector = index, host = %self.host_id, "sector uploaded");
            }
            Err(e) => {
                {
                    let mut state = segment.state();
                    state.piece_usage[index as usize] = false;
                    state.pieces_registered -= 1;
                }
                if e.is_shutdown() {
                    // cooperative cancellation: the revert above is all
                    // that is needed, the host did nothing wrong
                    debug!(id = ?segment.id, sector = index, "upload cancelled by shutdown");
                    return;
                }
                warn!(
                    id = ?segment.id,
                    sector = index,
                    host = %self.host_id,
                    error = %e,
                    "sector upload failed"
                );
                if e.is_transient() {
                    self.bump_cooldown();
                } else {
                    // the host rejected us outright; bench until the
                    // contract layer swaps it out
                    self.consecutive_upload_failures.fetch_add(1, Ordering::SeqCst);
                    self.bench_for(COOLDOWN_MAX);
                }
                // a piece opened back up: wake the parked workers
                for standby in segment.take_standby_workers() {
                    standby.queue_upload_segment(segment.clone());
                }
            }
        }
    }

    // ===== download path =====

    async fn process_download_segment(self: &Arc<Self>, segment: Arc<UnfinishedDownloadSegment>) {
        let min_sectors = segment.file.min_sectors();
        let decision = {
            let mut state = segment.state();
            if state.recovery_started || state.finished || segment.download.is_failed() {
                state.workers_remaining -= 1;
                DownloadDecision::Drop
            } else {
                match segment.segment_map.get(&self.host_id) {
                    None => {
                        state.workers_remaining -= 1;
                        DownloadDecision::Drop
                    }
                    Some(info) if state.sector_usage[info.index as usize] => {
                        state.workers_remaining -= 1;
                        DownloadDecision::Drop
                    }
                    Some(info) => {
                        if state.sectors_registered >= segment.allowed_in_flight(&state) {
                            DownloadDecision::Gated
                        } else {
                            state.sector_usage[info.index as usize] = true;
                            state.sectors_registered += 1;
                            DownloadDecision::Fetch {
                                index: info.index,
                                root: info.root,
                            }
                        }
                    }
                }
            }
        };

        match decision {
            DownloadDecision::Drop => finish_download_segment(&segment, &self.ctx),
            DownloadDecision::Gated => {
                // parked behind the overdrive gate; re-examine shortly
                let worker = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(OVERDRIVE_POLL).await;
                    worker.queue_download_segment(segment);
                });
            }
            DownloadDecision::Fetch { index, root } => {
                self.fetch_sector(&segment, index, root, min_sectors).await;
                finish_download_segment(&segment, &self.ctx);
            }
        }
    }

    async fn fetch_sector(
        &self,
        segment: &Arc<UnfinishedDownloadSegment>,
        index: u32,
        root: dxstor_core::Hash256,
        min_sectors: u32,
    ) {
        let result = self.fetch_and_verify_sector(segment, index, root).await;

        // configurable pause after each response; default zero
        let delay = self.ctx.settings.read().download_response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match result {
            Ok(plaintext) => {
                let recover = {
                    let mut state = segment.state();
                    state.completed_sectors[index as usize] = true;
                    state.sectors_completed += 1;
                    state.sectors_registered -= 1;
                    state.workers_remaining -= 1;
                    state.physical_data[index as usize] = Some(plaintext);
                    UnfinishedDownloadSegment::try_claim_recovery(&mut state, min_sectors)
                };
                debug!(
                    segment = segment.segment_index,
                    sector = index,
                    host = %self.host_id,
                    "sector fetched"
                );
                if recover {
                    recover_segment(segment, &self.ctx);
                }
            }
            Err(e) => {
                if e.is_shutdown() {
                    debug!(
                        segment = segment.segment_index,
                        sector = index,
                        "sector fetch cancelled by shutdown"
                    );
                } else {
                    warn!(
                        segment = segment.segment_index,
                        sector = index,
                        host = %self.host_id,
                        error = %e,
                        "sector fetch failed"
                    );
                }
                let mut state = segment.state();
                state.sector_usage[index as usize] = false;
                state.sectors_registered -= 1;
                state.workers_remaining -= 1;
                state.failed_workers += 1;
            }
        }
    }

    /// Issue the ranged read, check the Merkle proof against the stored
    /// root, and decrypt the sector.
    async fn fetch_and_verify_sector(
        &self,
        segment: &Arc<UnfinishedDownloadSegment>,
        index: u32,
        root: dxstor_core::Hash256,
    ) -> Result<Bytes> {
        let stored_length = segment.file.sector_size() as u32 + TAG_SIZE as u32;
        let request = SectorRequest {
            merkle_root: root,
            offset: 0,
            length: stored_length,
            merkle_proof: true,
        };
        let response = self
            .ctx
            .host_client
            .download_sector(self.host_id, request)
            .await?;

        if response.data.len() != stored_length as usize {
            return Err(DxError::Network(format!(
                "host returned {} bytes, expected {}",
                response.data.len(),
                stored_length
            )));
        }
        let num_leaves = leaves_count(stored_length as u64) as usize;
        let proof = MerkleRangeProof {
            hashes: response.proof.clone(),
        };
        if !proof.verify(&response.data, 0, num_leaves, num_leaves, &root)? {
            return Err(DxError::ProofVerificationFailed);
        }

        let key = segment.file.cipher_key()?;
        let cipher = SectorCipher::new(&key)?;
        cipher.decrypt_sector(
            &segment.file.id(),
            segment.segment_index,
            index,
            &response.data,
        )
    }
}

/// Decode a completed segment and write the covered range to the
/// destination. Called by exactly one worker per segment.
fn recover_segment(segment: &Arc<UnfinishedDownloadSegment>, ctx: &Arc<ClientContext>) {
    let slots = {
        let state = segment.state();
        state.physical_data.clone()
    };
    let result = (|| -> Result<()> {
        let coder = dxstor_core::erasure::erasure_coder_by_type(
            segment.file.erasure_code_type(),
            segment.file.min_sectors(),
            segment.file.num_sectors(),
        )?;
        let decoded = coder.recover(&slots, segment.file.segment_size() as usize)?;
        let start = segment.fetch_offset as usize;
        let end = start + segment.fetch_length as usize;
        segment
            .download
            .destination()
            .lock()
            .write_at(segment.write_offset, &decoded[start..end])
    })();

    match result {
        Ok(()) => {
            info!(
                segment = segment.segment_index,
                bytes = segment.fetch_length,
                "segment recovered"
            );
            release_download_memory(segment, ctx);
            segment.download.segment_done();
        }
        Err(e) => {
            error!(segment = segment.segment_index, error = %e, "segment recovery failed");
            release_download_memory(segment, ctx);
            segment.download.fail(e);
        }
    }
}

fn release_download_memory(segment: &Arc<UnfinishedDownloadSegment>, ctx: &Arc<ClientContext>) {
    let to_release = {
        let mut state = segment.state();
        if state.finished {
            return;
        }
        state.finished = true;
        // the buffers themselves drop with the segment
        state.memory_allocated
    };
    if to_release > 0 {
        ctx.memory.return_memory(to_release);
    }
}

/// Reconcile a download segment after a worker transition: if it can no
/// longer reach `min_sectors`, fail it and hand back its memory.
pub fn finish_download_segment(
    segment: &Arc<UnfinishedDownloadSegment>,
    ctx: &Arc<ClientContext>,
) {
    let doomed = {
        let state = segment.state();
        !state.finished
            && UnfinishedDownloadSegment::is_doomed(&state, segment.file.min_sectors())
    };
    if doomed {
        let (completed, required) = {
            let state = segment.state();
            (state.sectors_completed, segment.file.min_sectors())
        };
        warn!(
            segment = segment.segment_index,
            completed, required, "download segment out of workers"
        );
        release_download_memory(segment, ctx);
        segment.download.fail(DxError::InsufficientSectors {
            available: completed as usize,
            required: required as usize,
        });
    }
}

/// The shared pool: one worker per active contract.
#[derive(Default)]
pub struct WorkerPool {
    workers: RwLock<HashMap<ContractId, Arc<Worker>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the pool against the current contract set: spawn workers
    /// for new contracts, kill workers whose contract disappeared.
    pub fn activate(&self, ctx: &Arc<ClientContext>) {
        let active: HashMap<ContractId, ContractMeta> = ctx
            .contracts
            .active()
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let mut workers = self.workers.write();
        workers.retain(|id, worker| {
            if active.contains_key(id) {
                true
            } else {
                info!(host = %worker.host_id, "killing worker for lost contract");
                worker.kill();
                false
            }
        });
        for (id, contract) in active {
            if !workers.contains_key(&id) {
                let worker = Worker::new(&contract, ctx.clone());
                tokio::spawn(worker.clone().run());
                workers.insert(id, worker);
            }
        }
    }

    /// Snapshot of the current workers.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Kill every worker; used at shutdown.
    pub fn kill_all(&self) {
        for worker in self.workers.read().values() {
            worker.kill();
        }
    }
}
