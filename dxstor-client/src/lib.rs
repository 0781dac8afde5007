//! dxstor client engine
//!
//! The erasure-coded upload, repair, and download engine. Files are split
//! into segments, each segment erasure-coded into `num_sectors` encrypted
//! sectors and distributed to contracted hosts; background loops watch
//! segment health and re-upload missing sectors to hold the target
//! redundancy.
//!
//! The moving parts:
//! - [`MemoryManager`](memorymanager::MemoryManager) gates every heavy
//!   buffer behind a byte budget
//! - [`UploadHeap`](uploadheap::UploadHeap) orders segments needing repair
//! - the [`WorkerPool`](worker::WorkerPool) races sectors across hosts
//! - the download heap reassembles segments from the first `k` arrivals
//! - stuck and health loops escalate segments the repair pass left behind

pub mod contracts;
pub mod download;
mod healthloop;
pub mod memorymanager;
pub mod randselect;
pub mod repair;
pub mod settings;
mod stuckloop;
#[cfg(test)]
pub(crate) mod testutil;
pub mod uploadheap;
pub mod worker;

pub use contracts::{ContractId, ContractMeta, ContractSet, HostSession, SectorRequest, SectorResponse};
pub use download::{Download, DownloadBuffer, DownloadDestination, DownloadHeap};
pub use memorymanager::{MemoryManager, MemoryPriority};
pub use settings::{ClientSettings, RentPayment};
pub use uploadheap::{UnfinishedUploadSegment, UploadHeap, UploadSegmentId};
pub use worker::{Worker, WorkerPool};

use dxstor_core::{DxError, Result, DEFAULT_MIN_SECTORS, DEFAULT_NUM_SECTORS, SECTOR_SIZE};
use dxstor_filesystem::{unix_now, DxPath, FileSystem, NewFileParams};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Tunables of the engine's background loops.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub persist_dir: PathBuf,
    /// Byte budget of the memory manager.
    pub max_memory: u64,
    /// Repairs running at once.
    pub max_concurrent_repairs: usize,
    /// Fallback tick of the upload loop.
    pub repair_interval: Duration,
    /// Tick of the directory repair scan.
    pub repair_scan_interval: Duration,
    /// Tick of the stuck loop.
    pub stuck_interval: Duration,
    /// Tick of the health check loop.
    pub health_check_interval: Duration,
}

impl ClientConfig {
    pub fn new(persist_dir: PathBuf) -> Self {
        Self {
            persist_dir,
            max_memory: 1 << 30,
            max_concurrent_repairs: 4,
            repair_interval: Duration::from_secs(15),
            repair_scan_interval: Duration::from_secs(60),
            stuck_interval: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(1800),
        }
    }
}

/// Shared context threaded through workers, loops, and repairs. No
/// process-wide statics: everything the engine touches hangs off this
/// object.
pub struct ClientContext {
    pub memory: Arc<MemoryManager>,
    pub host_client: Arc<dyn HostSession>,
    pub contracts: Arc<ContractSet>,
    pub file_system: Arc<FileSystem>,
    pub upload_heap: Arc<UploadHeap>,
    pub download_heap: Arc<DownloadHeap>,
    pub settings: RwLock<ClientSettings>,
    pub stuck_success_tx: mpsc::Sender<DxPath>,
    pub shutdown: watch::Receiver<bool>,
    /// Whether the client believes it is online; offline repair failures
    /// do not mark segments stuck.
    pub online: AtomicBool,
}

/// How an upload treats an existing file at the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Standard,
    Override,
}

/// Parameters of a user upload.
#[derive(Debug, Clone)]
pub struct FileUploadParams {
    pub source: PathBuf,
    pub dx_path: DxPath,
    pub mode: UploadMode,
    pub min_sectors: Option<u32>,
    pub num_sectors: Option<u32>,
    pub sector_size: Option<u64>,
}

impl FileUploadParams {
    pub fn new(source: PathBuf, dx_path: DxPath) -> Self {
        Self {
            source,
            dx_path,
            mode: UploadMode::Standard,
            min_sectors: None,
            num_sectors: None,
            sector_size: None,
        }
    }
}

/// The storage client engine.
pub struct StorageClient {
    ctx: Arc<ClientContext>,
    worker_pool: Arc<WorkerPool>,
    config: ClientConfig,
    shutdown_tx: watch::Sender<bool>,
    stuck_rx: Mutex<Option<mpsc::Receiver<DxPath>>>,
    started: AtomicBool,
}

impl StorageClient {
    /// Build a client over the given host session and contract set. Loads
    /// persisted settings and replays the filesystem WAL.
    pub fn new(
        config: ClientConfig,
        host_client: Arc<dyn HostSession>,
        contracts: Arc<ContractSet>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.persist_dir)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let memory = MemoryManager::new(config.max_memory, shutdown_rx.clone());
        let file_system = Arc::new(FileSystem::new(&config.persist_dir)?);
        file_system.set_host_oracle(contracts.clone());
        let (stuck_tx, stuck_rx) = mpsc::channel(1);
        let settings = Self::load_settings(&config.persist_dir)?;

        let ctx = Arc::new(ClientContext {
            memory,
            host_client,
            contracts,
            file_system,
            upload_heap: Arc::new(UploadHeap::new()),
            download_heap: Arc::new(DownloadHeap::new()),
            settings: RwLock::new(settings),
            stuck_success_tx: stuck_tx,
            shutdown: shutdown_rx,
            online: AtomicBool::new(true),
        });
        Ok(Arc::new(Self {
            ctx,
            worker_pool: Arc::new(WorkerPool::new()),
            config,
            shutdown_tx,
            stuck_rx: Mutex::new(Some(stuck_rx)),
            started: AtomicBool::new(false),
        }))
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.ctx.file_system
    }

    /// Spawn every background loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.file_system.start();
        self.refresh_hosts_and_workers();

        tokio::spawn(repair::upload_loop(self.clone()));
        tokio::spawn(repair::upload_or_repair_loop(self.clone()));
        tokio::spawn(download_loop(self.clone()));
        tokio::spawn(healthloop::health_check_loop(self.clone()));
        if let Some(stuck_rx) = self.stuck_rx.lock().take() {
            tokio::spawn(stuckloop::stuck_loop(self.clone(), stuck_rx));
        }
        info!("storage client started");
    }

    /// Signal shutdown: every loop and worker observes the stop channel,
    /// releases held memory, and exits.
    pub fn stop(&self) {
        info!("storage client stopping");
        let _ = self.shutdown_tx.send(true);
        self.worker_pool.kill_all();
        self.ctx.file_system.stop();
    }

    /// Reconcile the worker pool with the active contract set.
    pub fn refresh_hosts_and_workers(&self) {
        self.worker_pool.activate(&self.ctx);
    }

    // ===== public operations =====

    /// Start tracking a file: create its metadata and hand its segments to
    /// the repair machinery. Returns once the segments are queued; the
    /// background loops finish the upload.
    pub async fn upload(&self, params: FileUploadParams) -> Result<()> {
        let source_info = tokio::fs::metadata(&params.source).await.map_err(|e| {
            DxError::Validation(format!(
                "unable to stat source {}: {}",
                params.source.display(),
                e
            ))
        })?;
        if source_info.is_dir() {
            return Err(DxError::UploadDirectory);
        }

        if params.mode == UploadMode::Override {
            match self.ctx.file_system.delete_dx_file(&params.dx_path) {
                Ok(()) | Err(DxError::UnknownPath(_)) => {}
                Err(e) => {
                    return Err(DxError::Validation(format!(
                        "cannot delete existing file: {}",
                        e
                    )))
                }
            }
        }

        let min_sectors = params.min_sectors.unwrap_or(DEFAULT_MIN_SECTORS);
        let num_sectors = params.num_sectors.unwrap_or(DEFAULT_NUM_SECTORS);
        let sector_size = params.sector_size.unwrap_or(SECTOR_SIZE);

        // enough hosts to give the redundancy a chance
        let required_contracts = (num_sectors + min_sectors) as usize / 2;
        let active = self.ctx.contracts.active().len();
        if active < required_contracts {
            return Err(DxError::Validation(format!(
                "not enough contracts to upload file: got {}, needed {}",
                active, required_contracts
            )));
        }

        let file_mode = file_mode_of(&source_info);
        let entry = self.ctx.file_system.new_dx_file(
            NewFileParams {
                dx_path: params.dx_path.clone(),
                local_path: Some(params.source.clone()),
                file_size: source_info.len(),
                sector_size,
                erasure_code_type: dxstor_core::ERASURE_CODE_STANDARD,
                min_sectors,
                num_sectors,
                cipher_code: dxstor_core::crypto::CIPHER_CODE_GCM,
                cipher_key: dxstor_core::CipherKey::generate(),
                file_mode,
            },
            params.mode == UploadMode::Override,
        )?;

        if source_info.len() == 0 {
            debug!(path = %params.dx_path, "empty file tracked, nothing to upload");
            return Ok(());
        }

        if let Some(parent) = params.dx_path.parent() {
            self.ctx.file_system.init_and_update_dir_metadata(&parent)?;
        }

        self.refresh_hosts_and_workers();
        let segments =
            repair::create_unfinished_upload_segments(&entry, &self.ctx, false, false, None);
        let queued = segments.len();
        for segment in segments {
            self.ctx.upload_heap.push(segment);
        }
        self.ctx.upload_heap.new_uploads.notify_one();
        info!(path = %params.dx_path, segments = queued, "upload queued");
        Ok(())
    }

    /// Stop tracking a file and remove its metadata.
    pub fn delete_file(&self, dx_path: &DxPath) -> Result<()> {
        self.ctx.file_system.delete_dx_file(dx_path)
    }

    /// Download a whole file to a local path, blocking until it finishes.
    pub async fn download_sync(&self, dx_path: &DxPath, destination: PathBuf) -> Result<()> {
        let download = self.download_async(dx_path, destination)?;
        let mut shutdown = self.ctx.shutdown.clone();
        tokio::select! {
            result = download.wait() => result,
            _ = shutdown.wait_for(|stopped| *stopped) => Err(DxError::Shutdown),
        }
    }

    /// Queue a whole-file download and return its handle.
    pub fn download_async(&self, dx_path: &DxPath, destination: PathBuf) -> Result<Arc<Download>> {
        let entry = self.ctx.file_system.open_dx_file(dx_path)?;
        if let Err(e) = entry.write().set_time_access(unix_now()) {
            warn!(path = %dx_path, error = %e, "failed to persist access time");
        }
        let snapshot = Arc::new(entry.read().snapshot());

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&destination)?;

        let length = snapshot.file_size();
        new_download_checked(
            &self.ctx,
            download::DownloadParams {
                file: snapshot,
                destination: Arc::new(Mutex::new(file)),
                offset: 0,
                length,
                latency_target: Duration::from_secs(25),
                needs_memory: true,
                overdrive: 3,
                priority: 5,
            },
        )
    }

    // ===== settings =====

    /// Apply and persist new client settings.
    pub fn set_client_setting(&self, settings: ClientSettings) -> Result<()> {
        settings.validate()?;
        *self.ctx.settings.write() = settings;
        self.save_settings()?;
        self.refresh_hosts_and_workers();
        Ok(())
    }

    pub fn client_setting(&self) -> ClientSettings {
        self.ctx.settings.read().clone()
    }

    fn settings_path(persist_dir: &std::path::Path) -> PathBuf {
        persist_dir.join("settings.json")
    }

    fn load_settings(persist_dir: &std::path::Path) -> Result<ClientSettings> {
        let path = Self::settings_path(persist_dir);
        match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| DxError::Corrupt(format!("settings.json: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientSettings::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_settings(&self) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&*self.ctx.settings.read())
            .map_err(|e| DxError::Corrupt(format!("settings encode: {}", e)))?;
        std::fs::write(Self::settings_path(&self.config.persist_dir), raw)?;
        Ok(())
    }
}

fn file_mode_of(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

fn new_download_checked(
    ctx: &Arc<ClientContext>,
    params: download::DownloadParams,
) -> Result<Arc<Download>> {
    let download = download::new_download(&ctx.download_heap, params)?;
    ctx.download_heap.new_downloads.notify_one();
    Ok(download)
}

/// Drains the download heap into the worker pool, reserving segment memory
/// first when the download asked for it.
pub(crate) async fn download_loop(client: Arc<StorageClient>) {
    let ctx = client.context().clone();
    let mut shutdown = ctx.shutdown.clone();
    info!("download loop started");
    loop {
        tokio::select! {
            _ = ctx.download_heap.new_downloads.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("download loop shutting down");
                return;
            }
        }
        while let Some(segment) = ctx.download_heap.pop() {
            if segment.download.is_failed() || segment.download.is_complete() {
                continue;
            }
            if segment.needs_memory {
                let amount =
                    segment.file.sector_size() * segment.file.num_sectors() as u64;
                match ctx.memory.request(amount, MemoryPriority::Low).await {
                    Ok(()) => segment.state().memory_allocated = amount,
                    Err(e) if e.is_shutdown() => {
                        info!("download loop shutting down");
                        return;
                    }
                    Err(e) => {
                        warn!(
                            segment = segment.segment_index,
                            error = %e,
                            "download memory reservation failed"
                        );
                        segment.download.fail(e);
                        continue;
                    }
                }
            }

            client.refresh_hosts_and_workers();
            let workers = client.worker_pool().workers();
            if workers.is_empty() {
                warn!(
                    segment = segment.segment_index,
                    "no workers available for download segment"
                );
                let amount = segment.state().memory_allocated;
                if amount > 0 {
                    let mut state = segment.state();
                    state.finished = true;
                    drop(state);
                    ctx.memory.return_memory(amount);
                }
                segment
                    .download
                    .fail(DxError::HostUnavailable("no active workers".to_string()));
                continue;
            }

            *segment.distributed_at.lock() = Some(Instant::now());
            segment.state().workers_remaining += workers.len() as u32;
            debug!(
                segment = segment.segment_index,
                workers = workers.len(),
                "distributing download segment"
            );
            for worker in workers {
                worker.queue_download_segment(segment.clone());
            }
        }
    }
}
