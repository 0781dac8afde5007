//! dxstor filesystem
//!
//! The file and directory model of the storage client. Owns the persisted
//! `.dxfile` and `.dxdir` state under `<persist_dir>/filesystem/`, the
//! write-ahead log that serializes directory-metadata writes, and the
//! asynchronous bubble worker that keeps directory aggregates current.

pub mod bubble;
pub mod dxdir;
pub mod dxfile;
pub mod dxpath;
pub mod fileset;
pub mod wal;

pub use dxdir::{DirEntry, DirMetadata, DirSet, DxDir};
pub use dxfile::{DxFile, FileHealth, Metadata, NewFileParams, Sector, Segment, Snapshot};
pub use dxpath::{DxPath, DXDIR_FILENAME, DXFILE_EXTENSION};
pub use fileset::{FileEntry, FileSet};
pub use wal::{Wal, WalRecord};

use bubble::BubbleScheduler;
use dxstor_core::{HostId, Result, DEFAULT_HEALTH};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Answers whether a host's sectors still count toward redundancy. The
/// storage client plugs its contract set in here so health numbers ignore
/// sectors on hosts we no longer rent from.
pub trait HostHealthOracle: Send + Sync {
    fn host_healthy(&self, host: &HostId) -> bool;
}

/// Default oracle: every host counts.
struct AllHostsHealthy;

impl HostHealthOracle for AllHostsHealthy {
    fn host_healthy(&self, _host: &HostId) -> bool {
        true
    }
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One entry of a directory listing; files and subdirectories are tagged
/// rather than dispatched virtually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirContent {
    File(DxPath),
    Dir(DxPath),
}

/// The filesystem facade used by the storage client.
pub struct FileSystem {
    root: PathBuf,
    file_set: FileSet,
    dir_set: DirSet,
    wal: Arc<Wal>,
    bubble: BubbleScheduler,
    bubble_rx: Mutex<Option<mpsc::UnboundedReceiver<DxPath>>>,
    host_oracle: RwLock<Arc<dyn HostHealthOracle>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FileSystem {
    /// Open the filesystem under `persist_dir`, replaying any write-ahead
    /// log records left over from a crash.
    pub fn new(persist_dir: &Path) -> Result<Self> {
        let root = persist_dir.join("filesystem");
        std::fs::create_dir_all(&root)?;

        let (wal, replay) = Wal::open(&persist_dir.join("wal.log"))?;
        for record in &replay {
            let destination = root.join(&record.path);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&destination, &record.data)?;
            debug!(path = %record.path, "replayed wal record");
        }
        if !replay.is_empty() {
            info!(records = replay.len(), "wal recovery complete");
            wal.checkpoint()?;
        }
        let wal = Arc::new(wal);

        let file_set = FileSet::new(root.clone());
        let dir_set = DirSet::new(root.clone(), wal.clone());
        // the root directory always exists
        dir_set.open_or_create(&DxPath::root())?;

        let (bubble, bubble_rx) = BubbleScheduler::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            root,
            file_set,
            dir_set,
            wal,
            bubble,
            bubble_rx: Mutex::new(Some(bubble_rx)),
            host_oracle: RwLock::new(Arc::new(AllHostsHealthy)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Install the oracle deciding which hosts still count toward
    /// redundancy.
    pub fn set_host_oracle(&self, oracle: Arc<dyn HostHealthOracle>) {
        *self.host_oracle.write() = oracle;
    }

    /// Spawn the bubble worker. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let Some(mut rx) = self.bubble_rx.lock().take() else {
            warn!("filesystem bubble worker already started");
            return;
        };
        let fs = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("bubble worker shutting down");
                            return;
                        }
                    }
                    maybe_path = rx.recv() => {
                        let Some(path) = maybe_path else { return };
                        let parent = path.parent();
                        if let Err(e) = fs.apply_bubble(&path) {
                            warn!(path = %path, error = %e, "bubble failed");
                        }
                        fs.bubble.complete(&path);
                        if let Some(parent) = parent {
                            fs.bubble.queue(parent);
                        }
                    }
                }
            }
        });
    }

    /// Stop the bubble worker.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_set(&self) -> &FileSet {
        &self.file_set
    }

    pub fn dir_set(&self) -> &DirSet {
        &self.dir_set
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    // ===== file operations =====

    /// Create a new tracked file, making sure its directory chain exists.
    pub fn new_dx_file(&self, params: NewFileParams, overwrite: bool) -> Result<FileEntry> {
        if let Some(parent) = params.dx_path.parent() {
            self.ensure_dir_chain(&parent)?;
        }
        let entry = self.file_set.new_dx_file(params, overwrite)?;
        if let Some(parent) = entry.dx_path().parent() {
            self.bubble.queue(parent);
        }
        Ok(entry)
    }

    pub fn open_dx_file(&self, path: &DxPath) -> Result<FileEntry> {
        self.file_set.open(path)
    }

    pub fn delete_dx_file(&self, path: &DxPath) -> Result<()> {
        self.file_set.delete(path)?;
        if let Some(parent) = path.parent() {
            self.bubble.queue(parent);
        }
        Ok(())
    }

    pub fn file_exists(&self, path: &DxPath) -> bool {
        self.file_set.exists(path)
    }

    // ===== directory operations =====

    /// Create every missing `.dxdir` from `path` up to the root.
    pub fn ensure_dir_chain(&self, path: &DxPath) -> Result<()> {
        let mut current = Some(path.clone());
        while let Some(p) = current {
            self.dir_set.open_or_create(&p)?;
            current = p.parent();
        }
        Ok(())
    }

    pub fn dir_metadata(&self, path: &DxPath) -> Result<DirMetadata> {
        Ok(self.dir_set.open(path)?.metadata())
    }

    /// Make sure the directory exists and schedule an aggregate refresh.
    pub fn init_and_update_dir_metadata(&self, path: &DxPath) -> Result<()> {
        self.ensure_dir_chain(path)?;
        self.bubble.queue(path.clone());
        Ok(())
    }

    /// Schedule an aggregate refresh for a directory that already exists.
    pub fn queue_bubble(&self, path: &DxPath) {
        self.bubble.queue(path.clone());
    }

    /// List the direct children of a directory as tagged entries.
    pub fn dir_contents(&self, path: &DxPath) -> Result<Vec<DirContent>> {
        let sys_dir = path.sys_dir(&self.root);
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&sys_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let kind = entry.file_type()?;
            if kind.is_file() {
                if let Some(stem) = name.strip_suffix(DXFILE_EXTENSION) {
                    out.push(DirContent::File(path.join(stem)?));
                }
            } else if kind.is_dir() && entry.path().join(DXDIR_FILENAME).exists() {
                out.push(DirContent::Dir(path.join(&name)?));
            }
        }
        Ok(out)
    }

    /// Paths of the files directly inside a directory.
    pub fn file_paths_in_dir(&self, path: &DxPath) -> Result<Vec<DxPath>> {
        Ok(self
            .dir_contents(path)?
            .into_iter()
            .filter_map(|c| match c {
                DirContent::File(p) => Some(p),
                DirContent::Dir(_) => None,
            })
            .collect())
    }

    /// Walk the whole tree, returning every directory with its metadata.
    pub fn all_dirs(&self) -> Result<Vec<(DxPath, DirMetadata)>> {
        let mut out = Vec::new();
        let mut stack = vec![DxPath::root()];
        while let Some(path) = stack.pop() {
            match self.dir_set.open(&path) {
                Ok(entry) => out.push((path.clone(), entry.metadata())),
                Err(e) => {
                    warn!(path = %path, error = %e, "unreadable directory metadata");
                    continue;
                }
            }
            for content in self.dir_contents(&path)? {
                if let DirContent::Dir(child) = content {
                    stack.push(child);
                }
            }
        }
        Ok(out)
    }

    /// Directories sorted by ascending health, the repair scan order.
    pub fn dirs_by_health(&self) -> Result<Vec<(DxPath, DirMetadata)>> {
        let mut dirs = self.all_dirs()?;
        dirs.sort_by(|a, b| {
            a.1.health
                .cmp(&b.1.health)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(dirs)
    }

    /// Directory with the worst stuck health that still has stuck segments.
    pub fn worst_stuck_directory(&self) -> Result<Option<(DxPath, DirMetadata)>> {
        Ok(self
            .all_dirs()?
            .into_iter()
            .filter(|(_, m)| m.num_stuck_segments > 0)
            .min_by_key(|(path, m)| (m.stuck_health, path.clone())))
    }

    // ===== bubble application =====

    /// Recompute one directory's aggregates from its direct children and
    /// persist the result. Also refreshes each contained file's cached
    /// health from its segment table.
    fn apply_bubble(&self, path: &DxPath) -> Result<()> {
        let entry = self.dir_set.open_or_create(path)?;
        let now = unix_now();

        let mut aggregate = DirMetadata::empty(path.clone(), self.root.clone());
        aggregate.health = DEFAULT_HEALTH;
        aggregate.stuck_health = DEFAULT_HEALTH;
        aggregate.min_redundancy = u32::MAX;
        aggregate.time_last_health_check = now;

        for content in self.dir_contents(path)? {
            match content {
                DirContent::File(file_path) => {
                    let file_entry = match self.file_set.open(&file_path) {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(path = %file_path, error = %e, "skipping unreadable file in bubble");
                            continue;
                        }
                    };
                    let oracle = self.host_oracle.read().clone();
                    let health = {
                        let mut file = file_entry.write();
                        let health = file.health(&|host| oracle.host_healthy(host));
                        if let Err(e) = file.update_cached_health(health, now) {
                            error!(path = %file_path, error = %e, "failed to cache file health");
                        }
                        health
                    };
                    let size = file_entry.read().file_size();
                    aggregate.num_files += 1;
                    aggregate.total_size += size;
                    aggregate.health = aggregate.health.min(health.health);
                    aggregate.stuck_health = aggregate.stuck_health.min(health.stuck_health);
                    aggregate.min_redundancy = aggregate.min_redundancy.min(health.redundancy);
                    aggregate.num_stuck_segments += health.num_stuck_segments;
                }
                DirContent::Dir(child) => {
                    let metadata = match self.dir_set.open(&child) {
                        Ok(entry) => entry.metadata(),
                        Err(e) => {
                            warn!(path = %child, error = %e, "skipping unreadable subdir in bubble");
                            continue;
                        }
                    };
                    aggregate.num_files += metadata.num_files;
                    aggregate.total_size += metadata.total_size;
                    aggregate.health = aggregate.health.min(metadata.health);
                    aggregate.stuck_health = aggregate.stuck_health.min(metadata.stuck_health);
                    aggregate.min_redundancy =
                        aggregate.min_redundancy.min(metadata.min_redundancy);
                    aggregate.num_stuck_segments += metadata.num_stuck_segments;
                }
            }
        }

        entry.update_metadata(aggregate)?;
        debug!(path = %path, "bubble applied");
        Ok(())
    }

    /// Synchronously bubble a path and all its ancestors. Used by tests and
    /// the health loop's full-tree walk; the background worker uses the
    /// queue instead.
    pub fn bubble_blocking(&self, path: &DxPath) -> Result<()> {
        let mut current = Some(path.clone());
        while let Some(p) = current {
            self.apply_bubble(&p)?;
            current = p.parent();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dxstor_core::CipherKey;
    use tempfile::tempdir;

    fn params(path: &str, size: u64) -> NewFileParams {
        NewFileParams {
            dx_path: DxPath::new(path).unwrap(),
            local_path: None,
            file_size: size,
            sector_size: 128,
            erasure_code_type: 1,
            min_sectors: 2,
            num_sectors: 4,
            cipher_code: 1,
            cipher_key: CipherKey::generate(),
            file_mode: 0o644,
        }
    }

    #[test]
    fn test_new_file_creates_dir_chain() {
        let tmp = tempdir().unwrap();
        let fs = FileSystem::new(tmp.path()).unwrap();

        fs.new_dx_file(params("a/b/c", 1000), false).unwrap();
        assert!(fs.dir_set().exists(&DxPath::new("a").unwrap()));
        assert!(fs.dir_set().exists(&DxPath::new("a/b").unwrap()));
        assert!(fs.file_exists(&DxPath::new("a/b/c").unwrap()));
    }

    #[test]
    fn test_dir_contents_tagged() {
        let tmp = tempdir().unwrap();
        let fs = FileSystem::new(tmp.path()).unwrap();

        fs.new_dx_file(params("top", 100), false).unwrap();
        fs.new_dx_file(params("sub/inner", 100), false).unwrap();

        let contents = fs.dir_contents(&DxPath::root()).unwrap();
        assert!(contents.contains(&DirContent::File(DxPath::new("top").unwrap())));
        assert!(contents.contains(&DirContent::Dir(DxPath::new("sub").unwrap())));
    }

    #[test]
    fn test_bubble_aggregates_to_root() {
        let tmp = tempdir().unwrap();
        let fs = FileSystem::new(tmp.path()).unwrap();

        fs.new_dx_file(params("a/f1", 1000), false).unwrap();
        fs.new_dx_file(params("a/b/f2", 500), false).unwrap();
        fs.bubble_blocking(&DxPath::new("a/b").unwrap()).unwrap();

        let root_metadata = fs.dir_metadata(&DxPath::root()).unwrap();
        assert_eq!(root_metadata.num_files, 2);
        assert_eq!(root_metadata.total_size, 1500);
        // no sectors uploaded yet: both files are at health 0
        assert_eq!(root_metadata.health, 0);
    }

    #[test]
    fn test_stuck_counts_bubble_up() {
        let tmp = tempdir().unwrap();
        let fs = FileSystem::new(tmp.path()).unwrap();

        let entry = fs.new_dx_file(params("a/f", 1000), false).unwrap();
        entry.write().set_stuck_by_index(0, true).unwrap();
        drop(entry);
        fs.bubble_blocking(&DxPath::new("a").unwrap()).unwrap();

        let metadata = fs.dir_metadata(&DxPath::root()).unwrap();
        assert_eq!(metadata.num_stuck_segments, 1);

        let (worst, _) = fs.worst_stuck_directory().unwrap().unwrap();
        assert!(worst.is_root() || worst.as_str() == "a");
    }

    #[test]
    fn test_dirs_by_health_orders_ascending() {
        let tmp = tempdir().unwrap();
        let fs = FileSystem::new(tmp.path()).unwrap();

        // "bad" has a file with no sectors (health 0); "good" has none
        fs.new_dx_file(params("bad/f", 1000), false).unwrap();
        fs.ensure_dir_chain(&DxPath::new("good").unwrap()).unwrap();
        fs.bubble_blocking(&DxPath::new("bad").unwrap()).unwrap();

        let dirs = fs.dirs_by_health().unwrap();
        assert_eq!(dirs[0].1.health, 0);
    }

    #[tokio::test]
    async fn test_bubble_worker_processes_queue() {
        let tmp = tempdir().unwrap();
        let fs = Arc::new(FileSystem::new(tmp.path()).unwrap());
        fs.start();

        fs.new_dx_file(params("w/f", 1000), false).unwrap();
        fs.init_and_update_dir_metadata(&DxPath::new("w").unwrap())
            .unwrap();

        // the worker owes us an update of w and then the root
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let metadata = fs.dir_metadata(&DxPath::root()).unwrap();
            if metadata.num_files == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "bubble never reached root");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        fs.stop();
    }
}
