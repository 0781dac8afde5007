//! `.dxfile`: per-file metadata and sector bookkeeping
//!
//! A `DxFile` owns the segment/sector index of one tracked file: which host
//! stores which erasure-coded sector, which segments are stuck, and the
//! cached health numbers the repair loops read. All mutations persist before
//! returning.

pub mod metadata;
pub mod snapshot;

pub use metadata::{Metadata, Sector, Segment, DXFILE_VERSION};
pub use snapshot::Snapshot;

use dxstor_core::{
    segment_health, CipherKey, DxError, FileId, Hash256, HostId, Result, DEFAULT_HEALTH,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::dxpath::DxPath;
use crate::unix_now;
use metadata::{
    decode_header, decode_segment, encode_header, encode_segment, segment_offset,
    segment_persist_size, HEADER_SIZE,
};

/// Aggregated health of one file, derived from its segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHealth {
    /// Worst health among unstuck segments.
    pub health: u32,
    /// Worst health among stuck segments.
    pub stuck_health: u32,
    pub num_stuck_segments: u32,
    /// Minimum over segments of `pieces · 100 / min_sectors`.
    pub redundancy: u32,
}

/// Parameters for creating a new file entry.
#[derive(Debug, Clone)]
pub struct NewFileParams {
    pub dx_path: DxPath,
    pub local_path: Option<PathBuf>,
    pub file_size: u64,
    pub sector_size: u64,
    pub erasure_code_type: u8,
    pub min_sectors: u32,
    pub num_sectors: u32,
    pub cipher_code: u8,
    pub cipher_key: CipherKey,
    pub file_mode: u32,
}

/// In-memory handle over one `.dxfile`.
#[derive(Debug)]
pub struct DxFile {
    metadata: Metadata,
    segments: Vec<Segment>,
    file_path: PathBuf,
    deleted: bool,
}

impl DxFile {
    /// Create a new file entry and persist it at `file_path`.
    pub fn create(file_path: &Path, params: NewFileParams) -> Result<Self> {
        if params.min_sectors == 0 || params.num_sectors < params.min_sectors {
            return Err(DxError::Validation(format!(
                "invalid erasure parameters: k={}, n={}",
                params.min_sectors, params.num_sectors
            )));
        }
        let now = unix_now();
        let metadata = Metadata {
            id: FileId::new(),
            file_size: params.file_size,
            sector_size: params.sector_size,
            local_path: params.local_path,
            dx_path: params.dx_path,
            cipher_code: params.cipher_code,
            cipher_key: params.cipher_key.as_bytes().to_vec(),
            time_modify: now,
            time_update: now,
            time_access: now,
            time_create: now,
            health: DEFAULT_HEALTH,
            stuck_health: DEFAULT_HEALTH,
            time_last_health_check: 0,
            num_stuck_segments: 0,
            time_recent_repair: 0,
            last_redundancy: 0,
            file_mode: params.file_mode,
            erasure_code_type: params.erasure_code_type,
            min_sectors: params.min_sectors,
            num_sectors: params.num_sectors,
            version: DXFILE_VERSION.to_string(),
        };
        let segments = (0..metadata.num_segments())
            .map(|i| Segment::empty(i, metadata.num_sectors))
            .collect();
        let file = Self {
            metadata,
            segments,
            file_path: file_path.to_path_buf(),
            deleted: false,
        };
        file.save_all()?;
        Ok(file)
    }

    /// Load an existing entry from disk.
    pub fn load(file_path: &Path) -> Result<Self> {
        let mut f = File::open(file_path)?;
        let mut header = vec![0u8; HEADER_SIZE];
        f.read_exact(&mut header)?;
        let metadata = decode_header(&header)?;

        let mut segments = Vec::with_capacity(metadata.num_segments() as usize);
        let record_size = segment_persist_size(metadata.num_sectors);
        let mut raw = vec![0u8; record_size];
        for index in 0..metadata.num_segments() {
            f.read_exact(&mut raw)?;
            segments.push(decode_segment(&raw, index, metadata.num_sectors)?);
        }
        Ok(Self {
            metadata,
            segments,
            file_path: file_path.to_path_buf(),
            deleted: false,
        })
    }

    // ===== accessors =====

    pub fn id(&self) -> FileId {
        self.metadata.id
    }

    pub fn dx_path(&self) -> &DxPath {
        &self.metadata.dx_path
    }

    pub fn file_size(&self) -> u64 {
        self.metadata.file_size
    }

    pub fn sector_size(&self) -> u64 {
        self.metadata.sector_size
    }

    pub fn segment_size(&self) -> u64 {
        self.metadata.segment_size()
    }

    pub fn num_segments(&self) -> u64 {
        self.segments.len() as u64
    }

    pub fn min_sectors(&self) -> u32 {
        self.metadata.min_sectors
    }

    pub fn num_sectors(&self) -> u32 {
        self.metadata.num_sectors
    }

    pub fn erasure_code_type(&self) -> u8 {
        self.metadata.erasure_code_type
    }

    pub fn cipher_code(&self) -> u8 {
        self.metadata.cipher_code
    }

    pub fn cipher_key(&self) -> Result<CipherKey> {
        CipherKey::from_slice(&self.metadata.cipher_key)
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.metadata.local_path.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Segment index and intra-segment offset covering a byte offset.
    pub fn segment_index_by_offset(&self, offset: u64) -> (u64, u64) {
        let segment_size = self.metadata.segment_size();
        (offset / segment_size, offset % segment_size)
    }

    /// Current host assignments for one segment.
    pub fn sectors(&self, segment_index: u64) -> Result<&[Option<Sector>]> {
        self.segment(segment_index).map(|s| s.sectors.as_slice())
    }

    pub fn segment(&self, segment_index: u64) -> Result<&Segment> {
        self.segments
            .get(segment_index as usize)
            .ok_or_else(|| DxError::Validation(format!("segment {} out of range", segment_index)))
    }

    pub fn segment_stuck(&self, segment_index: u64) -> Result<bool> {
        self.segment(segment_index).map(|s| s.stuck)
    }

    // ===== mutations =====

    /// Record that `host_id` now stores sector `sector_index` of
    /// `segment_index` under `merkle_root`. Errors if that exact slot is
    /// already assigned to the same host.
    pub fn add_sector(
        &mut self,
        segment_index: u64,
        sector_index: u32,
        host_id: HostId,
        merkle_root: Hash256,
    ) -> Result<()> {
        let num_sectors = self.metadata.num_sectors;
        let segment = self
            .segments
            .get_mut(segment_index as usize)
            .ok_or_else(|| DxError::Validation(format!("segment {} out of range", segment_index)))?;
        if sector_index >= num_sectors {
            return Err(DxError::Validation(format!(
                "sector {} out of range",
                sector_index
            )));
        }
        let slot = &mut segment.sectors[sector_index as usize];
        if let Some(existing) = slot {
            if existing.host_id == host_id {
                return Err(DxError::Invariant(format!(
                    "sector ({}, {}) already stored on host {}",
                    segment_index, sector_index, host_id
                )));
            }
        }
        *slot = Some(Sector {
            host_id,
            merkle_root,
        });
        let now = unix_now();
        self.metadata.time_modify = now;
        self.metadata.time_update = now;
        self.save_segment(segment_index)?;
        self.save_metadata()
    }

    /// Flip the stuck bit of one segment, maintaining the stuck counter.
    pub fn set_stuck_by_index(&mut self, segment_index: u64, stuck: bool) -> Result<()> {
        let segment = self
            .segments
            .get_mut(segment_index as usize)
            .ok_or_else(|| DxError::Validation(format!("segment {} out of range", segment_index)))?;
        if segment.stuck == stuck {
            return Ok(());
        }
        segment.stuck = stuck;
        if stuck {
            self.metadata.num_stuck_segments += 1;
        } else {
            self.metadata.num_stuck_segments = self.metadata.num_stuck_segments.saturating_sub(1);
        }
        self.metadata.time_update = unix_now();
        debug!(segment = segment_index, stuck, path = %self.metadata.dx_path, "segment stuck bit updated");
        self.save_segment(segment_index)?;
        self.save_metadata()
    }

    pub fn set_local_path(&mut self, path: Option<PathBuf>) -> Result<()> {
        self.metadata.local_path = path;
        self.save_metadata()
    }

    pub fn set_time_access(&mut self, time: u64) -> Result<()> {
        self.metadata.time_access = time;
        self.save_metadata()
    }

    pub fn set_time_recent_repair(&mut self, time: u64) -> Result<()> {
        self.metadata.time_recent_repair = time;
        self.save_metadata()
    }

    /// Persist freshly computed health numbers.
    pub fn update_cached_health(&mut self, health: FileHealth, checked_at: u64) -> Result<()> {
        self.metadata.health = health.health;
        self.metadata.stuck_health = health.stuck_health;
        self.metadata.num_stuck_segments = health.num_stuck_segments;
        self.metadata.last_redundancy = health.redundancy;
        self.metadata.time_last_health_check = checked_at;
        self.save_metadata()
    }

    /// Remove the backing file and mark the entry deleted.
    pub fn delete(&mut self) -> Result<()> {
        self.deleted = true;
        match std::fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ===== derived state =====

    /// Compute file health from the segment table. `good_host` filters out
    /// sectors stored on hosts that are no longer contactable.
    pub fn health(&self, good_host: &dyn Fn(&HostId) -> bool) -> FileHealth {
        let k = self.metadata.min_sectors;
        let n = self.metadata.num_sectors;
        let mut health = DEFAULT_HEALTH;
        let mut stuck_health = DEFAULT_HEALTH;
        let mut num_stuck = 0u32;
        let mut redundancy = u32::MAX;

        for segment in &self.segments {
            let pieces = segment
                .sectors
                .iter()
                .flatten()
                .filter(|s| good_host(&s.host_id))
                .count() as u32;
            let seg_health = segment_health(pieces, k, n);
            if segment.stuck {
                num_stuck += 1;
                stuck_health = stuck_health.min(seg_health);
            } else {
                health = health.min(seg_health);
            }
            redundancy = redundancy.min(pieces * 100 / k);
        }
        if self.segments.is_empty() {
            redundancy = 0;
        }
        FileHealth {
            health,
            stuck_health,
            num_stuck_segments: num_stuck,
            redundancy,
        }
    }

    /// Immutable copy-on-read view for downloads and repairs.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self)
    }

    // ===== persistence =====

    fn open_rw(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.file_path)?)
    }

    fn save_all(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = self.open_rw()?;
        f.write_all(&encode_header(&self.metadata)?)?;
        for segment in &self.segments {
            f.write_all(&encode_segment(segment))?;
        }
        f.sync_data()?;
        Ok(())
    }

    fn save_metadata(&self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        let mut f = self.open_rw()?;
        f.write_all(&encode_header(&self.metadata)?)?;
        f.sync_data()?;
        Ok(())
    }

    fn save_segment(&self, segment_index: u64) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        let segment = self.segment(segment_index)?;
        let mut f = self.open_rw()?;
        f.seek(SeekFrom::Start(segment_offset(
            segment_index,
            self.metadata.num_sectors,
        )))?;
        f.write_all(&encode_segment(segment))?;
        f.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn new_params(dx_path: &str, file_size: u64) -> NewFileParams {
        NewFileParams {
            dx_path: DxPath::new(dx_path).unwrap(),
            local_path: Some(PathBuf::from("/tmp/source")),
            file_size,
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
    fn test_create_and_reload_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.dxfile");
        let created = DxFile::create(&path, new_params("a", 1000)).unwrap();
        assert_eq!(created.num_segments(), 4); // segment_size = 256

        let loaded = DxFile::load(&path).unwrap();
        assert_eq!(loaded.metadata(), created.metadata());
        assert_eq!(loaded.num_segments(), 4);
    }

    #[test]
    fn test_zero_size_file_has_no_segments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.dxfile");
        let file = DxFile::create(&path, new_params("empty", 0)).unwrap();
        assert_eq!(file.num_segments(), 0);
        let health = file.health(&|_| true);
        assert_eq!(health.health, DEFAULT_HEALTH);
        assert_eq!(health.num_stuck_segments, 0);
    }

    #[test]
    fn test_add_sector_and_duplicate_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.dxfile");
        let mut file = DxFile::create(&path, new_params("f", 1000)).unwrap();

        let host = HostId([1u8; 32]);
        let root = Hash256([2u8; 32]);
        file.add_sector(0, 1, host, root).unwrap();

        // same host on the same slot is an invariant violation
        assert!(matches!(
            file.add_sector(0, 1, host, root),
            Err(DxError::Invariant(_))
        ));

        // a different host may replace the assignment
        file.add_sector(0, 1, HostId([9u8; 32]), root).unwrap();

        let reloaded = DxFile::load(&path).unwrap();
        assert_eq!(
            reloaded.sectors(0).unwrap()[1].unwrap().host_id,
            HostId([9u8; 32])
        );
    }

    #[test]
    fn test_stuck_bookkeeping_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.dxfile");
        let mut file = DxFile::create(&path, new_params("s", 1000)).unwrap();

        file.set_stuck_by_index(2, true).unwrap();
        file.set_stuck_by_index(2, true).unwrap(); // idempotent
        assert_eq!(file.metadata().num_stuck_segments, 1);

        let mut reloaded = DxFile::load(&path).unwrap();
        assert!(reloaded.segment_stuck(2).unwrap());
        reloaded.set_stuck_by_index(2, false).unwrap();
        assert_eq!(reloaded.metadata().num_stuck_segments, 0);
    }

    #[test]
    fn test_health_counts_good_hosts_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.dxfile");
        let mut file = DxFile::create(&path, new_params("h", 256)).unwrap();
        assert_eq!(file.num_segments(), 1);

        let dead = HostId([1u8; 32]);
        let live = HostId([2u8; 32]);
        let live2 = HostId([3u8; 32]);
        let root = Hash256([0u8; 32]);
        file.add_sector(0, 0, dead, root).unwrap();
        file.add_sector(0, 1, live, root).unwrap();
        file.add_sector(0, 2, live2, root).unwrap();

        // k=2, n=4: 3 pieces -> health 100
        assert_eq!(file.health(&|_| true).health, 100);
        // with the dead host filtered, 2 pieces -> health 0
        assert_eq!(file.health(&|h| *h != dead).health, 0);
    }

    #[test]
    fn test_segment_index_by_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("o.dxfile");
        let file = DxFile::create(&path, new_params("o", 1000)).unwrap();
        assert_eq!(file.segment_index_by_offset(0), (0, 0));
        assert_eq!(file.segment_index_by_offset(255), (0, 255));
        assert_eq!(file.segment_index_by_offset(256), (1, 0));
        assert_eq!(file.segment_index_by_offset(999), (3, 231));
    }
}
