//! `.dxdir`: aggregated directory metadata
//!
//! Every directory in the namespace carries a `.dxdir` blob with the health
//! numbers aggregated over all files and subdirectories beneath it. The
//! repair loops read these aggregates to decide which directory to visit
//! next, so they must survive crashes: each write goes through the WAL
//! before touching the destination file.
//!
//! On-disk layout (all integers little-endian): u64 num_files,
//! u64 total_size, u32 health, u32 stuck_health, u32 min_redundancy,
//! u64 time_last_health_check, u64 time_modify, u32 num_stuck_segments,
//! then length-prefixed dx_path and root_path strings.

pub mod dirset;

pub use dirset::{DirEntry, DirSet};

use dxstor_core::{DxError, Result, DEFAULT_HEALTH};
use std::path::{Path, PathBuf};

use crate::dxpath::DxPath;
use crate::unix_now;

/// Aggregated metadata persisted per directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMetadata {
    /// Total number of files in this directory and its subdirectories.
    pub num_files: u64,
    /// Total size of those files.
    pub total_size: u64,
    /// Minimum health over all files and subdirectories.
    pub health: u32,
    /// Minimum stuck-health over all files and subdirectories.
    pub stuck_health: u32,
    /// Minimum redundancy, in percent of `min_sectors`.
    pub min_redundancy: u32,
    pub time_last_health_check: u64,
    pub time_modify: u64,
    pub num_stuck_segments: u32,
    pub dx_path: DxPath,
    pub root_path: PathBuf,
}

impl DirMetadata {
    /// Metadata of a freshly created, empty directory.
    pub fn empty(dx_path: DxPath, root_path: PathBuf) -> Self {
        Self {
            num_files: 0,
            total_size: 0,
            health: DEFAULT_HEALTH,
            stuck_health: DEFAULT_HEALTH,
            min_redundancy: u32::MAX,
            time_last_health_check: 0,
            time_modify: unix_now(),
            num_stuck_segments: 0,
            dx_path,
            root_path,
        }
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take<'a>(raw: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *cursor + len > raw.len() {
        return Err(DxError::Corrupt("truncated .dxdir".to_string()));
    }
    let slice = &raw[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn take_u64(raw: &[u8], cursor: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(raw, cursor, 8)?.try_into().unwrap()))
}

fn take_u32(raw: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(raw, cursor, 4)?.try_into().unwrap()))
}

fn take_string(raw: &[u8], cursor: &mut usize) -> Result<String> {
    let len = take_u32(raw, cursor)? as usize;
    let bytes = take(raw, cursor, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| DxError::Corrupt(format!(".dxdir string: {}", e)))
}

/// Encode directory metadata into its on-disk representation.
pub fn encode_dir_metadata(metadata: &DirMetadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + metadata.dx_path.as_str().len());
    out.extend_from_slice(&metadata.num_files.to_le_bytes());
    out.extend_from_slice(&metadata.total_size.to_le_bytes());
    out.extend_from_slice(&metadata.health.to_le_bytes());
    out.extend_from_slice(&metadata.stuck_health.to_le_bytes());
    out.extend_from_slice(&metadata.min_redundancy.to_le_bytes());
    out.extend_from_slice(&metadata.time_last_health_check.to_le_bytes());
    out.extend_from_slice(&metadata.time_modify.to_le_bytes());
    out.extend_from_slice(&metadata.num_stuck_segments.to_le_bytes());
    put_string(&mut out, metadata.dx_path.as_str());
    put_string(&mut out, &metadata.root_path.to_string_lossy());
    out
}

/// Decode directory metadata from its on-disk representation.
pub fn decode_dir_metadata(raw: &[u8]) -> Result<DirMetadata> {
    let mut cursor = 0usize;
    let num_files = take_u64(raw, &mut cursor)?;
    let total_size = take_u64(raw, &mut cursor)?;
    let health = take_u32(raw, &mut cursor)?;
    let stuck_health = take_u32(raw, &mut cursor)?;
    let min_redundancy = take_u32(raw, &mut cursor)?;
    let time_last_health_check = take_u64(raw, &mut cursor)?;
    let time_modify = take_u64(raw, &mut cursor)?;
    let num_stuck_segments = take_u32(raw, &mut cursor)?;
    let dx_path = DxPath::new(&take_string(raw, &mut cursor)?)?;
    let root_path = PathBuf::from(take_string(raw, &mut cursor)?);
    Ok(DirMetadata {
        num_files,
        total_size,
        health,
        stuck_health,
        min_redundancy,
        time_last_health_check,
        time_modify,
        num_stuck_segments,
        dx_path,
        root_path,
    })
}

/// In-memory handle over one `.dxdir`.
#[derive(Debug)]
pub struct DxDir {
    metadata: DirMetadata,
    dir_file_path: PathBuf,
    deleted: bool,
}

impl DxDir {
    /// Create the directory (and its on-disk folder) with empty metadata.
    pub fn create(dx_path: DxPath, root: &Path) -> Result<Self> {
        let dir_file_path = dx_path.dxdir_sys_path(root);
        if dir_file_path.exists() {
            return Err(DxError::PathOverload(dx_path.to_string()));
        }
        std::fs::create_dir_all(dx_path.sys_dir(root))?;
        let dir = Self {
            metadata: DirMetadata::empty(dx_path, root.to_path_buf()),
            dir_file_path,
            deleted: false,
        };
        dir.write_to_disk()?;
        Ok(dir)
    }

    /// Load an existing directory.
    pub fn load(dx_path: DxPath, root: &Path) -> Result<Self> {
        let dir_file_path = dx_path.dxdir_sys_path(root);
        let raw = std::fs::read(&dir_file_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DxError::UnknownPath(dx_path.to_string())
            } else {
                e.into()
            }
        })?;
        let metadata = decode_dir_metadata(&raw)?;
        Ok(Self {
            metadata,
            dir_file_path,
            deleted: false,
        })
    }

    pub fn metadata(&self) -> &DirMetadata {
        &self.metadata
    }

    pub fn dx_path(&self) -> &DxPath {
        &self.metadata.dx_path
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Replace the aggregate fields. `dx_path` and `root_path` never change.
    pub fn update_metadata(&mut self, update: DirMetadata) -> DirMetadata {
        self.metadata.num_files = update.num_files;
        self.metadata.total_size = update.total_size;
        self.metadata.health = update.health;
        self.metadata.stuck_health = update.stuck_health;
        self.metadata.min_redundancy = update.min_redundancy;
        self.metadata.time_last_health_check = update.time_last_health_check;
        self.metadata.num_stuck_segments = update.num_stuck_segments;
        self.metadata.time_modify = unix_now();
        self.metadata.clone()
    }

    /// Raw bytes a save would write; fed into the WAL by the dir set.
    pub fn encoded(&self) -> Vec<u8> {
        encode_dir_metadata(&self.metadata)
    }

    /// Write the metadata to its destination file.
    pub fn write_to_disk(&self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        if let Some(parent) = self.dir_file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.dir_file_path, self.encoded())?;
        Ok(())
    }

    pub fn delete(&mut self) -> Result<()> {
        self.deleted = true;
        match std::fs::remove_file(&self.dir_file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_codec_roundtrip_bit_exact() {
        let metadata = DirMetadata {
            num_files: 42,
            total_size: 1 << 40,
            health: 150,
            stuck_health: 75,
            min_redundancy: 230,
            time_last_health_check: 1_700_000_000,
            time_modify: 1_700_000_001,
            num_stuck_segments: 3,
            dx_path: DxPath::new("a/b").unwrap(),
            root_path: PathBuf::from("/persist/filesystem"),
        };
        let raw = encode_dir_metadata(&metadata);
        assert_eq!(decode_dir_metadata(&raw).unwrap(), metadata);
    }

    #[test]
    fn test_codec_layout_is_fixed() {
        // the first 8 bytes are num_files little-endian
        let mut metadata = DirMetadata::empty(DxPath::root(), PathBuf::from("/r"));
        metadata.num_files = 0x0102030405060708;
        let raw = encode_dir_metadata(&metadata);
        assert_eq!(&raw[..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode_dir_metadata(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_create_load_update() {
        let tmp = tempdir().unwrap();
        let path = DxPath::new("sub").unwrap();

        let mut dir = DxDir::create(path.clone(), tmp.path()).unwrap();
        assert!(matches!(
            DxDir::create(path.clone(), tmp.path()),
            Err(DxError::PathOverload(_))
        ));

        let mut update = dir.metadata().clone();
        update.num_files = 7;
        update.health = 120;
        dir.update_metadata(update);
        dir.write_to_disk().unwrap();

        let loaded = DxDir::load(path, tmp.path()).unwrap();
        assert_eq!(loaded.metadata().num_files, 7);
        assert_eq!(loaded.metadata().health, 120);
    }
}
