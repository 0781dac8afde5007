//! Immutable file snapshots
//!
//! Downloads and repairs work against a copy-on-read view of the file so the
//! live entry can keep mutating without tearing a reader mid-operation.

use dxstor_core::{CipherKey, DxError, FileId, Result};
use std::path::PathBuf;

use super::metadata::{Metadata, Sector, Segment};
use super::DxFile;
use crate::dxpath::DxPath;

/// Immutable view over a [`DxFile`] taken at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    id: FileId,
    dx_path: DxPath,
    local_path: Option<PathBuf>,
    file_size: u64,
    sector_size: u64,
    min_sectors: u32,
    num_sectors: u32,
    erasure_code_type: u8,
    cipher_code: u8,
    cipher_key: Vec<u8>,
    segments: Vec<Segment>,
}

impl Snapshot {
    pub(super) fn new(file: &DxFile) -> Self {
        let metadata: &Metadata = file.metadata();
        Self {
            id: metadata.id,
            dx_path: metadata.dx_path.clone(),
            local_path: metadata.local_path.clone(),
            file_size: metadata.file_size,
            sector_size: metadata.sector_size,
            min_sectors: metadata.min_sectors,
            num_sectors: metadata.num_sectors,
            erasure_code_type: metadata.erasure_code_type,
            cipher_code: metadata.cipher_code,
            cipher_key: metadata.cipher_key.clone(),
            segments: (0..file.num_segments())
                .filter_map(|i| file.segment(i).ok().cloned())
                .collect(),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn dx_path(&self) -> &DxPath {
        &self.dx_path
    }

    pub fn local_path(&self) -> Option<&std::path::Path> {
        self.local_path.as_deref()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn segment_size(&self) -> u64 {
        self.sector_size * self.min_sectors as u64
    }

    pub fn min_sectors(&self) -> u32 {
        self.min_sectors
    }

    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    pub fn erasure_code_type(&self) -> u8 {
        self.erasure_code_type
    }

    pub fn cipher_code(&self) -> u8 {
        self.cipher_code
    }

    pub fn cipher_key(&self) -> Result<CipherKey> {
        CipherKey::from_slice(&self.cipher_key)
    }

    pub fn num_segments(&self) -> u64 {
        self.segments.len() as u64
    }

    pub fn segment_index_by_offset(&self, offset: u64) -> (u64, u64) {
        let segment_size = self.segment_size();
        (offset / segment_size, offset % segment_size)
    }

    pub fn sectors(&self, segment_index: u64) -> Result<&[Option<Sector>]> {
        self.segments
            .get(segment_index as usize)
            .map(|s| s.sectors.as_slice())
            .ok_or_else(|| DxError::Validation(format!("segment {} out of range", segment_index)))
    }

    pub fn segment_stuck(&self, segment_index: u64) -> Result<bool> {
        self.segments
            .get(segment_index as usize)
            .map(|s| s.stuck)
            .ok_or_else(|| DxError::Validation(format!("segment {} out of range", segment_index)))
    }
}
