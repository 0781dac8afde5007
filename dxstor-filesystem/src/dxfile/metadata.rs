//! `.dxfile` metadata and on-disk codec
//!
//! Layout: a fixed 4 KiB header holding the serialized [`Metadata`], then
//! one fixed-size record per segment so a segment is addressable directly by
//! `segment_offset(index)` without reading the rest of the table.

use dxstor_core::{DxError, FileId, Hash256, HostId, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::dxpath::DxPath;

/// Size of the fixed metadata header.
pub const HEADER_SIZE: usize = 4096;

/// Current `.dxfile` format version.
pub const DXFILE_VERSION: &str = "1.0.1";

/// Per-sector record size: presence byte + host id + merkle root.
const SECTOR_SLOT_SIZE: usize = 1 + 32 + 32;

/// Metadata of one tracked file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub id: FileId,

    // size related
    pub file_size: u64,
    /// Size of one erasure-coded sector (4 MiB by default).
    pub sector_size: u64,

    // path related
    /// On-disk location of the uploaded source; `None` once the source is
    /// no longer available locally.
    pub local_path: Option<PathBuf>,
    pub dx_path: DxPath,

    // encryption
    pub cipher_code: u8,
    pub cipher_key: Vec<u8>,

    // times, unix seconds
    pub time_modify: u64,
    pub time_update: u64,
    pub time_access: u64,
    pub time_create: u64,

    // repair loop fields
    /// Worst health among the file's unstuck segments.
    pub health: u32,
    /// Worst health among the file's stuck segments.
    pub stuck_health: u32,
    pub time_last_health_check: u64,
    pub num_stuck_segments: u32,
    pub time_recent_repair: u64,
    /// Redundancy from the last check, in percent of `min_sectors`.
    pub last_redundancy: u32,

    /// Unix permission bits of the source file.
    pub file_mode: u32,

    // erasure code fields
    pub erasure_code_type: u8,
    pub min_sectors: u32,
    pub num_sectors: u32,

    pub version: String,
}

impl Metadata {
    /// Logical bytes covered by one segment.
    pub fn segment_size(&self) -> u64 {
        self.sector_size * self.min_sectors as u64
    }

    /// Number of segments covering `file_size` bytes.
    pub fn num_segments(&self) -> u64 {
        let segment_size = self.segment_size();
        if segment_size == 0 {
            return 0;
        }
        (self.file_size + segment_size - 1) / segment_size
    }
}

/// One sector assignment: which host stores the shard and the Merkle root
/// it committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub host_id: HostId,
    pub merkle_root: Hash256,
}

/// One segment row of the table: the stuck bit plus the per-index host
/// assignments. `sectors.len()` always equals `num_sectors`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: u64,
    pub stuck: bool,
    pub sectors: Vec<Option<Sector>>,
}

impl Segment {
    pub fn empty(index: u64, num_sectors: u32) -> Self {
        Self {
            index,
            stuck: false,
            sectors: vec![None; num_sectors as usize],
        }
    }

    /// Number of sectors currently assigned to a host.
    pub fn pieces_completed(&self) -> u32 {
        self.sectors.iter().filter(|s| s.is_some()).count() as u32
    }

    /// Hosts already holding a sector of this segment.
    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.sectors.iter().flatten().map(|s| s.host_id)
    }
}

/// Size of one persisted segment record.
pub fn segment_persist_size(num_sectors: u32) -> usize {
    1 + num_sectors as usize * SECTOR_SLOT_SIZE
}

/// Byte offset of segment `index` within the `.dxfile`.
pub fn segment_offset(index: u64, num_sectors: u32) -> u64 {
    HEADER_SIZE as u64 + index * segment_persist_size(num_sectors) as u64
}

/// Encode the metadata into the fixed header block.
pub fn encode_header(metadata: &Metadata) -> Result<Vec<u8>> {
    let body = bincode::serialize(metadata)
        .map_err(|e| DxError::Corrupt(format!("metadata encode: {}", e)))?;
    if body.len() + 4 > HEADER_SIZE {
        return Err(DxError::Corrupt(format!(
            "metadata too large for header: {} bytes",
            body.len()
        )));
    }
    let mut header = vec![0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
    header[4..4 + body.len()].copy_from_slice(&body);
    Ok(header)
}

/// Decode the fixed header block.
pub fn decode_header(header: &[u8]) -> Result<Metadata> {
    if header.len() < HEADER_SIZE {
        return Err(DxError::Corrupt(format!(
            "truncated dxfile header: {} bytes",
            header.len()
        )));
    }
    let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    if len + 4 > HEADER_SIZE {
        return Err(DxError::Corrupt(format!(
            "dxfile header claims {} bytes",
            len
        )));
    }
    bincode::deserialize(&header[4..4 + len])
        .map_err(|e| DxError::Corrupt(format!("metadata decode: {}", e)))
}

/// Encode one segment record.
pub fn encode_segment(segment: &Segment) -> Vec<u8> {
    let mut out = Vec::with_capacity(segment_persist_size(segment.sectors.len() as u32));
    out.push(segment.stuck as u8);
    for slot in &segment.sectors {
        match slot {
            Some(sector) => {
                out.push(1);
                out.extend_from_slice(&sector.host_id.0);
                out.extend_from_slice(sector.merkle_root.as_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&[0u8; 64]);
            }
        }
    }
    out
}

/// Decode one segment record.
pub fn decode_segment(raw: &[u8], index: u64, num_sectors: u32) -> Result<Segment> {
    let expected = segment_persist_size(num_sectors);
    if raw.len() < expected {
        return Err(DxError::Corrupt(format!(
            "truncated segment {}: {} of {} bytes",
            index,
            raw.len(),
            expected
        )));
    }
    let stuck = match raw[0] {
        0 => false,
        1 => true,
        other => {
            return Err(DxError::Corrupt(format!(
                "segment {} has invalid stuck byte {}",
                index, other
            )))
        }
    };
    let mut sectors = Vec::with_capacity(num_sectors as usize);
    for i in 0..num_sectors as usize {
        let slot = &raw[1 + i * SECTOR_SLOT_SIZE..1 + (i + 1) * SECTOR_SLOT_SIZE];
        match slot[0] {
            0 => sectors.push(None),
            1 => {
                let mut host = [0u8; 32];
                host.copy_from_slice(&slot[1..33]);
                sectors.push(Some(Sector {
                    host_id: HostId(host),
                    merkle_root: Hash256::from_slice(&slot[33..65])?,
                }));
            }
            other => {
                return Err(DxError::Corrupt(format!(
                    "segment {} slot {} has invalid presence byte {}",
                    index, i, other
                )))
            }
        }
    }
    Ok(Segment {
        index,
        stuck,
        sectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dxstor_core::{DEFAULT_HEALTH, DEFAULT_MIN_SECTORS, DEFAULT_NUM_SECTORS, SECTOR_SIZE};

    pub(crate) fn sample_metadata() -> Metadata {
        Metadata {
            id: FileId::new(),
            file_size: 123_456_789,
            sector_size: SECTOR_SIZE,
            local_path: Some(PathBuf::from("/tmp/source.bin")),
            dx_path: DxPath::new("docs/report").unwrap(),
            cipher_code: 1,
            cipher_key: vec![7u8; 32],
            time_modify: 1_700_000_000,
            time_update: 1_700_000_001,
            time_access: 1_700_000_002,
            time_create: 1_699_999_999,
            health: DEFAULT_HEALTH,
            stuck_health: DEFAULT_HEALTH,
            time_last_health_check: 0,
            num_stuck_segments: 0,
            time_recent_repair: 0,
            last_redundancy: 0,
            file_mode: 0o644,
            erasure_code_type: 1,
            min_sectors: DEFAULT_MIN_SECTORS,
            num_sectors: DEFAULT_NUM_SECTORS,
            version: DXFILE_VERSION.to_string(),
        }
    }

    #[test]
    fn test_header_roundtrip_bit_exact() {
        let metadata = sample_metadata();
        let header = encode_header(&metadata).unwrap();
        assert_eq!(header.len(), HEADER_SIZE);
        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_segment_roundtrip() {
        let mut segment = Segment::empty(4, 6);
        segment.stuck = true;
        segment.sectors[0] = Some(Sector {
            host_id: HostId([1u8; 32]),
            merkle_root: Hash256([2u8; 32]),
        });
        segment.sectors[5] = Some(Sector {
            host_id: HostId([3u8; 32]),
            merkle_root: Hash256([4u8; 32]),
        });

        let raw = encode_segment(&segment);
        assert_eq!(raw.len(), segment_persist_size(6));
        let decoded = decode_segment(&raw, 4, 6).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_segment(&[9u8; 200], 0, 3).is_err());
        assert!(decode_header(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_num_segments() {
        let mut metadata = sample_metadata();
        metadata.min_sectors = 2;
        metadata.sector_size = 100;
        metadata.file_size = 0;
        assert_eq!(metadata.num_segments(), 0);
        metadata.file_size = 1;
        assert_eq!(metadata.num_segments(), 1);
        metadata.file_size = 200;
        assert_eq!(metadata.num_segments(), 1);
        metadata.file_size = 201;
        assert_eq!(metadata.num_segments(), 2);
    }

    #[test]
    fn test_segment_offsets_addressable() {
        let n = 30u32;
        assert_eq!(segment_offset(0, n), HEADER_SIZE as u64);
        assert_eq!(
            segment_offset(3, n),
            HEADER_SIZE as u64 + 3 * segment_persist_size(n) as u64
        );
    }
}
