//! dxstor core library
//!
//! Shared primitives for the dxstor storage client:
//! - Reed-Solomon erasure coding behind a pluggable coder trait
//! - AES-256-GCM sector cipher with deterministic per-sector nonces
//! - Binary Merkle tree over 64-byte leaves (single and range proofs)
//! - Human-readable unit parsing (currency, block durations)
//! - Common identifiers and error handling

pub mod crypto;
pub mod erasure;
pub mod error;
pub mod merkle;
pub mod unit;

pub use crypto::{CipherKey, SectorCipher};
pub use erasure::{ErasureCoder, ErasureConfig, StandardErasureCode, ERASURE_CODE_STANDARD};
pub use error::{DxError, Result};
pub use merkle::{merkle_root, MerkleProof, MerkleRangeProof, LEAF_SIZE};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one erasure-coded sector stored on a host (4 MiB).
pub const SECTOR_SIZE: u64 = 4 * 1024 * 1024;

/// Default minimum sectors (k) needed to recover a segment.
pub const DEFAULT_MIN_SECTORS: u32 = 10;

/// Default total sectors (n) produced per segment.
pub const DEFAULT_NUM_SECTORS: u32 = 30;

/// Fraction of parity sectors that must be missing before a repair
/// re-downloads the segment from the network instead of re-reading it
/// from the local source.
pub const REMOTE_REPAIR_DOWNLOAD_THRESHOLD: f64 = 0.25;

/// Health of a segment with full target redundancy. Health is an integer
/// in [0, DEFAULT_HEALTH]; lower is worse.
pub const DEFAULT_HEALTH: u32 = 200;

/// 32-byte hash, the unit of Merkle roots and sector identifiers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(DxError::Validation(format!(
                "invalid hash length: expected 32, got {}",
                slice.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(slice);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<blake3::Hash> for Hash256 {
    fn from(h: blake3::Hash) -> Self {
        Self(*h.as_bytes())
    }
}

/// Unique identifier of a tracked file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct FileId(pub uuid::Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a contracted storage host.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct HostId(pub [u8; 32]);

impl HostId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut b = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut b);
        Self(b)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Health of a segment given how many of its sectors are present.
///
/// A segment holding only the minimum `k` sectors has health 0; a fully
/// redundant segment has health [`DEFAULT_HEALTH`]. Below `k` present
/// sectors the segment is unrecoverable without the local source and the
/// health stays pinned at 0.
pub fn segment_health(pieces_completed: u32, min_sectors: u32, num_sectors: u32) -> u32 {
    if num_sectors <= min_sectors {
        // No parity configured: complete or worthless.
        return if pieces_completed >= num_sectors {
            DEFAULT_HEALTH
        } else {
            0
        };
    }
    if pieces_completed <= min_sectors {
        return 0;
    }
    let health =
        DEFAULT_HEALTH as u64 * (pieces_completed - min_sectors) as u64 / (num_sectors - min_sectors) as u64;
    (health as u32).min(DEFAULT_HEALTH)
}
