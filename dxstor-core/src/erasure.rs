//! Reed-Solomon erasure coding
//!
//! A segment of logical data is split into `min_sectors` (k) data shards and
//! expanded to `num_sectors` (n) total shards; any k of the n sectors suffice
//! to recover the segment. The concrete algorithm is selected by a one-byte
//! code type persisted in file metadata, so files written with one coder can
//! be recovered after an algorithm upgrade.

use crate::error::{DxError, Result};
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// Code type tag for the standard Reed-Solomon coder over GF(2^8).
pub const ERASURE_CODE_STANDARD: u8 = 1;

/// Erasure coding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasureConfig {
    /// Number of data sectors (k), the minimum required to reconstruct
    pub min_sectors: u32,
    /// Total number of sectors (n)
    pub num_sectors: u32,
}

impl ErasureConfig {
    pub fn new(min_sectors: u32, num_sectors: u32) -> Result<Self> {
        if min_sectors == 0 {
            return Err(DxError::Validation("min_sectors must be > 0".to_string()));
        }
        if num_sectors < min_sectors {
            return Err(DxError::Validation(format!(
                "num_sectors {} cannot be smaller than min_sectors {}",
                num_sectors, min_sectors
            )));
        }
        Ok(Self {
            min_sectors,
            num_sectors,
        })
    }

    /// Number of parity sectors (n - k)
    pub fn parity_sectors(&self) -> u32 {
        self.num_sectors - self.min_sectors
    }
}

/// An erasure coder transforms a segment of logical data into `num_sectors`
/// physical sectors and back. Implementations must be deterministic:
/// encoding the same data always yields the same sectors.
pub trait ErasureCoder: Send + Sync {
    /// One-byte algorithm tag persisted in file metadata
    fn code_type(&self) -> u8;

    /// Minimum sectors required to recover (k)
    fn min_sectors(&self) -> u32;

    /// Total sectors produced (n)
    fn num_sectors(&self) -> u32;

    /// Encode logical data into exactly `num_sectors` equally sized sectors.
    fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>>;

    /// Recover the original data from any subset of at least `min_sectors`
    /// sectors. Missing sectors are `None`. `data_len` trims padding that
    /// encoding added to fill the last shard.
    fn recover(&self, sectors: &[Option<Bytes>], data_len: usize) -> Result<Bytes>;
}

/// Construct an erasure coder from its persisted code type.
pub fn erasure_coder_by_type(
    code_type: u8,
    min_sectors: u32,
    num_sectors: u32,
) -> Result<Box<dyn ErasureCoder>> {
    match code_type {
        ERASURE_CODE_STANDARD => Ok(Box::new(StandardErasureCode::new(ErasureConfig::new(
            min_sectors,
            num_sectors,
        )?)?)),
        other => Err(DxError::UnknownErasureCode(other)),
    }
}

/// Standard Reed-Solomon coder over GF(2^8)
pub struct StandardErasureCode {
    config: ErasureConfig,
    codec: Option<ReedSolomon>,
}

impl StandardErasureCode {
    pub fn new(config: ErasureConfig) -> Result<Self> {
        // reed_solomon_erasure rejects zero parity shards; with k == n the
        // shards are a plain split and no codec is needed.
        let codec = if config.parity_sectors() == 0 {
            None
        } else {
            Some(ReedSolomon::new(
                config.min_sectors as usize,
                config.parity_sectors() as usize,
            )?)
        };
        Ok(Self { config, codec })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Shard size for a given payload: round up so all data fits.
    fn shard_size(&self, data_len: usize) -> usize {
        let k = self.config.min_sectors as usize;
        (data_len + k - 1) / k
    }
}

impl ErasureCoder for StandardErasureCode {
    fn code_type(&self) -> u8 {
        ERASURE_CODE_STANDARD
    }

    fn min_sectors(&self) -> u32 {
        self.config.min_sectors
    }

    fn num_sectors(&self) -> u32 {
        self.config.num_sectors
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>> {
        let k = self.config.min_sectors as usize;
        let n = self.config.num_sectors as usize;
        let shard_size = self.shard_size(data.len()).max(1);

        // Pad to an even k shards, then append empty parity shards.
        let mut shards: Vec<Vec<u8>> = (0..k)
            .into_par_iter()
            .map(|i| {
                let start = (i * shard_size).min(data.len());
                let end = ((i + 1) * shard_size).min(data.len());
                let mut shard = data[start..end].to_vec();
                shard.resize(shard_size, 0);
                shard
            })
            .collect();
        shards.extend(std::iter::repeat_with(|| vec![0u8; shard_size]).take(n - k));

        if let Some(codec) = &self.codec {
            codec.encode(&mut shards)?;
        }

        Ok(shards.into_iter().map(Bytes::from).collect())
    }

    fn recover(&self, sectors: &[Option<Bytes>], data_len: usize) -> Result<Bytes> {
        let k = self.config.min_sectors as usize;
        let n = self.config.num_sectors as usize;

        if sectors.len() != n {
            return Err(DxError::ErasureCoding(format!(
                "expected {} sector slots, got {}",
                n,
                sectors.len()
            )));
        }

        let available = sectors.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(DxError::InsufficientSectors {
                available,
                required: k,
            });
        }

        let mut shards: Vec<Option<Vec<u8>>> = sectors
            .iter()
            .map(|opt| opt.as_ref().map(|b| b.to_vec()))
            .collect();

        if let Some(codec) = &self.codec {
            codec.reconstruct_data(&mut shards)?;
        }

        let mut out = Vec::with_capacity(data_len);
        for shard in shards.iter().take(k) {
            let shard = shard
                .as_ref()
                .ok_or_else(|| DxError::ErasureCoding("reconstruction left a hole".to_string()))?;
            out.extend_from_slice(shard);
        }
        out.truncate(data_len);
        Ok(Bytes::from(out))
    }
}
