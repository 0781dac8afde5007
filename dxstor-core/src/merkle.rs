//! Binary Merkle tree over 64-byte leaves
//!
//! Sector payloads are committed to by a Merkle root over 64-byte leaves.
//! Hosts answer ranged reads with a proof; the client verifies the returned
//! bytes against the root it stored at upload time before accepting them.
//!
//! Tree shape for a non-power-of-two leaf count: the left subtree covers the
//! largest power of two strictly smaller than the leaf count, matching the
//! shape assumed by range proofs. Leaf and interior hashes are domain
//! separated so a leaf can never be replayed as an interior node.

use crate::error::{DxError, Result};
use crate::Hash256;

/// Size of one Merkle leaf in bytes
pub const LEAF_SIZE: usize = 64;

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

/// Number of leaves needed to cover `data_size` bytes.
pub fn leaves_count(data_size: u64) -> u64 {
    (data_size + LEAF_SIZE as u64 - 1) / LEAF_SIZE as u64
}

fn leaf_hash(leaf: &[u8]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_PREFIX);
    hasher.update(leaf);
    hasher.finalize().into()
}

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_PREFIX);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize().into()
}

/// Largest power of two strictly smaller than n (n >= 2).
fn split_point(n: usize) -> usize {
    let mut split = 1;
    while split * 2 < n {
        split *= 2;
    }
    split
}

fn leaf_at(data: &[u8], index: usize) -> &[u8] {
    let start = index * LEAF_SIZE;
    let end = ((index + 1) * LEAF_SIZE).min(data.len());
    &data[start..end]
}

/// Root of the subtree covering leaves [a, b) of `data`.
fn subtree_root(data: &[u8], a: usize, b: usize) -> Hash256 {
    if b - a == 1 {
        return leaf_hash(leaf_at(data, a));
    }
    let split = split_point(b - a);
    let left = subtree_root(data, a, a + split);
    let right = subtree_root(data, a + split, b);
    node_hash(&left, &right)
}

/// Merkle root of `data` over 64-byte leaves. The empty input has the
/// all-zero root.
pub fn merkle_root(data: &[u8]) -> Hash256 {
    let n = leaves_count(data.len() as u64) as usize;
    if n == 0 {
        return Hash256::default();
    }
    subtree_root(data, 0, n)
}

fn range_check(start: usize, end: usize, num_leaves: usize) -> Result<()> {
    if start >= end || end > num_leaves {
        return Err(DxError::Validation(format!(
            "invalid proof range [{}, {}) over {} leaves",
            start, end, num_leaves
        )));
    }
    Ok(())
}

/// Collect the proof hashes for subtrees disjoint from [start, end),
/// in the order the verifier's recursion consumes them.
fn collect_range_proof(
    data: &[u8],
    a: usize,
    b: usize,
    start: usize,
    end: usize,
    out: &mut Vec<Hash256>,
) {
    if a >= start && b <= end {
        // entirely covered: the verifier recomputes this subtree from the
        // range data itself
        return;
    }
    if b <= start || a >= end {
        out.push(subtree_root(data, a, b));
        return;
    }
    let split = split_point(b - a);
    collect_range_proof(data, a, a + split, start, end, out);
    collect_range_proof(data, a + split, b, start, end, out);
}

/// Recompute the root from range data plus proof hashes, mirroring
/// `collect_range_proof`'s traversal.
fn fold_range_proof(
    range_data: &[u8],
    a: usize,
    b: usize,
    start: usize,
    end: usize,
    proof: &mut std::slice::Iter<'_, Hash256>,
) -> Result<Hash256> {
    if a >= start && b <= end {
        // recompute from the supplied range bytes; leaf i of the tree is
        // leaf (i - start) of range_data
        let offset = (a - start) * LEAF_SIZE;
        let len = (b - a) * LEAF_SIZE;
        let end_offset = (offset + len).min(range_data.len());
        if offset > range_data.len() {
            return Err(DxError::Validation(
                "range data shorter than proof range".to_string(),
            ));
        }
        let slice = &range_data[offset..end_offset];
        return Ok(subtree_root(slice, 0, b - a));
    }
    if b <= start || a >= end {
        return proof
            .next()
            .copied()
            .ok_or(DxError::ProofVerificationFailed);
    }
    let split = split_point(b - a);
    let left = fold_range_proof(range_data, a, a + split, start, end, proof)?;
    let right = fold_range_proof(range_data, a + split, b, start, end, proof)?;
    Ok(node_hash(&left, &right))
}

/// Proof that a contiguous leaf range [start, end) belongs to a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleRangeProof {
    pub hashes: Vec<Hash256>,
}

impl MerkleRangeProof {
    /// Build a proof for leaves [start, end) of `data`.
    pub fn build(data: &[u8], start: usize, end: usize) -> Result<Self> {
        let num_leaves = leaves_count(data.len() as u64) as usize;
        range_check(start, end, num_leaves)?;
        let mut hashes = Vec::new();
        collect_range_proof(data, 0, num_leaves, start, end, &mut hashes);
        Ok(Self { hashes })
    }

    /// Verify `range_data` (the bytes of leaves [start, end)) against `root`.
    pub fn verify(
        &self,
        range_data: &[u8],
        start: usize,
        end: usize,
        num_leaves: usize,
        root: &Hash256,
    ) -> Result<bool> {
        range_check(start, end, num_leaves)?;
        if leaves_count(range_data.len() as u64) as usize != end - start {
            return Ok(false);
        }
        let mut iter = self.hashes.iter();
        let computed = fold_range_proof(range_data, 0, num_leaves, start, end, &mut iter)?;
        if iter.next().is_some() {
            // trailing garbage in the proof set
            return Ok(false);
        }
        Ok(computed == *root)
    }
}

/// Proof for a single 64-byte leaf, a thin wrapper over the range proof.
#[derive(Debug, Clone)]
pub struct MerkleProof {
    pub leaf: Vec<u8>,
    pub index: u64,
    pub num_leaves: u64,
    pub range: MerkleRangeProof,
}

impl MerkleProof {
    pub fn build(data: &[u8], index: u64) -> Result<Self> {
        let num_leaves = leaves_count(data.len() as u64);
        if index >= num_leaves {
            return Err(DxError::Validation(format!(
                "proof index {} out of range ({} leaves)",
                index, num_leaves
            )));
        }
        let range = MerkleRangeProof::build(data, index as usize, index as usize + 1)?;
        Ok(Self {
            leaf: leaf_at(data, index as usize).to_vec(),
            index,
            num_leaves,
            range,
        })
    }

    pub fn verify(&self, root: &Hash256) -> bool {
        self.range
            .verify(
                &self.leaf,
                self.index as usize,
                self.index as usize + 1,
                self.num_leaves as usize,
                root,
            )
            .unwrap_or(false)
    }
}
