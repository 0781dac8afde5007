//! Contracts and the opaque host session
//!
//! The engine sees storage hosts through two narrow seams: the contract set
//! (which hosts we currently rent space from) and the [`HostSession`] trait
//! carrying the sector upload/download wire protocol. Negotiation,
//! renewal, and host scoring live outside the engine; tests inject
//! in-memory implementations.

use async_trait::async_trait;
use bytes::Bytes;
use dxstor_core::{Hash256, HostId, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Identifier of one storage contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ContractId(pub [u8; 32]);

impl ContractId {
    pub fn random() -> Self {
        use rand::RngCore;
        let mut b = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut b);
        Self(b)
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({})", &hex::encode(self.0)[..16])
    }
}

/// Metadata of an active contract with one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractMeta {
    pub id: ContractId,
    pub host_id: HostId,
    /// Host address, used for the /24 subnet check when IP violation
    /// filtering is enabled.
    pub ip: Option<Ipv4Addr>,
    /// Whether the contract can still accept uploads.
    pub upload_ability: bool,
    /// Whether the contract is scheduled for renewal.
    pub renew_ability: bool,
    pub canceled: bool,
}

impl ContractMeta {
    pub fn good_for_upload(&self) -> bool {
        self.upload_ability && !self.canceled
    }
}

/// The set of active contracts, one per host.
#[derive(Default)]
pub struct ContractSet {
    contracts: RwLock<HashMap<ContractId, ContractMeta>>,
}

impl ContractSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: ContractMeta) {
        self.contracts.write().insert(meta.id, meta);
    }

    pub fn remove(&self, id: &ContractId) -> Option<ContractMeta> {
        self.contracts.write().remove(id)
    }

    pub fn get(&self, id: &ContractId) -> Option<ContractMeta> {
        self.contracts.read().get(id).cloned()
    }

    /// Snapshot of every active contract.
    pub fn active(&self) -> Vec<ContractMeta> {
        self.contracts
            .read()
            .values()
            .filter(|c| !c.canceled)
            .cloned()
            .collect()
    }

    /// Hosts backing the active contracts.
    pub fn active_hosts(&self) -> Vec<HostId> {
        self.active().into_iter().map(|c| c.host_id).collect()
    }

    pub fn host_active(&self, host: &HostId) -> bool {
        self.contracts
            .read()
            .values()
            .any(|c| !c.canceled && c.host_id == *host)
    }

    pub fn len(&self) -> usize {
        self.contracts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.read().is_empty()
    }
}

impl dxstor_filesystem::HostHealthOracle for ContractSet {
    fn host_healthy(&self, host: &HostId) -> bool {
        self.host_active(host)
    }
}

/// A ranged sector read request. `merkle_proof` asks the host to include a
/// range proof for the returned bytes.
#[derive(Debug, Clone)]
pub struct SectorRequest {
    pub merkle_root: Hash256,
    pub offset: u32,
    pub length: u32,
    pub merkle_proof: bool,
}

/// Response to a sector read.
#[derive(Debug, Clone)]
pub struct SectorResponse {
    pub data: Bytes,
    pub proof: Vec<Hash256>,
    pub root: Hash256,
}

/// Opaque wire protocol to a storage host. The engine only ever appends
/// whole sectors and issues ranged, proof-carrying reads.
#[async_trait]
pub trait HostSession: Send + Sync {
    /// Store one sector on the host. The caller has already computed the
    /// sector's Merkle root and records it in file metadata on success.
    async fn upload_sector(&self, host: HostId, data: Bytes) -> Result<()>;

    /// Read a byte range of a stored sector.
    async fn download_sector(&self, host: HostId, request: SectorRequest)
        -> Result<SectorResponse>;
}
