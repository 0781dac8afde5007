//! Shared fixtures for unit tests.

use crate::contracts::{
    ContractId, ContractMeta, ContractSet, HostSession, SectorRequest, SectorResponse,
};
use crate::download::DownloadHeap;
use crate::memorymanager::MemoryManager;
use crate::settings::ClientSettings;
use crate::uploadheap::UploadHeap;
use crate::ClientContext;
use async_trait::async_trait;
use bytes::Bytes;
use dxstor_core::{CipherKey, DxError, HostId, Result};
use dxstor_filesystem::{DxPath, FileEntry, FileSystem, NewFileParams};
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

/// A host session that refuses every request.
pub(crate) struct NullHost;

#[async_trait]
impl HostSession for NullHost {
    async fn upload_sector(&self, _host: HostId, _data: Bytes) -> Result<()> {
        Err(DxError::Network("null host".to_string()))
    }

    async fn download_sector(
        &self,
        _host: HostId,
        _request: SectorRequest,
    ) -> Result<SectorResponse> {
        Err(DxError::Network("null host".to_string()))
    }
}

#[allow(dead_code)]
pub(crate) struct TestEnv {
    pub ctx: Arc<ClientContext>,
    pub contracts: Arc<ContractSet>,
    pub stuck_rx: mpsc::Receiver<DxPath>,
    pub shutdown_tx: watch::Sender<bool>,
    _tmp: TempDir,
}

pub(crate) fn test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stuck_tx, stuck_rx) = mpsc::channel(1);
    let contracts = Arc::new(ContractSet::new());
    let ctx = Arc::new(ClientContext {
        memory: MemoryManager::new(1 << 20, shutdown_rx.clone()),
        host_client: Arc::new(NullHost),
        contracts: contracts.clone(),
        file_system: Arc::new(FileSystem::new(tmp.path()).unwrap()),
        upload_heap: Arc::new(UploadHeap::new()),
        download_heap: Arc::new(DownloadHeap::new()),
        settings: RwLock::new(ClientSettings::default()),
        stuck_success_tx: stuck_tx,
        shutdown: shutdown_rx,
        online: AtomicBool::new(true),
    });
    TestEnv {
        ctx,
        contracts,
        stuck_rx,
        shutdown_tx,
        _tmp: tmp,
    }
}

pub(crate) fn contract(host: HostId, ip: [u8; 4]) -> ContractMeta {
    ContractMeta {
        id: ContractId::random(),
        host_id: host,
        ip: Some(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
        upload_ability: true,
        renew_ability: true,
        canceled: false,
    }
}

/// A small file with k=2, n=4, 64-byte sectors (128-byte segments).
pub(crate) fn new_file(env: &TestEnv, name: &str, size: u64) -> FileEntry {
    env.ctx
        .file_system
        .new_dx_file(
            NewFileParams {
                dx_path: DxPath::new(name).unwrap(),
                local_path: None,
                file_size: size,
                sector_size: 64,
                erasure_code_type: 1,
                min_sectors: 2,
                num_sectors: 4,
                cipher_code: 1,
                cipher_key: CipherKey::generate(),
                file_mode: 0o644,
            },
            false,
        )
        .unwrap()
}
