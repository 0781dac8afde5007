//! Repair machinery
//!
//! `fetch_and_repair` turns one popped upload segment into uploaded
//! sectors: reserve memory, fetch the logical data (from the local source
//! or, if enough redundancy remains, by a de-prioritized repair download),
//! erasure-encode, encrypt the missing pieces, distribute to every worker.
//! `cleanup_upload_segment` is the reconciliation pass that runs after
//! every worker transition and converges the segment to complete, stuck,
//! or released without leaking a byte of reserved memory.

use dxstor_core::erasure::erasure_coder_by_type;
use dxstor_core::{
    segment_health, DxError, Result, SectorCipher, DEFAULT_HEALTH,
    REMOTE_REPAIR_DOWNLOAD_THRESHOLD,
};
use dxstor_filesystem::FileEntry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

use crate::download::{new_download, DownloadBuffer, DownloadParams};
use crate::memorymanager::MemoryPriority;
use crate::uploadheap::{UnfinishedUploadSegment, UploadSegmentId};
use crate::worker::WorkerPool;
use crate::{ClientContext, StorageClient};

/// Latency target for repair downloads; repairs do not race replicas.
const REPAIR_DOWNLOAD_LATENCY: std::time::Duration = std::time::Duration::from_secs(200);

/// Reconcile an upload segment after any state transition.
///
/// Releases the buffers of pieces no remaining worker could take, detects
/// completion, releases the segment exactly once, and re-arms standby
/// workers when a piece opened back up.
pub fn cleanup_upload_segment(segment: &Arc<UnfinishedUploadSegment>, ctx: &Arc<ClientContext>) {
    let (pieces_available, memory_released, complete, newly_released, total_released) = {
        let mut state = segment.state();
        let mut pieces_available: u32 = 0;
        let mut memory_released: u64 = 0;
        // Release any piece that no remaining worker can take; count the
        // rest as available. Scanning from the front keeps earlier pieces,
        // which keeps erasure decoding cheap.
        for i in 0..state.piece_usage.len() {
            if state.piece_usage[i] {
                continue;
            }
            if pieces_available >= state.workers_remaining {
                memory_released += segment.sector_size;
                state.physical_data[i] = None;
                // claim the slot so the memory is not released twice
                state.piece_usage[i] = true;
            } else {
                pieces_available += 1;
            }
        }
        let complete = UnfinishedUploadSegment::segment_complete(&state, segment.pieces_needed);
        let newly_released = complete && !state.released;
        if newly_released {
            state.released = true;
        }
        state.memory_released += memory_released;
        (
            pieces_available,
            memory_released,
            complete,
            newly_released,
            state.memory_released,
        )
    };

    // standby workers only help once a piece is actually open
    if pieces_available > 0 {
        for standby in segment.take_standby_workers() {
            standby.queue_upload_segment(segment.clone());
        }
    }
    if memory_released > 0 {
        ctx.memory.return_memory(memory_released);
    }
    if newly_released {
        update_segment_stuck_status(segment, ctx);
        ctx.upload_heap.remove_repairing(&segment.id);
    }
    if complete && total_released != segment.memory_needed {
        warn!(
            id = ?segment.id,
            released = total_released,
            needed = segment.memory_needed,
            "segment complete but memory accounting is off"
        );
    }
}

/// Decide whether the repair reached its threshold and flip the segment's
/// stuck bit accordingly. Signals the stuck loop when a stuck-repair
/// segment came back healthy.
fn update_segment_stuck_status(segment: &Arc<UnfinishedUploadSegment>, ctx: &Arc<ClientContext>) {
    let pieces_completed = segment.state().pieces_completed;
    let required = (1.0 - REMOTE_REPAIR_DOWNLOAD_THRESHOLD) * segment.pieces_needed as f64;
    let successful = pieces_completed as f64 >= required;

    // a client that is offline or shutting down failed the repair, not the
    // segment
    let client_error = *ctx.shutdown.borrow() || !ctx.online.load(Ordering::SeqCst);
    if !successful && client_error {
        debug!(id = ?segment.id, "repair unsuccessful due to client state; leaving stuck bit");
        return;
    }
    if successful {
        debug!(id = ?segment.id, pieces_completed, "repair successful, marking unstuck");
    } else {
        info!(
            id = ?segment.id,
            pieces_completed,
            pieces_needed = segment.pieces_needed,
            "repair unsuccessful, marking stuck"
        );
    }

    if let Err(e) = segment
        .file_entry
        .write()
        .set_stuck_by_index(segment.index, !successful)
    {
        warn!(id = ?segment.id, error = %e, "could not update segment stuck status");
    }

    let dx_path = segment.file_entry.dx_path().clone();
    if let Some(parent) = dx_path.parent() {
        ctx.file_system.queue_bubble(&parent);
    }

    if segment.stuck && successful && segment.stuck_repair {
        debug!(id = ?segment.id, "stuck segment successfully repaired");
        let _ = ctx.stuck_success_tx.try_send(dx_path);
    }
}

/// Fetch the logical data of a segment, preferring the local source and
/// falling back to a repair download while enough redundancy remains.
async fn fetch_logical_data(
    segment: &Arc<UnfinishedUploadSegment>,
    ctx: &Arc<ClientContext>,
) -> Result<Vec<u8>> {
    // only re-download when more than the threshold share of parity is gone
    let (pieces_completed, num_parity) = {
        let state = segment.state();
        (
            state.pieces_completed,
            segment.pieces_needed - segment.minimum_pieces,
        )
    };
    let min_missing_for_download =
        (num_parity as f64 * REMOTE_REPAIR_DOWNLOAD_THRESHOLD) as u32;
    let download_allowed = pieces_completed + min_missing_for_download < segment.pieces_needed;

    let local_path = segment
        .file_entry
        .read()
        .local_path()
        .map(|p| p.to_path_buf());
    let Some(path) = local_path else {
        if download_allowed {
            return download_logical_data(segment, ctx).await;
        }
        return Err(DxError::Validation(
            "file not available locally and redundancy too low to rebuild remotely".to_string(),
        ));
    };

    match read_logical_from_disk(&path, segment.offset, segment.length).await {
        Ok(data) => Ok(data),
        Err(e) if download_allowed => {
            debug!(id = ?segment.id, error = %e, "local read failed, repairing from network");
            download_logical_data(segment, ctx).await
        }
        Err(e) => {
            warn!(id = ?segment.id, error = %e, "local read failed and no remote fallback");
            Err(e)
        }
    }
}

async fn read_logical_from_disk(
    path: &std::path::Path,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; length as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}

/// Issue a fully de-prioritized download of the segment through the normal
/// download pipeline. The repair already holds the memory reservation, so
/// the download runs with `needs_memory = false`.
async fn download_logical_data(
    segment: &Arc<UnfinishedUploadSegment>,
    ctx: &Arc<ClientContext>,
) -> Result<Vec<u8>> {
    let snapshot = Arc::new(segment.file_entry.read().snapshot());
    let buffer = Arc::new(Mutex::new(DownloadBuffer::new(segment.length)));
    let download = new_download(
        &ctx.download_heap,
        DownloadParams {
            file: snapshot,
            destination: buffer.clone(),
            offset: segment.offset,
            length: segment.length,
            latency_target: REPAIR_DOWNLOAD_LATENCY,
            needs_memory: false,
            overdrive: 0,
            priority: 0,
        },
    )?;

    let mut shutdown = ctx.shutdown.clone();
    tokio::select! {
        result = download.wait() => result?,
        _ = shutdown.wait_for(|stopped| *stopped) => return Err(DxError::Shutdown),
    }

    let mut buffer = buffer.lock();
    Ok(std::mem::take(&mut buffer.buf))
}

/// The repair pipeline for one segment: memory, logical data, encode,
/// encrypt, distribute. Ends with a reconciliation pass on every path.
pub async fn fetch_and_repair(
    segment: Arc<UnfinishedUploadSegment>,
    ctx: Arc<ClientContext>,
    pool: Arc<WorkerPool>,
) {
    if let Err(e) = ctx
        .memory
        .request(segment.memory_needed, MemoryPriority::Low)
        .await
    {
        if !e.is_shutdown() {
            warn!(id = ?segment.id, error = %e, "repair memory reservation failed");
        }
        // nothing was reserved; free the repair slot so a later cycle can
        // take the segment again
        ctx.upload_heap.remove_repairing(&segment.id);
        return;
    }

    let erasure_memory = segment.sector_size * segment.minimum_pieces as u64;
    let completed_memory = {
        let state = segment.state();
        segment.sector_size * state.piece_usage.iter().filter(|u| **u).count() as u64
    };

    // logical data
    let logical = match fetch_logical_data(&segment, &ctx).await {
        Ok(data) => data,
        Err(e) => {
            debug!(id = ?segment.id, error = %e, "fetching logical segment data failed");
            {
                let mut state = segment.state();
                state.logical_data = None;
                state.workers_remaining = 0;
                state.memory_released += erasure_memory + completed_memory;
            }
            ctx.memory.return_memory(erasure_memory + completed_memory);
            cleanup_upload_segment(&segment, &ctx);
            return;
        }
    };

    // erasure-encode; the encoder needs the full segment, so pad the tail
    let coder = match erasure_coder_by_type(
        segment.file_entry.read().erasure_code_type(),
        segment.minimum_pieces,
        segment.pieces_needed,
    ) {
        Ok(coder) => coder,
        Err(e) => {
            error!(id = ?segment.id, error = %e, "unusable erasure coder");
            {
                let mut state = segment.state();
                state.workers_remaining = 0;
                state.memory_released += erasure_memory + completed_memory;
            }
            ctx.memory.return_memory(erasure_memory + completed_memory);
            cleanup_upload_segment(&segment, &ctx);
            return;
        }
    };
    let segment_size = segment.sector_size * segment.minimum_pieces as u64;
    let mut padded = logical;
    padded.resize(segment_size as usize, 0);
    let encoded = coder.encode(&padded);
    drop(padded);
    {
        let mut state = segment.state();
        state.logical_data = None;
        state.memory_released += erasure_memory;
    }
    ctx.memory.return_memory(erasure_memory);

    let sectors = match encoded {
        Ok(sectors) => sectors,
        Err(e) => {
            error!(id = ?segment.id, error = %e, "erasure encoding failed");
            {
                let mut state = segment.state();
                state.workers_remaining = 0;
                state.memory_released += completed_memory;
            }
            ctx.memory.return_memory(completed_memory);
            cleanup_upload_segment(&segment, &ctx);
            return;
        }
    };
    if sectors.len() < segment.state().piece_usage.len() {
        error!(id = ?segment.id, "not enough encoded sectors for the file's piece table");
        {
            let mut state = segment.state();
            state.workers_remaining = 0;
            state.memory_released += completed_memory;
        }
        ctx.memory.return_memory(completed_memory);
        cleanup_upload_segment(&segment, &ctx);
        return;
    }

    // encrypt the pieces that still need uploading, drop the duplicates
    let encrypt_result = (|| -> Result<()> {
        let key = segment.file_entry.read().cipher_key()?;
        let cipher = SectorCipher::new(&key)?;
        let file_id = segment.id.file_id;
        let mut state = segment.state();
        for (i, sector) in sectors.into_iter().enumerate() {
            if state.piece_usage[i] {
                state.physical_data[i] = None;
            } else {
                let ciphertext =
                    cipher.encrypt_sector(&file_id, segment.index, i as u32, &sector)?;
                state.physical_data[i] = Some(ciphertext);
            }
        }
        Ok(())
    })();
    if let Err(e) = encrypt_result {
        error!(id = ?segment.id, error = %e, "sector encryption failed");
        {
            let mut state = segment.state();
            state.workers_remaining = 0;
            state.physical_data.iter_mut().for_each(|slot| *slot = None);
            state.memory_released += completed_memory;
        }
        ctx.memory.return_memory(completed_memory);
        cleanup_upload_segment(&segment, &ctx);
        return;
    }

    if completed_memory > 0 {
        segment.state().memory_released += completed_memory;
        ctx.memory.return_memory(completed_memory);
    }

    distribute_segment_to_workers(&segment, &pool);
    cleanup_upload_segment(&segment, &ctx);
}

/// Hand a fully prepared segment to every worker in the pool.
fn distribute_segment_to_workers(segment: &Arc<UnfinishedUploadSegment>, pool: &Arc<WorkerPool>) {
    let workers = pool.workers();
    segment.state().workers_remaining += workers.len() as u32;
    debug!(id = ?segment.id, workers = workers.len(), "distributing segment to workers");
    for worker in workers {
        worker.queue_upload_segment(segment.clone());
    }
}

/// /24 network of an IPv4 address, for the IP violation check.
fn subnet24(ip: Ipv4Addr) -> [u8; 3] {
    let octets = ip.octets();
    [octets[0], octets[1], octets[2]]
}

/// Build unfinished upload segments for every segment of `file_entry` that
/// matches `target_stuck` and is missing sectors.
pub fn create_unfinished_upload_segments(
    file_entry: &FileEntry,
    ctx: &Arc<ClientContext>,
    target_stuck: bool,
    stuck_repair: bool,
    only_index: Option<u64>,
) -> Vec<Arc<UnfinishedUploadSegment>> {
    let enable_ip_violation = ctx.settings.read().enable_ip_violation;
    let contracts = ctx.contracts.active();
    let mut segments = Vec::new();

    let file = file_entry.read();
    let k = file.min_sectors();
    let n = file.num_sectors();
    let segment_size = file.segment_size();

    for index in 0..file.num_segments() {
        if let Some(only) = only_index {
            if index != only {
                continue;
            }
        }
        let Ok(table) = file.segment(index) else { continue };
        if table.stuck != target_stuck {
            continue;
        }

        let mut piece_usage = vec![false; n as usize];
        let mut used_hosts = HashSet::new();
        for (i, slot) in table.sectors.iter().enumerate() {
            if let Some(sector) = slot {
                if ctx.contracts.host_active(&sector.host_id) {
                    piece_usage[i] = true;
                    used_hosts.insert(sector.host_id);
                }
            }
        }
        let pieces_completed = piece_usage.iter().filter(|u| **u).count() as u32;
        if pieces_completed >= n {
            continue;
        }

        let used_subnets: HashSet<[u8; 3]> = if enable_ip_violation {
            contracts
                .iter()
                .filter(|c| used_hosts.contains(&c.host_id))
                .filter_map(|c| c.ip.map(subnet24))
                .collect()
        } else {
            HashSet::new()
        };
        let unused_hosts: HashSet<_> = contracts
            .iter()
            .filter(|c| c.good_for_upload() && !used_hosts.contains(&c.host_id))
            .filter(|c| {
                !enable_ip_violation
                    || c.ip.map_or(true, |ip| !used_subnets.contains(&subnet24(ip)))
            })
            .map(|c| c.host_id)
            .collect();

        let offset = index * segment_size;
        let length = segment_size.min(file.file_size() - offset);
        segments.push(UnfinishedUploadSegment::new(
            UploadSegmentId {
                file_id: file.id(),
                index,
            },
            file_entry.duplicate(),
            index,
            offset,
            length,
            file.sector_size(),
            k,
            n,
            piece_usage,
            unused_hosts,
            table.stuck,
            stuck_repair,
            segment_health(pieces_completed, k, n),
        ));
    }
    segments
}

/// Consumer loop: waits for heap activity, reconciles the worker pool, and
/// launches up to the configured number of concurrent repairs.
pub(crate) async fn upload_loop(client: Arc<StorageClient>) {
    let ctx = client.context().clone();
    let mut shutdown = ctx.shutdown.clone();
    info!("upload loop started");
    loop {
        tokio::select! {
            _ = ctx.upload_heap.segment_coming.notified() => {}
            _ = ctx.upload_heap.new_uploads.notified() => {}
            _ = tokio::time::sleep(client.config().repair_interval) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("upload loop shutting down");
                return;
            }
        }
        client.refresh_hosts_and_workers();
        loop {
            if ctx.upload_heap.repairing_count() >= client.config().max_concurrent_repairs {
                break;
            }
            let Some(segment) = ctx.upload_heap.pop() else { break };
            debug!(id = ?segment.id, "launching repair");
            tokio::spawn(fetch_and_repair(
                segment,
                ctx.clone(),
                client.worker_pool().clone(),
            ));
        }
    }
}

/// Producer loop: periodically scans directories in ascending-health order
/// and queues the unstuck segments that are missing redundancy.
pub(crate) async fn upload_or_repair_loop(client: Arc<StorageClient>) {
    let ctx = client.context().clone();
    let mut shutdown = ctx.shutdown.clone();
    info!("upload-or-repair loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(client.config().repair_scan_interval) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("upload-or-repair loop shutting down");
                return;
            }
        }
        if client.worker_pool().is_empty() {
            client.refresh_hosts_and_workers();
            if client.worker_pool().is_empty() {
                continue;
            }
        }
        let dirs = match ctx.file_system.dirs_by_health() {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(error = %e, "repair scan could not list directories");
                continue;
            }
        };
        let mut queued = 0usize;
        for (dir, metadata) in dirs {
            if metadata.health >= DEFAULT_HEALTH {
                // aggregate says healthy; the health loop will refresh it
                // if contracts changed underneath
                continue;
            }
            let files = match ctx.file_system.file_paths_in_dir(&dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "repair scan could not list files");
                    continue;
                }
            };
            for file_path in files {
                let entry = match ctx.file_system.open_dx_file(&file_path) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(path = %file_path, error = %e, "repair scan could not open file");
                        continue;
                    }
                };
                for segment in
                    create_unfinished_upload_segments(&entry, &ctx, false, false, None)
                {
                    if ctx.upload_heap.push(segment) {
                        queued += 1;
                    }
                }
            }
        }
        if queued > 0 {
            debug!(queued, "repair scan queued segments");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memorymanager::MemoryPriority;
    use crate::testutil::{contract, new_file, test_env};
    use dxstor_core::{Hash256, HostId};

    #[test]
    fn test_create_segments_respects_contracts_and_subnets() {
        let env = test_env();
        let host_a = HostId([1u8; 32]); // contracted, holds sector 0
        let host_b = HostId([2u8; 32]); // holds sector 1 but contract lost
        let host_c = HostId([3u8; 32]); // contracted, same /24 as A
        let host_d = HostId([4u8; 32]); // contracted, different subnet
        env.contracts.insert(contract(host_a, [10, 0, 0, 1]));
        env.contracts.insert(contract(host_c, [10, 0, 0, 2]));
        env.contracts.insert(contract(host_d, [10, 0, 1, 1]));

        let entry = new_file(&env, "f", 128);
        let root = Hash256([9u8; 32]);
        entry.write().add_sector(0, 0, host_a, root).unwrap();
        entry.write().add_sector(0, 1, host_b, root).unwrap();

        // without the IP check, both other contracted hosts are candidates
        let segments = create_unfinished_upload_segments(&entry, &env.ctx, false, false, None);
        assert_eq!(segments.len(), 1);
        {
            let state = segments[0].state();
            // host_b is no longer contracted, so its sector does not count
            assert_eq!(state.piece_usage, vec![true, false, false, false]);
            assert_eq!(state.pieces_completed, 1);
            assert_eq!(
                state.unused_hosts,
                [host_c, host_d].into_iter().collect()
            );
        }
        assert_eq!(segments[0].health, 0);

        // with the IP check, host_c shares host_a's /24 and is excluded
        env.ctx.settings.write().enable_ip_violation = true;
        let segments = create_unfinished_upload_segments(&entry, &env.ctx, false, false, None);
        let state = segments[0].state();
        assert_eq!(state.unused_hosts, [host_d].into_iter().collect());
    }

    #[test]
    fn test_create_segments_skips_fully_redundant_and_stuck_mismatch() {
        let env = test_env();
        let hosts: Vec<HostId> = (1..=4).map(|i| HostId([i as u8; 32])).collect();
        for (i, host) in hosts.iter().enumerate() {
            env.contracts
                .insert(contract(*host, [10, 0, i as u8, 1]));
        }
        let entry = new_file(&env, "full", 256); // 2 segments
        let root = Hash256([0u8; 32]);
        // segment 0 fully redundant; segment 1 stuck
        for (i, host) in hosts.iter().enumerate() {
            entry.write().add_sector(0, i as u32, *host, root).unwrap();
        }
        entry.write().set_stuck_by_index(1, true).unwrap();

        assert!(create_unfinished_upload_segments(&entry, &env.ctx, false, false, None).is_empty());
        let stuck = create_unfinished_upload_segments(&entry, &env.ctx, true, true, None);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].index, 1);
        assert!(stuck[0].stuck_repair);
    }

    #[tokio::test]
    async fn test_cleanup_converges_and_releases_all_memory() {
        let env = test_env();
        let host = HostId([1u8; 32]);
        env.contracts.insert(contract(host, [10, 0, 0, 1]));
        let entry = new_file(&env, "m", 128);

        let segments = create_unfinished_upload_segments(&entry, &env.ctx, false, false, None);
        let segment = segments.into_iter().next().unwrap();
        assert!(env.ctx.upload_heap.push(segment.clone()));
        let popped = env.ctx.upload_heap.pop().unwrap();
        assert!(env.ctx.upload_heap.is_tracked(&popped.id));

        // mimic a repair whose logical fetch failed: the full reservation
        // was taken, the erasure share returned by the fetch path, and the
        // cleanup pass must hand back the rest
        let limit = env.ctx.memory.memory_limit();
        env.ctx
            .memory
            .request(segment.memory_needed, MemoryPriority::Low)
            .await
            .unwrap();
        let erasure_memory = segment.sector_size * segment.minimum_pieces as u64;
        {
            let mut state = segment.state();
            state.workers_remaining = 0;
            state.memory_released += erasure_memory;
        }
        env.ctx.memory.return_memory(erasure_memory);
        cleanup_upload_segment(&segment, &env.ctx);

        let state = segment.state();
        assert!(state.released);
        assert_eq!(state.memory_released, segment.memory_needed);
        drop(state);
        assert_eq!(env.ctx.memory.memory_available(), limit);
        // the repair slot is freed and the failed segment is stuck
        assert!(!env.ctx.upload_heap.is_tracked(&segment.id));
        assert!(entry.read().segment_stuck(0).unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_releases_segment_exactly_once() {
        let env = test_env();
        let host = HostId([1u8; 32]);
        env.contracts.insert(contract(host, [10, 0, 0, 1]));
        let entry = new_file(&env, "once", 128);
        let segment = create_unfinished_upload_segments(&entry, &env.ctx, false, false, None)
            .into_iter()
            .next()
            .unwrap();

        env.ctx
            .memory
            .request(segment.memory_needed, MemoryPriority::Low)
            .await
            .unwrap();
        {
            let mut state = segment.state();
            state.workers_remaining = 0;
            state.memory_released +=
                segment.sector_size * segment.minimum_pieces as u64;
        }
        env.ctx
            .memory
            .return_memory(segment.sector_size * segment.minimum_pieces as u64);

        cleanup_upload_segment(&segment, &env.ctx);
        let released_after_first = segment.state().memory_released;
        cleanup_upload_segment(&segment, &env.ctx);
        // a second pass must not double-release
        assert_eq!(segment.state().memory_released, released_after_first);
    }
}
