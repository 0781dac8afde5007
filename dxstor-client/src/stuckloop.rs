//! Stuck loop
//!
//! Stuck segments are retried in the background: on a timer, and again
//! every time a stuck repair succeeds, since whatever fixed one segment
//! probably fixes the next. Each round
//! samples one stuck segment uniformly at random from the worst stuck
//! directory and queues it with `stuck_repair` set.

use dxstor_filesystem::DxPath;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::randselect::random_select_one;
use crate::repair::create_unfinished_upload_segments;
use crate::StorageClient;

pub(crate) async fn stuck_loop(client: Arc<StorageClient>, mut success_rx: mpsc::Receiver<DxPath>) {
    let ctx = client.context().clone();
    let mut shutdown = ctx.shutdown.clone();
    info!("stuck loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(client.config().stuck_interval) => {}
            signal = success_rx.recv() => {
                match signal {
                    Some(path) => debug!(path = %path, "stuck repair success signal"),
                    None => return,
                }
            }
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("stuck loop shutting down");
                return;
            }
        }

        client.refresh_hosts_and_workers();
        if client.worker_pool().is_empty() {
            continue;
        }

        let worst = match ctx.file_system.worst_stuck_directory() {
            Ok(Some((dir, _))) => dir,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "stuck loop could not scan directories");
                continue;
            }
        };

        // gather (file, segment) pairs of every stuck segment in the dir
        let files = match ctx.file_system.file_paths_in_dir(&worst) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %worst, error = %e, "stuck loop could not list files");
                continue;
            }
        };
        let mut stuck_segments = Vec::new();
        for file_path in files {
            let Ok(entry) = ctx.file_system.open_dx_file(&file_path) else {
                continue;
            };
            let file = entry.read();
            for index in 0..file.num_segments() {
                if file.segment_stuck(index).unwrap_or(false) {
                    stuck_segments.push((file_path.clone(), index));
                }
            }
        }
        let Some((file_path, index)) =
            random_select_one(stuck_segments, &mut rand::thread_rng())
        else {
            continue;
        };

        let entry = match ctx.file_system.open_dx_file(&file_path) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %file_path, error = %e, "stuck loop could not open file");
                continue;
            }
        };
        for segment in create_unfinished_upload_segments(&entry, &ctx, true, true, Some(index)) {
            let id = segment.id;
            if ctx.upload_heap.push(segment) {
                info!(id = ?id, path = %file_path, "queued stuck segment for repair");
            }
        }
    }
}
