//! Health check loop
//!
//! Periodically refreshes directory aggregates so the repair loops see
//! current numbers. Each round picks the directory whose health was
//! checked longest ago and bubbles it (and its ancestors) synchronously.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::StorageClient;

pub(crate) async fn health_check_loop(client: Arc<StorageClient>) {
    let ctx = client.context().clone();
    let mut shutdown = ctx.shutdown.clone();
    info!("health check loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(client.config().health_check_interval) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!("health check loop shutting down");
                return;
            }
        }

        let stalest = match ctx.file_system.all_dirs() {
            Ok(dirs) => dirs
                .into_iter()
                .min_by_key(|(_, metadata)| metadata.time_last_health_check),
            Err(e) => {
                warn!(error = %e, "health check could not walk directories");
                continue;
            }
        };
        let Some((path, metadata)) = stalest else { continue };
        debug!(
            path = %path,
            last_check = metadata.time_last_health_check,
            "refreshing directory health"
        );
        if let Err(e) = ctx.file_system.bubble_blocking(&path) {
            warn!(path = %path, error = %e, "health refresh failed");
        }
    }
}
