//! Bubble scheduling
//!
//! A "bubble" recomputes one directory's aggregated metadata and then
//! propagates to its parent, up to the root. Requests are coalesced per
//! path: a bubble queued while the same path is being processed is folded
//! into one follow-up run instead of piling up.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::dxpath::DxPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BubbleStatus {
    /// Queued or being processed.
    Active,
    /// Re-requested while active; one more run follows.
    ActivePending,
}

/// Coalescing queue of directories awaiting a metadata refresh.
pub(crate) struct BubbleScheduler {
    tx: mpsc::UnboundedSender<DxPath>,
    status: Mutex<HashMap<DxPath, BubbleStatus>>,
}

impl BubbleScheduler {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DxPath>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                status: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Request a bubble for `path`. Returns false if it was coalesced into
    /// an already queued run.
    pub(crate) fn queue(&self, path: DxPath) -> bool {
        let mut status = self.status.lock();
        match status.get(&path) {
            None => {
                status.insert(path.clone(), BubbleStatus::Active);
                drop(status);
                let _ = self.tx.send(path);
                true
            }
            Some(BubbleStatus::Active) => {
                status.insert(path, BubbleStatus::ActivePending);
                false
            }
            Some(BubbleStatus::ActivePending) => false,
        }
    }

    /// Mark one run of `path` done. Returns true if a coalesced follow-up
    /// run was requeued.
    pub(crate) fn complete(&self, path: &DxPath) -> bool {
        let mut status = self.status.lock();
        match status.get(path) {
            Some(BubbleStatus::ActivePending) => {
                status.insert(path.clone(), BubbleStatus::Active);
                drop(status);
                let _ = self.tx.send(path.clone());
                true
            }
            _ => {
                status.remove(path);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_coalesces() {
        let (scheduler, mut rx) = BubbleScheduler::new();
        let path = DxPath::new("a").unwrap();

        assert!(scheduler.queue(path.clone()));
        assert!(!scheduler.queue(path.clone()));
        assert!(!scheduler.queue(path.clone()));

        // one queued delivery
        assert_eq!(rx.try_recv().unwrap(), path);
        assert!(rx.try_recv().is_err());

        // completion requeues the coalesced follow-up exactly once
        assert!(scheduler.complete(&path));
        assert_eq!(rx.try_recv().unwrap(), path);
        assert!(!scheduler.complete(&path));
        assert!(rx.try_recv().is_err());
    }
}
