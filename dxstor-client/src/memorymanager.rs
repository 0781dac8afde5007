//! Memory manager
//!
//! A process-wide bounded semaphore over bytes. Every heavy buffer in the
//! engine (logical segment data, physical sectors, download buffers) is
//! admitted here before allocation, which bounds the client's working set
//! no matter how many segments are in flight.
//!
//! Two priority tiers: high-priority requests jump ahead of every pending
//! low-priority waiter; within a tier admission is FIFO. A request larger
//! than the whole limit is granted immediately and the deficit recorded as
//! *underflow*, so oversized work can always make progress; subsequent
//! returns pay the underflow down before replenishing availability.

use dxstor_core::{DxError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Priority tier of a memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPriority {
    Low,
    High,
}

struct Waiter {
    amount: u64,
    tx: oneshot::Sender<()>,
}

struct State {
    available: u64,
    limit: u64,
    underflow: u64,
    high: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
}

impl State {
    /// Try to satisfy one request right now. Oversized requests are granted
    /// with the shortfall recorded as underflow.
    fn try_take(&mut self, amount: u64) -> bool {
        if self.available >= amount {
            self.available -= amount;
            return true;
        }
        if amount > self.limit {
            self.underflow += amount - self.available;
            self.available = 0;
            return true;
        }
        false
    }

    /// Wake every waiter that can now be admitted, high tier first, FIFO
    /// within each tier.
    fn wake_waiters(&mut self) {
        loop {
            let from_high = !self.high.is_empty();
            let Some(waiter) = (if from_high { &mut self.high } else { &mut self.low }).pop_front() else { return };
            if !self.try_take(waiter.amount) {
                if from_high { &mut self.high } else { &mut self.low }.push_front(waiter);
                return;
            }
            let amount = waiter.amount;
            if waiter.tx.send(()).is_err() {
                // receiver gave up (cancelled); hand the bytes back
                self.give_back(amount);
            }
        }
    }

    fn give_back(&mut self, amount: u64) {
        let absorbed = amount.min(self.underflow);
        self.underflow -= absorbed;
        self.available += amount - absorbed;
        if self.available > self.limit {
            warn!(
                available = self.available,
                limit = self.limit,
                "memory return exceeded limit; clamping"
            );
            self.available = self.limit;
        }
    }
}

/// Bounded admission of byte-sized memory reservations.
pub struct MemoryManager {
    state: Mutex<State>,
    stop: watch::Receiver<bool>,
}

impl MemoryManager {
    /// Create a manager with `limit` bytes. `stop` unblocks all pending
    /// requests with a failure when it flips to true.
    pub fn new(limit: u64, stop: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                available: limit,
                limit,
                underflow: 0,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
            stop,
        })
    }

    /// Reserve `amount` bytes, suspending until they are granted. Returns
    /// `DxError::Shutdown` if the stop signal fires first.
    pub async fn request(&self, amount: u64, priority: MemoryPriority) -> Result<()> {
        if *self.stop.borrow() {
            return Err(DxError::Shutdown);
        }
        let rx = {
            let mut state = self.state.lock();
            // only jump the queue if nobody of our tier (or higher) waits
            let queue_clear = match priority {
                MemoryPriority::High => state.high.is_empty(),
                MemoryPriority::Low => state.high.is_empty() && state.low.is_empty(),
            };
            if queue_clear && state.try_take(amount) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { amount, tx };
            match priority {
                MemoryPriority::High => state.high.push_back(waiter),
                MemoryPriority::Low => state.low.push_back(waiter),
            }
            rx
        };

        let mut stop = self.stop.clone();
        tokio::select! {
            granted = rx => match granted {
                Ok(()) => Ok(()),
                Err(_) => Err(DxError::MemoryUnavailable(amount)),
            },
            _ = stop.wait_for(|stopped| *stopped) => Err(DxError::Shutdown),
        }
    }

    /// Release `amount` previously reserved bytes. Never blocks.
    pub fn return_memory(&self, amount: u64) {
        let mut state = self.state.lock();
        state.give_back(amount);
        state.wake_waiters();
    }

    /// Resize the budget live. Expanding absorbs underflow first, then
    /// wakes waiters; shrinking records any deficit as underflow.
    pub fn set_memory_limit(&self, new_limit: u64) {
        let mut state = self.state.lock();
        let old_limit = state.limit;
        state.limit = new_limit;
        if new_limit >= old_limit {
            let mut slack = new_limit - old_limit;
            let absorbed = slack.min(state.underflow);
            state.underflow -= absorbed;
            slack -= absorbed;
            state.available += slack;
            state.wake_waiters();
        } else {
            let deficit = old_limit - new_limit;
            let covered = deficit.min(state.available);
            state.available -= covered;
            state.underflow += deficit - covered;
        }
        debug!(
            limit = new_limit,
            available = state.available,
            underflow = state.underflow,
            "memory limit resized"
        );
    }

    pub fn memory_available(&self) -> u64 {
        self.state.lock().available
    }

    pub fn memory_limit(&self) -> u64 {
        self.state.lock().limit
    }

    pub fn underflow(&self) -> u64 {
        self.state.lock().underflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(limit: u64) -> (Arc<MemoryManager>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (MemoryManager::new(limit, rx), tx)
    }

    #[tokio::test]
    async fn test_request_and_return() {
        let (mm, _stop) = manager(1000);
        mm.request(400, MemoryPriority::Low).await.unwrap();
        assert_eq!(mm.memory_available(), 600);
        mm.return_memory(400);
        assert_eq!(mm.memory_available(), 1000);
    }

    #[tokio::test]
    async fn test_oversized_request_underflows() {
        let (mm, _stop) = manager(100_000);
        mm.request(150_000, MemoryPriority::High).await.unwrap();
        assert_eq!(mm.underflow(), 50_000);
        assert_eq!(mm.memory_available(), 0);
    }

    #[tokio::test]
    async fn test_set_memory_limit_expand() {
        // limit 100000; an oversized high request leaves underflow 50000;
        // a low waiter for 5000 resumes once the limit grows to 156000.
        let (mm, _stop) = manager(100_000);
        mm.request(150_000, MemoryPriority::High).await.unwrap();
        assert_eq!(mm.underflow(), 50_000);

        let mm2 = mm.clone();
        let waiter = tokio::spawn(async move { mm2.request(5_000, MemoryPriority::Low).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        mm.set_memory_limit(156_000);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should resume")
            .unwrap()
            .unwrap();
        assert_eq!(mm.memory_limit(), 156_000);
        assert_eq!(mm.underflow(), 0);
        assert_eq!(mm.memory_available(), 1_000);
    }

    #[tokio::test]
    async fn test_set_memory_limit_shrink() {
        let (mm, _stop) = manager(10_000);
        mm.request(15_000, MemoryPriority::High).await.unwrap();
        mm.set_memory_limit(5_000);
        assert_eq!(mm.underflow(), 10_000);
        assert_eq!(mm.memory_limit(), 5_000);

        mm.return_memory(15_000);
        assert_eq!(mm.underflow(), 0);
        assert_eq!(mm.memory_available(), 5_000);
    }

    #[tokio::test]
    async fn test_high_priority_jumps_low() {
        let (mm, _stop) = manager(100);
        mm.request(100, MemoryPriority::Low).await.unwrap();

        let mm_low = mm.clone();
        let low = tokio::spawn(async move { mm_low.request(60, MemoryPriority::Low).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mm_high = mm.clone();
        let high = tokio::spawn(async move { mm_high.request(60, MemoryPriority::High).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 60 bytes free: the high waiter wins although it arrived second
        mm.return_memory(60);
        tokio::time::timeout(Duration::from_secs(1), high)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!low.is_finished());

        mm.return_memory(40);
        tokio::time::timeout(Duration::from_secs(1), low)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_within_tier() {
        let (mm, _stop) = manager(100);
        mm.request(100, MemoryPriority::Low).await.unwrap();

        let mm1 = mm.clone();
        let first = tokio::spawn(async move {
            mm1.request(80, MemoryPriority::Low).await.unwrap();
            1
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mm2 = mm.clone();
        let second = tokio::spawn(async move {
            mm2.request(10, MemoryPriority::Low).await.unwrap();
            2
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 20 bytes free satisfies the second waiter but FIFO holds it
        // behind the first
        mm.return_memory(20);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        mm.return_memory(80);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), first)
                .await
                .unwrap()
                .unwrap(),
            1
        );
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), second)
                .await
                .unwrap()
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_stop_unblocks_waiters() {
        let (mm, stop) = manager(100);
        mm.request(100, MemoryPriority::Low).await.unwrap();

        let mm2 = mm.clone();
        let waiter = tokio::spawn(async move { mm2.request(50, MemoryPriority::Low).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        stop.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(DxError::Shutdown)));
    }
}
