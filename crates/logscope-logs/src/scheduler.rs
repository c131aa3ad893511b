use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tracing::trace;

use crate::buffer::IngestionBuffer;
use crate::store::OrderedLogStore;

/// Quiet period after the last record before a flush
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(1000);

/// Trailing-edge debounce between the ingestion buffer and the store.
///
/// Every `schedule` pushes the deadline one quiescence window out, so a burst
/// becomes a single store mutation once the source goes quiet.
#[derive(Debug)]
pub struct FlushScheduler {
    window: Duration,
    deadline: Option<Instant>,
    cancelled: bool,
}

impl FlushScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            cancelled: false,
        }
    }

    /// Arm (or re-arm) the trailing deadline. No-op after `cancel`.
    pub fn schedule(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.deadline = Some(Instant::now() + self.window);
        true
    }

    /// Drop any pending deadline without flushing. Only the first call returns true.
    pub fn cancel(&mut self) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.deadline = None;
        true
    }

    /// Resolve once the deadline passes; pend forever while disarmed.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Move everything staged into the store. Returns the number of records merged.
    ///
    /// An empty buffer leaves the store untouched.
    pub fn flush(&mut self, buffer: &IngestionBuffer, store: &OrderedLogStore) -> usize {
        self.deadline = None;
        if self.cancelled {
            return 0;
        }
        let batch = buffer.drain();
        if batch.is_empty() {
            return 0;
        }
        let merged = store.merge(batch);
        trace!(merged, "flushed ingestion buffer");
        merged
    }
}

impl Default for FlushScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_QUIESCENCE)
    }
}
