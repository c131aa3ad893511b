use std::sync::Arc;

use parking_lot::Mutex;

use logscope_types::LogRecord;

#[derive(Default)]
struct Staging {
    pending: Vec<LogRecord>,
    closed: bool,
}

/// Staging area for records that arrived since the last flush.
///
/// Records stay in arrival order; ordering is the store's job. `drain` swaps
/// the pending list out under the same lock `push` takes, so a concurrent push
/// lands wholly in this drain or wholly in the next one.
#[derive(Clone, Default)]
pub struct IngestionBuffer {
    staging: Arc<Mutex<Staging>>,
}

impl IngestionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a record. Returns false once the buffer is closed.
    pub fn push(&self, record: LogRecord) -> bool {
        let mut staging = self.staging.lock();
        if staging.closed {
            return false;
        }
        staging.pending.push(record);
        true
    }

    /// Take every staged record and leave the buffer empty
    pub fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut self.staging.lock().pending)
    }

    /// Reject all further pushes and discard anything still staged
    pub fn close(&self) {
        let mut staging = self.staging.lock();
        staging.closed = true;
        staging.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.staging.lock().pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logscope_types::SubscriptionKey;
    use std::collections::HashSet;
    use std::thread;

    fn record(sequence: u64) -> LogRecord {
        let key = SubscriptionKey::new("c", "ns", "pod", "main");
        LogRecord::new(sequence, &key, format!("line {}", sequence))
    }

    #[test]
    fn test_drain_keeps_arrival_order() {
        let buffer = IngestionBuffer::new();
        for seq in [3, 1, 2] {
            buffer.push(record(seq));
        }
        let drained: Vec<u64> = buffer.drain().iter().map(|r| r.sequence).collect();
        assert_eq!(drained, vec![3, 1, 2]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_closed_buffer_rejects_pushes() {
        let buffer = IngestionBuffer::new();
        buffer.push(record(1));
        buffer.close();
        assert!(!buffer.push(record(2)));
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_concurrent_push_and_drain_lose_nothing() {
        const WRITERS: u64 = 4;
        const PER_WRITER: u64 = 2_500;

        let buffer = IngestionBuffer::new();
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        assert!(buffer.push(record(w * PER_WRITER + i)));
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            seen.extend(buffer.drain());
        }
        for writer in writers {
            writer.join().unwrap();
        }
        seen.extend(buffer.drain());

        let unique: HashSet<u64> = seen.iter().map(|r| r.sequence).collect();
        assert_eq!(seen.len() as u64, WRITERS * PER_WRITER);
        assert_eq!(unique.len(), seen.len());
    }
}
