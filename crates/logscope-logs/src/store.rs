use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;

use logscope_types::{LogLevel, LogRecord};

/// Time-ordered log records for one view.
///
/// Canonical order is `(logical_time, sequence)`. Clones share the same
/// records; readers get `Arc`s so rendering never copies message text.
#[derive(Clone)]
pub struct OrderedLogStore {
    entries: Arc<RwLock<Vec<Arc<LogRecord>>>>,

    /// Bumped once per mutation; receivers re-render on change
    revision: Arc<watch::Sender<u64>>,
}

impl OrderedLogStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            revision: Arc::new(revision),
        }
    }

    /// Merge a batch into the canonical order. Returns the number of records added.
    ///
    /// The batch is sorted, then merged with the existing sequence; the result
    /// equals a stable sort of `existing ++ batch`.
    pub fn merge(&self, records: Vec<LogRecord>) -> usize {
        if records.is_empty() {
            return 0;
        }

        let mut incoming: Vec<Arc<LogRecord>> = records.into_iter().map(Arc::new).collect();
        incoming.sort_by(|a, b| a.canonical_cmp(b));
        let added = incoming.len();

        {
            let mut entries = self.entries.write();
            let appends_cleanly = match (entries.last(), incoming.first()) {
                (Some(last), Some(first)) => last.canonical_cmp(first) != Ordering::Greater,
                _ => true,
            };

            if appends_cleanly {
                entries.extend(incoming);
            } else {
                let existing = std::mem::take(&mut *entries);
                *entries = merge_sorted(existing, incoming);
            }
        }

        self.revision.send_modify(|rev| *rev += 1);
        added
    }

    /// All records in canonical order
    pub fn snapshot(&self) -> Vec<Arc<LogRecord>> {
        self.entries.read().clone()
    }

    /// Lazily filter a snapshot; the store itself is untouched
    pub fn filter<F>(&self, predicate: F) -> impl Iterator<Item = Arc<LogRecord>>
    where
        F: Fn(&LogRecord) -> bool,
    {
        self.snapshot()
            .into_iter()
            .filter(move |r| predicate(r.as_ref()))
    }

    /// Get records in a range (for virtual scrolling)
    pub fn range(&self, start: usize, count: usize) -> Vec<Arc<LogRecord>> {
        let entries = self.entries.read();
        entries.iter().skip(start).take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Newest logical time held, used as the reconnect point
    pub fn last_logical_time(&self) -> Option<DateTime<Utc>> {
        // Untimed records sort first, so the last record carries the maximum
        self.entries.read().last().and_then(|r| r.logical_time)
    }

    /// Current revision; changes once per mutation
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Watch for store mutations
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Get record count per log level
    pub fn level_counts(&self) -> LevelCounts {
        let entries = self.entries.read();
        let mut counts = LevelCounts::default();

        for entry in entries.iter() {
            match entry.level {
                LogLevel::Trace => counts.trace += 1,
                LogLevel::Debug => counts.debug += 1,
                LogLevel::Info => counts.info += 1,
                LogLevel::Warn => counts.warn += 1,
                LogLevel::Error => counts.error += 1,
                LogLevel::Fatal => counts.fatal += 1,
                LogLevel::Unknown => counts.unknown += 1,
            }
        }

        counts
    }

    /// Export all records as raw lines
    pub fn export_raw(&self) -> String {
        self.entries
            .read()
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Remove every record (explicit consumer action)
    pub fn clear(&self) {
        let had_entries = {
            let mut entries = self.entries.write();
            let had = !entries.is_empty();
            entries.clear();
            had
        };
        if had_entries {
            self.revision.send_modify(|rev| *rev += 1);
        }
    }
}

impl Default for OrderedLogStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable two-way merge; on equal keys the existing record goes first
fn merge_sorted(
    existing: Vec<Arc<LogRecord>>,
    incoming: Vec<Arc<LogRecord>>,
) -> Vec<Arc<LogRecord>> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut left = existing.into_iter().peekable();
    let mut right = incoming.into_iter().peekable();

    loop {
        let take_incoming = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => r.canonical_cmp(l) == Ordering::Less,
            _ => break,
        };
        if take_incoming {
            merged.extend(right.next());
        } else {
            merged.extend(left.next());
        }
    }
    merged.extend(left);
    merged.extend(right);
    merged
}

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub trace: usize,
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub fatal: usize,
    pub unknown: usize,
}

impl LevelCounts {
    pub fn total(&self) -> usize {
        self.trace + self.debug + self.info + self.warn + self.error + self.fatal + self.unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use logscope_types::SubscriptionKey;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
            + chrono::Duration::seconds(secs as i64)
    }

    fn record(sequence: u64, time: Option<DateTime<Utc>>) -> LogRecord {
        let key = SubscriptionKey::new("c", "ns", "pod", "main");
        LogRecord::new(sequence, &key, format!("line {}", sequence)).with_time(time)
    }

    fn assert_canonical(store: &OrderedLogStore) {
        let snapshot = store.snapshot();
        for pair in snapshot.windows(2) {
            assert_ne!(
                pair[0].canonical_cmp(&pair[1]),
                Ordering::Greater,
                "out of order: {:?} before {:?}",
                (pair[0].logical_time, pair[0].sequence),
                (pair[1].logical_time, pair[1].sequence)
            );
        }
    }

    #[test]
    fn test_merge_orders_out_of_order_batch() {
        let store = OrderedLogStore::new();
        store.merge(vec![
            record(1, Some(at(2))),
            record(2, Some(at(1))),
            record(3, Some(at(3))),
        ]);
        let texts: Vec<u64> = store.snapshot().iter().map(|r| r.sequence).collect();
        assert_eq!(texts, vec![2, 1, 3]);
    }

    #[test]
    fn test_merge_interleaves_late_records() {
        let store = OrderedLogStore::new();
        store.merge(vec![record(1, Some(at(1))), record(2, Some(at(5)))]);
        store.merge(vec![record(3, Some(at(3))), record(4, Some(at(6)))]);
        let seqs: Vec<u64> = store.snapshot().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 3, 2, 4]);
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_randomized_arrivals_stay_canonical() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let store = OrderedLogStore::new();
            let count = rng.random_range(1..200u64);
            let mut records: Vec<LogRecord> = (1..=count)
                .map(|seq| {
                    // Few distinct timestamps so duplicates are common
                    let time = if rng.random_bool(0.1) {
                        None
                    } else {
                        Some(at(rng.random_range(0..20)))
                    };
                    record(seq, time)
                })
                .collect();
            records.shuffle(&mut rng);

            while !records.is_empty() {
                let take = rng.random_range(1..=records.len());
                let batch: Vec<LogRecord> = records.drain(..take).collect();
                store.merge(batch);
                assert_canonical(&store);
            }
            assert_eq!(store.len() as u64, count);
        }
    }

    #[test]
    fn test_merge_matches_full_stable_sort() {
        let mut rng = StdRng::seed_from_u64(42);
        let store = OrderedLogStore::new();
        let mut all = Vec::new();

        for batch_no in 0..10u64 {
            let batch: Vec<LogRecord> = (0..20)
                .map(|i| record(batch_no * 20 + i + 1, Some(at(rng.random_range(0..10)))))
                .collect();
            all.extend(batch.clone());
            store.merge(batch);
        }

        all.sort_by(|a, b| a.canonical_cmp(b));
        let expected: Vec<u64> = all.iter().map(|r| r.sequence).collect();
        let actual: Vec<u64> = store.snapshot().iter().map(|r| r.sequence).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_filter_does_not_mutate() {
        let store = OrderedLogStore::new();
        store.merge(vec![record(1, Some(at(1))), record(2, Some(at(2)))]);
        let before = store.revision();

        let odd: Vec<_> = store.filter(|r| r.sequence % 2 == 1).collect();
        assert_eq!(odd.len(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.revision(), before);
    }

    #[test]
    fn test_empty_merge_does_not_notify() {
        let store = OrderedLogStore::new();
        assert_eq!(store.merge(Vec::new()), 0);
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let store = OrderedLogStore::new();
        let mut rx = store.subscribe();
        store.merge(vec![record(1, None)]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_last_logical_time_and_range() {
        let store = OrderedLogStore::new();
        store.merge(vec![
            record(1, None),
            record(2, Some(at(9))),
            record(3, Some(at(4))),
        ]);
        assert_eq!(store.last_logical_time(), Some(at(9)));
        let window: Vec<u64> = store.range(1, 5).iter().map(|r| r.sequence).collect();
        assert_eq!(window, vec![3, 2]);
    }

    #[test]
    fn test_clear_and_export() {
        let store = OrderedLogStore::new();
        store.merge(vec![record(1, Some(at(1))), record(2, Some(at(2)))]);
        assert_eq!(store.export_raw(), "line 1\nline 2");
        assert_eq!(store.level_counts().total(), 2);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.revision(), 2);
    }
}
