use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use logscope_types::{
    Credential, LogRecord, StreamError, StreamEvent, StreamState, SubscriptionKey,
};

use crate::adapter::{LogStreamAdapter, SequenceGenerator};
use crate::buffer::IngestionBuffer;
use crate::parser::LogParser;
use crate::scheduler::{DEFAULT_QUIESCENCE, FlushScheduler};
use crate::source::{LogSource, StreamOptions};
use crate::store::OrderedLogStore;

/// Bounded exponential backoff for reconnects
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Reconnect attempts before giving up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or None once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Controller settings
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Quiet period before buffered records are flushed
    pub quiescence: Duration,
    pub retry: RetryPolicy,
    pub options: StreamOptions,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            quiescence: DEFAULT_QUIESCENCE,
            retry: RetryPolicy::default(),
            options: StreamOptions::default(),
        }
    }
}

/// Notifications for the UI layer
#[derive(Clone, Debug, PartialEq)]
pub enum StreamNotice {
    StateChanged {
        key: Option<SubscriptionKey>,
        state: StreamState,
    },
    Error {
        key: SubscriptionKey,
        error: StreamError,
    },
    Reconnecting {
        key: SubscriptionKey,
        attempt: u32,
        delay: Duration,
    },
    /// Retry budget exhausted; the stream stays down
    GaveUp {
        key: SubscriptionKey,
        attempts: u32,
    },
    HistoryLoaded {
        key: SubscriptionKey,
        records: usize,
        malformed: usize,
    },
}

/// What the log view should show
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    Idle,
    Connecting,
    /// Healthy stream, nothing received yet
    Waiting,
    Live,
    /// One-shot history shown, no live stream
    Loaded,
    Reconnecting { attempt: u32 },
    StreamFailed(String),
    HistoryFailed(String),
}

impl ViewStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::StreamFailed(_) | Self::HistoryFailed(_))
    }
}

/// What a single `step` did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Connected,
    Buffered,
    /// A malformed frame was reported and skipped
    Skipped,
    Disconnected,
    Flushed(usize),
    Reconnecting(u32),
    HistoryMerged(usize),
    HistoryFailed,
    /// Result for a subscription that no longer exists
    Stale,
}

struct HistoryResult {
    generation: u64,
    key: SubscriptionKey,
    result: Result<String, StreamError>,
}

/// Components owned by one live subscription
struct ActiveStream {
    key: SubscriptionKey,
    adapter: Option<LogStreamAdapter>,
    buffer: IngestionBuffer,
    scheduler: FlushScheduler,
    /// Consecutive reconnects without a record in between
    attempts: u32,
    retry_at: Option<Instant>,
}

impl ActiveStream {
    fn new(key: SubscriptionKey, quiescence: Duration) -> Self {
        Self {
            key,
            adapter: None,
            buffer: IngestionBuffer::new(),
            scheduler: FlushScheduler::new(quiescence),
            attempts: 0,
            retry_at: None,
        }
    }

    /// Connected, connecting or waiting to reconnect
    fn is_running(&self) -> bool {
        self.retry_at.is_some() || self.adapter.as_ref().is_some_and(LogStreamAdapter::is_live)
    }
}

enum Wake {
    Event(StreamEvent),
    FlushDue,
    RetryDue,
    History(HistoryResult),
}

/// Supervises the adapter, buffer and flush scheduler of one log view.
///
/// The owner polls `step` from its event loop; every state change happens
/// synchronously inside `step` or the subscription calls, so once
/// `unsubscribe` (or a key change) returns nothing from the old stream can
/// reach the store.
pub struct StreamController {
    source: Arc<dyn LogSource>,
    credential: Option<Credential>,
    config: StreamConfig,
    store: OrderedLogStore,
    sequence: SequenceGenerator,
    state: StreamState,
    current: Option<SubscriptionKey>,
    active: Option<ActiveStream>,

    /// Bumped on every teardown; history results from older generations are dropped
    generation: u64,
    last_error: Option<StreamError>,
    history_error: Option<StreamError>,
    history_loaded: bool,
    /// Newest timestamp stored for the current key; survives `store.clear()`
    resume_point: Option<DateTime<Utc>>,
    history_cancel: CancellationToken,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    history_rx: mpsc::UnboundedReceiver<HistoryResult>,
    notices: mpsc::UnboundedSender<StreamNotice>,
}

impl StreamController {
    pub fn new(
        source: Arc<dyn LogSource>,
        credential: Option<Credential>,
        store: OrderedLogStore,
        config: StreamConfig,
    ) -> (Self, mpsc::UnboundedReceiver<StreamNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();

        let controller = Self {
            source,
            credential,
            config,
            store,
            sequence: SequenceGenerator::new(),
            state: StreamState::Idle,
            current: None,
            active: None,
            generation: 0,
            last_error: None,
            history_error: None,
            history_loaded: false,
            resume_point: None,
            history_cancel: CancellationToken::new(),
            history_tx,
            history_rx,
            notices,
        };
        (controller, notice_rx)
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn key(&self) -> Option<&SubscriptionKey> {
        self.current.as_ref()
    }

    pub fn store(&self) -> &OrderedLogStore {
        &self.store
    }

    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    /// Tail `key`. A different key first tears the current stream down completely.
    pub fn subscribe(&mut self, key: SubscriptionKey) -> Result<(), StreamError> {
        if !key.is_complete() {
            self.unsubscribe();
            self.set_state(StreamState::Idle);
            return Ok(());
        }

        if self.current.as_ref() == Some(&key) {
            if self.active.as_ref().is_some_and(ActiveStream::is_running) {
                return Ok(());
            }
            // Same target after a failure: restart, keep what is stored
            self.release_active();
        } else {
            self.switch_to(key.clone());
        }

        let Some(credential) = self.credential.clone() else {
            let err = StreamError::Unauthorized("no bearer credential configured".to_string());
            self.fail(err.clone());
            return Err(err);
        };

        info!(key = %key, "subscribing to log stream");
        self.active = Some(ActiveStream::new(key, self.config.quiescence));
        self.start_adapter(&credential)
    }

    /// Stop tailing. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.current.take().is_some() {
            info!("unsubscribing from log stream");
        }
        self.teardown();
        self.set_state(StreamState::Stopped);
    }

    /// Manually restart a failed stream with a fresh retry budget
    pub fn reconnect(&mut self) -> Result<(), StreamError> {
        let Some(key) = self.current.clone() else {
            return Ok(());
        };
        self.release_active();
        self.subscribe(key)
    }

    /// Fetch one-shot history for `key` and merge it into the store
    pub fn load_history(&mut self, key: SubscriptionKey) -> Result<(), StreamError> {
        if !key.is_complete() {
            return Ok(());
        }
        if self.current.as_ref() != Some(&key) {
            self.switch_to(key.clone());
        }

        let Some(credential) = self.credential.clone() else {
            let err = StreamError::Unauthorized("no bearer credential configured".to_string());
            self.history_error = Some(err.clone());
            self.notify(StreamNotice::Error {
                key,
                error: err.clone(),
            });
            return Err(err);
        };

        self.history_error = None;
        let generation = self.generation;
        let cancel = self.history_cancel.clone();
        let tx = self.history_tx.clone();
        let fetch = self
            .source
            .fetch_history(&key, &credential, &self.config.options);

        debug!(key = %key, "fetching log history");
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = fetch => {
                    let _ = tx.send(HistoryResult { generation, key, result });
                }
            }
        });
        Ok(())
    }

    /// Wait for the next adapter event, flush deadline, retry deadline or
    /// history result, then apply it.
    ///
    /// Cancel safe; it only suspends before anything is applied.
    pub async fn step(&mut self) -> Progress {
        let wake = match self.active.as_mut() {
            Some(active) => {
                let ActiveStream {
                    adapter,
                    scheduler,
                    retry_at,
                    ..
                } = active;
                tokio::select! {
                    biased;
                    _ = scheduler.fired() => Wake::FlushDue,
                    _ = wait_until(*retry_at) => Wake::RetryDue,
                    Some(result) = self.history_rx.recv() => Wake::History(result),
                    event = next_event(adapter) => Wake::Event(event),
                }
            }
            None => match self.history_rx.recv().await {
                Some(result) => Wake::History(result),
                None => std::future::pending().await,
            },
        };

        match wake {
            Wake::Event(event) => self.handle_event(event),
            Wake::FlushDue => self.flush(),
            Wake::RetryDue => self.retry(),
            Wake::History(result) => self.merge_history(result),
        }
    }

    /// What the view should display right now
    pub fn status(&self) -> ViewStatus {
        if let Some(err) = &self.history_error {
            return ViewStatus::HistoryFailed(err.to_string());
        }

        let attempts = self.active.as_ref().map_or(0, |a| a.attempts);
        let retrying = self.active.as_ref().is_some_and(|a| a.retry_at.is_some());

        match self.state {
            StreamState::Idle | StreamState::Stopped if self.history_loaded => ViewStatus::Loaded,
            StreamState::Idle | StreamState::Stopped => ViewStatus::Idle,
            StreamState::Connecting if attempts > 0 => ViewStatus::Reconnecting { attempt: attempts },
            StreamState::Connecting => ViewStatus::Connecting,
            StreamState::Streaming => {
                let nothing_yet = self.store.is_empty()
                    && self.active.as_ref().is_none_or(|a| a.buffer.is_empty());
                if nothing_yet {
                    ViewStatus::Waiting
                } else {
                    ViewStatus::Live
                }
            }
            StreamState::Errored if retrying => ViewStatus::Reconnecting { attempt: attempts },
            StreamState::Errored => ViewStatus::StreamFailed(
                self.last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "log stream failed".to_string()),
            ),
        }
    }

    fn handle_event(&mut self, event: StreamEvent) -> Progress {
        let Some(active) = self.active.as_mut() else {
            return Progress::Stale;
        };

        match event {
            StreamEvent::Ready => {
                self.last_error = None;
                self.set_state(StreamState::Streaming);
                Progress::Connected
            }
            StreamEvent::Record(record) => {
                active.attempts = 0;
                if active.buffer.push(record) {
                    active.scheduler.schedule();
                }
                Progress::Buffered
            }
            StreamEvent::Error(error @ StreamError::MalformedFrame { .. }) => {
                let key = active.key.clone();
                self.notify(StreamNotice::Error { key, error });
                Progress::Skipped
            }
            StreamEvent::Error(error) if error.is_retryable() => self.disconnected(error),
            StreamEvent::Closed => self.disconnected(StreamError::ConnectionLost(
                "log stream closed by server".to_string(),
            )),
            StreamEvent::Error(error) => self.fail(error),
        }
    }

    fn flush(&mut self) -> Progress {
        let Some(active) = self.active.as_mut() else {
            return Progress::Stale;
        };
        let flushed = active.scheduler.flush(&active.buffer, &self.store);
        self.resume_point = self.resume_point.max(self.store.last_logical_time());
        Progress::Flushed(flushed)
    }

    /// Transport dropped: keep what arrived and schedule a bounded retry
    fn disconnected(&mut self, error: StreamError) -> Progress {
        let Some(active) = self.active.as_mut() else {
            return Progress::Stale;
        };

        if let Some(adapter) = active.adapter.as_mut() {
            adapter.stop();
        }
        active.scheduler.flush(&active.buffer, &self.store);
        self.resume_point = self.resume_point.max(self.store.last_logical_time());

        active.attempts += 1;
        let attempt = active.attempts;
        let key = active.key.clone();
        let delay = self.config.retry.delay_for(attempt);
        active.retry_at = delay.map(|d| Instant::now() + d);

        warn!(key = %key, error = %error, attempt, "log stream disconnected");
        self.last_error = Some(error.clone());
        self.set_state(StreamState::Errored);
        self.notify(StreamNotice::Error {
            key: key.clone(),
            error,
        });

        match delay {
            Some(delay) => self.notify(StreamNotice::Reconnecting {
                key,
                attempt,
                delay,
            }),
            None => {
                error!(key = %key, "giving up on log stream");
                self.notify(StreamNotice::GaveUp {
                    key,
                    attempts: attempt - 1,
                });
            }
        }
        Progress::Disconnected
    }

    /// Terminal failure for the subscription; no retry
    fn fail(&mut self, error: StreamError) -> Progress {
        if let Some(active) = self.active.as_mut() {
            if let Some(adapter) = active.adapter.as_mut() {
                adapter.stop();
            }
            active.scheduler.flush(&active.buffer, &self.store);
            active.retry_at = None;
        }
        self.resume_point = self.resume_point.max(self.store.last_logical_time());

        let key = self.current.clone().unwrap_or_default();
        warn!(key = %key, error = %error, "log stream failed");
        self.last_error = Some(error.clone());
        self.set_state(StreamState::Errored);
        self.notify(StreamNotice::Error { key, error });
        Progress::Disconnected
    }

    fn retry(&mut self) -> Progress {
        let Some(active) = self.active.as_mut() else {
            return Progress::Stale;
        };
        active.retry_at = None;
        let attempt = active.attempts;

        let Some(credential) = self.credential.clone() else {
            return self.fail(StreamError::Unauthorized(
                "no bearer credential configured".to_string(),
            ));
        };

        debug!(attempt, "reconnecting log stream");
        match self.start_adapter(&credential) {
            Ok(()) => Progress::Reconnecting(attempt),
            Err(err) => self.fail(err),
        }
    }

    fn merge_history(&mut self, history: HistoryResult) -> Progress {
        if history.generation != self.generation || self.current.as_ref() != Some(&history.key) {
            debug!(key = %history.key, "discarding stale history");
            return Progress::Stale;
        }

        match history.result {
            Ok(body) => {
                let (frames, malformed) =
                    LogParser::parse_body(&body, self.config.options.format);
                if malformed > 0 {
                    warn!(key = %history.key, malformed, "skipped malformed history lines");
                }
                let records: Vec<LogRecord> = frames
                    .into_iter()
                    .map(|frame| frame.into_record(self.sequence.next(), &history.key))
                    .collect();
                let merged = self.store.merge(records);
                self.resume_point = self.resume_point.max(self.store.last_logical_time());

                self.history_loaded = true;
                self.history_error = None;
                self.notify(StreamNotice::HistoryLoaded {
                    key: history.key,
                    records: merged,
                    malformed,
                });
                Progress::HistoryMerged(merged)
            }
            Err(error) => {
                warn!(key = %history.key, error = %error, "history fetch failed");
                self.history_error = Some(error.clone());
                self.notify(StreamNotice::Error {
                    key: history.key,
                    error,
                });
                Progress::HistoryFailed
            }
        }
    }

    /// Start the adapter for the active subscription
    fn start_adapter(&mut self, credential: &Credential) -> Result<(), StreamError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let live = active
            .adapter
            .as_ref()
            .is_some_and(LogStreamAdapter::is_live);
        debug_assert!(!live, "subscription already active for {}", active.key);
        if live {
            error!(key = %active.key, "refusing to open a second log stream");
            return Err(StreamError::SubscriptionConflict(active.key.clone()));
        }

        if let Some(mut previous) = active.adapter.take() {
            previous.stop();
        }

        // Resume after what was already stored, even if the view cleared it since
        let mut options = self.config.options.clone();
        options.resume_after = self.resume_point.max(self.store.last_logical_time());

        let mut adapter = LogStreamAdapter::new(active.key.clone(), self.sequence.clone());
        adapter.start(self.source.as_ref(), credential, &options)?;
        active.adapter = Some(adapter);

        self.set_state(StreamState::Connecting);
        Ok(())
    }

    /// Move to a new key: full teardown, then an empty store
    fn switch_to(&mut self, key: SubscriptionKey) {
        let had_subscription = self.current.is_some() || self.active.is_some();
        self.teardown();
        if had_subscription {
            self.set_state(StreamState::Stopped);
        }
        self.store.clear();
        self.resume_point = None;
        self.last_error = None;
        self.history_error = None;
        self.history_loaded = false;
        self.current = Some(key);
    }

    fn teardown(&mut self) {
        self.history_cancel.cancel();
        self.history_cancel = CancellationToken::new();
        self.generation += 1;
        self.release_active();
    }

    /// Stop the adapter, cancel the flush timer and close the buffer
    fn release_active(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        if let Some(adapter) = active.adapter.as_mut() {
            adapter.stop();
        }
        active.scheduler.cancel();
        active.buffer.close();
        debug!(key = %active.key, "released log stream");
        true
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state == state {
            return;
        }
        debug!(from = self.state.label(), to = state.label(), "stream state changed");
        self.state = state;
        self.notify(StreamNotice::StateChanged {
            key: self.current.clone(),
            state,
        });
    }

    fn notify(&self, notice: StreamNotice) {
        // UI may have gone away during shutdown
        let _ = self.notices.send(notice);
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn next_event(adapter: &mut Option<LogStreamAdapter>) -> StreamEvent {
    match adapter {
        Some(adapter) => adapter.next_event().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedSource, TransportLog};

    fn key(pod: &str) -> SubscriptionKey {
        SubscriptionKey::new("clusterA", "ns1", pod, "main")
    }

    fn controller(
        source: &ScriptedSource,
        config: StreamConfig,
    ) -> (StreamController, mpsc::UnboundedReceiver<StreamNotice>) {
        StreamController::new(
            Arc::new(source.clone()),
            Some(Credential::new("token")),
            OrderedLogStore::new(),
            config,
        )
    }

    /// One step, or None if nothing happens within a minute of paused time
    async fn step(controller: &mut StreamController) -> Option<Progress> {
        tokio::time::timeout(Duration::from_secs(60), controller.step())
            .await
            .ok()
    }

    fn texts(controller: &StreamController) -> Vec<String> {
        controller
            .store()
            .snapshot()
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamNotice>) -> Vec<StreamNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_arrivals_flush_in_time_order() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());

        c.subscribe(key("podX")).unwrap();
        assert_eq!(c.state(), StreamState::Connecting);
        assert_eq!(step(&mut c).await, Some(Progress::Connected));
        assert_eq!(c.state(), StreamState::Streaming);
        assert_eq!(c.status(), ViewStatus::Waiting);

        source.send_raw(
            &key("podX"),
            "2024-01-15T10:30:02Z T2\n2024-01-15T10:30:01Z T1\n2024-01-15T10:30:03Z T3\n",
        );
        for _ in 0..3 {
            assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        }
        assert!(c.store().is_empty());

        assert_eq!(step(&mut c).await, Some(Progress::Flushed(3)));
        assert_eq!(texts(&c), vec!["T1", "T2", "T3"]);
        assert_eq!(c.status(), ViewStatus::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_window_is_one_mutation() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;

        let burst: String = (0..100)
            .map(|i| format!("2024-01-15T10:30:00.{:03}Z line {}\n", i, i))
            .collect();
        source.send_raw(&key("podX"), &burst);

        for _ in 0..100 {
            assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        }
        assert_eq!(c.store().revision(), 0);
        assert_eq!(step(&mut c).await, Some(Progress::Flushed(100)));
        assert_eq!(c.store().revision(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_keeps_deferring_flush() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;

        let start = Instant::now();
        for i in 0..3 {
            source.send_raw(&key("podX"), &format!("2024-01-15T10:30:0{}Z tick\n", i));
            assert_eq!(step(&mut c).await, Some(Progress::Buffered));
            tokio::time::advance(Duration::from_millis(600)).await;
        }
        assert!(c.store().is_empty());

        assert_eq!(step(&mut c).await, Some(Progress::Flushed(3)));
        assert!(start.elapsed() >= Duration::from_millis(2200));
        assert_eq!(c.store().revision(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_is_skipped_not_fatal() {
        let source = ScriptedSource::new();
        let (mut c, mut notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;

        source.send_raw(&key("podX"), "badline\n2024-01-15T10:30:00Z hello\n");
        assert_eq!(step(&mut c).await, Some(Progress::Skipped));
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        assert_eq!(step(&mut c).await, Some(Progress::Flushed(1)));
        assert_eq!(texts(&c), vec!["hello"]);

        assert!(drain(&mut notices).iter().any(|n| matches!(
            n,
            StreamNotice::Error {
                error: StreamError::MalformedFrame { .. },
                ..
            }
        )));

        // The tail keeps going
        source.send_raw(&key("podX"), "2024-01-15T10:30:01Z still here\n");
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        assert_eq!(c.state(), StreamState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent_and_final() {
        let source = ScriptedSource::new();
        let (mut c, mut notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;

        source.send_raw(&key("podX"), "2024-01-15T10:30:00Z a\n2024-01-15T10:30:01Z b\n");
        step(&mut c).await;
        step(&mut c).await;
        drain(&mut notices);

        c.unsubscribe();
        c.unsubscribe();

        assert_eq!(
            source.transport_log(),
            vec![
                TransportLog::Open(key("podX")),
                TransportLog::Close(key("podX"))
            ]
        );
        assert_eq!(c.state(), StreamState::Stopped);
        assert_eq!(
            drain(&mut notices),
            vec![StreamNotice::StateChanged {
                key: None,
                state: StreamState::Stopped
            }]
        );

        // Pending flush was cancelled, late lines go nowhere
        source.send_raw(&key("podX"), "2024-01-15T10:30:02Z late\n");
        assert_eq!(step(&mut c).await, None);
        assert!(c.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_change_stops_old_stream_before_starting_new() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        assert_eq!(step(&mut c).await, Some(Progress::Connected));
        source.send_raw(&key("podX"), "2024-01-15T10:30:00Z from x\n");
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));

        c.subscribe(key("podY")).unwrap();
        assert_eq!(
            source.transport_log(),
            vec![
                TransportLog::Open(key("podX")),
                TransportLog::Close(key("podX")),
                TransportLog::Open(key("podY")),
            ]
        );

        assert_eq!(step(&mut c).await, Some(Progress::Connected));
        source.send_raw(&key("podX"), "2024-01-15T10:30:01Z late x\n");
        source.send_raw(&key("podY"), "2024-01-15T10:30:02Z from y\n");
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        assert_eq!(step(&mut c).await, Some(Progress::Flushed(1)));

        let snapshot = c.store().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.iter().all(|r| r.source_pod == "podY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_subscribe_is_noop() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;
        c.subscribe(key("podX")).unwrap();
        assert_eq!(source.open_count(&key("podX")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_key_goes_idle_without_connecting() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX").with_container("")).unwrap();
        assert_eq!(c.state(), StreamState::Idle);
        assert!(source.transport_log().is_empty());
        assert_eq!(c.status(), ViewStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_reconnects_and_resumes() {
        let source = ScriptedSource::new();
        let (mut c, mut notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;

        source.send_raw(&key("podX"), "2024-01-15T10:30:01Z first\n");
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        source.fail_stream(&key("podX"), "connection reset");
        assert_eq!(step(&mut c).await, Some(Progress::Disconnected));

        // Buffered records survive the disconnect
        assert_eq!(texts(&c), vec!["first"]);
        assert_eq!(c.state(), StreamState::Errored);
        assert_eq!(c.status(), ViewStatus::Reconnecting { attempt: 1 });
        assert!(drain(&mut notices).iter().any(|n| matches!(
            n,
            StreamNotice::Reconnecting { attempt: 1, .. }
        )));

        let before = Instant::now();
        assert_eq!(step(&mut c).await, Some(Progress::Reconnecting(1)));
        assert!(before.elapsed() >= Duration::from_millis(500));
        assert_eq!(source.open_count(&key("podX")), 2);
        assert_eq!(
            source.open_options()[1].resume_after,
            "2024-01-15T10:30:01Z".parse().ok()
        );

        assert_eq!(step(&mut c).await, Some(Progress::Connected));
        source.send_raw(
            &key("podX"),
            "2024-01-15T10:30:01Z first\n2024-01-15T10:30:02Z second\n",
        );
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        assert_eq!(step(&mut c).await, Some(Progress::Flushed(1)));
        assert_eq!(texts(&c), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_lines_stay_cleared_after_reconnect() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;

        source.send_raw(&key("podX"), "2024-01-15T10:30:01Z old\n");
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        assert_eq!(step(&mut c).await, Some(Progress::Flushed(1)));

        c.store().clear();
        source.fail_stream(&key("podX"), "connection reset");
        assert_eq!(step(&mut c).await, Some(Progress::Disconnected));
        assert_eq!(step(&mut c).await, Some(Progress::Reconnecting(1)));
        assert_eq!(
            source.open_options()[1].resume_after,
            "2024-01-15T10:30:01Z".parse().ok()
        );

        assert_eq!(step(&mut c).await, Some(Progress::Connected));
        source.send_raw(
            &key("podX"),
            "2024-01-15T10:30:01Z old\n2024-01-15T10:30:02Z new\n",
        );
        assert_eq!(step(&mut c).await, Some(Progress::Buffered));
        assert_eq!(step(&mut c).await, Some(Progress::Flushed(1)));
        assert_eq!(texts(&c), vec!["new"]);

        // A different key starts from scratch
        c.subscribe(key("podY")).unwrap();
        assert_eq!(source.open_options()[2].resume_after, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let source = ScriptedSource::new();
        let config = StreamConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut c, mut notices) = controller(&source, config);
        for _ in 0..3 {
            source.fail_next_open(StreamError::ConnectionLost("refused".to_string()));
        }

        c.subscribe(key("podX")).unwrap();
        assert_eq!(step(&mut c).await, Some(Progress::Disconnected));
        assert_eq!(step(&mut c).await, Some(Progress::Reconnecting(1)));
        assert_eq!(step(&mut c).await, Some(Progress::Disconnected));
        assert_eq!(step(&mut c).await, Some(Progress::Reconnecting(2)));
        assert_eq!(step(&mut c).await, Some(Progress::Disconnected));
        assert_eq!(step(&mut c).await, None);

        assert_eq!(source.open_count(&key("podX")), 3);
        assert!(matches!(c.status(), ViewStatus::StreamFailed(_)));
        assert!(drain(&mut notices).contains(&StreamNotice::GaveUp {
            key: key("podX"),
            attempts: 2
        }));

        // A manual reconnect starts over
        c.reconnect().unwrap();
        assert_eq!(step(&mut c).await, Some(Progress::Connected));
        assert_eq!(source.open_count(&key("podX")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_terminal() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        source.fail_next_open(StreamError::Unauthorized("token expired".to_string()));

        c.subscribe(key("podX")).unwrap();
        assert_eq!(step(&mut c).await, Some(Progress::Disconnected));
        assert_eq!(step(&mut c).await, None);
        assert_eq!(source.open_count(&key("podX")), 1);
        assert_eq!(
            c.last_error(),
            Some(&StreamError::Unauthorized("token expired".to_string()))
        );
        assert!(matches!(c.status(), ViewStatus::StreamFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_never_connects() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = StreamController::new(
            Arc::new(source.clone()),
            None,
            OrderedLogStore::new(),
            StreamConfig::default(),
        );
        assert!(matches!(
            c.subscribe(key("podX")),
            Err(StreamError::Unauthorized(_))
        ));
        assert!(source.transport_log().is_empty());
        assert_eq!(c.state(), StreamState::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_merges_into_store() {
        let source = ScriptedSource::new();
        source.set_history(
            &key("podX"),
            Ok("2024-01-15T10:30:02Z b\nbadline\n2024-01-15T10:30:01Z a\n".to_string()),
        );
        let (mut c, mut notices) = controller(&source, StreamConfig::default());

        c.load_history(key("podX")).unwrap();
        assert_eq!(step(&mut c).await, Some(Progress::HistoryMerged(2)));
        assert_eq!(texts(&c), vec!["a", "b"]);
        assert_eq!(c.status(), ViewStatus::Loaded);
        assert!(drain(&mut notices).contains(&StreamNotice::HistoryLoaded {
            key: key("podX"),
            records: 2,
            malformed: 1
        }));

        // Following afterwards resumes after the newest history line
        c.subscribe(key("podX")).unwrap();
        assert_eq!(
            source.open_options()[0].resume_after,
            "2024-01-15T10:30:02Z".parse().ok()
        );
        assert_eq!(texts(&c), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_failure_is_distinct_from_stream_failure() {
        let source = ScriptedSource::new();
        source.set_history(
            &key("podX"),
            Err(StreamError::HistoryFetch("500 Internal Server Error".to_string())),
        );
        let (mut c, _notices) = controller(&source, StreamConfig::default());

        c.load_history(key("podX")).unwrap();
        assert_eq!(step(&mut c).await, Some(Progress::HistoryFailed));
        assert!(matches!(c.status(), ViewStatus::HistoryFailed(_)));
        assert!(c.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_for_old_key_is_discarded() {
        let source = ScriptedSource::new();
        source.set_history(&key("podX"), Ok("2024-01-15T10:30:00Z x\n".to_string()));
        let (mut c, _notices) = controller(&source, StreamConfig::default());

        c.load_history(key("podX")).unwrap();
        c.subscribe(key("podY")).unwrap();

        loop {
            match step(&mut c).await {
                Some(Progress::Connected) => break,
                Some(Progress::Stale) => continue,
                other => panic!("unexpected progress {:?}", other),
            }
        }
        assert!(c.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "subscription already active")]
    async fn test_second_adapter_is_a_contract_violation() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        let credential = Credential::new("token");
        let _ = c.start_adapter(&credential);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_transport() {
        let source = ScriptedSource::new();
        let (mut c, _notices) = controller(&source, StreamConfig::default());
        c.subscribe(key("podX")).unwrap();
        step(&mut c).await;
        drop(c);
        assert_eq!(
            source.transport_log().last(),
            Some(&TransportLog::Close(key("podX")))
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        };
        let delays: Vec<_> = (1..=7).map(|a| policy.delay_for(a)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(8)),
                None,
            ]
        );
    }
}
