//! In-memory log source for driving the pipeline from tests

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use logscope_types::{Credential, StreamError, SubscriptionKey};

use crate::source::{LineStream, LogSource, StreamOptions, frame_lines};

/// Transport side effects, in the order they happened
#[derive(Clone, Debug, PartialEq)]
pub enum TransportLog {
    Open(SubscriptionKey),
    Close(SubscriptionKey),
    History(SubscriptionKey),
}

#[derive(Default)]
struct Inner {
    senders: HashMap<SubscriptionKey, mpsc::UnboundedSender<io::Result<Vec<u8>>>>,
    log: Vec<TransportLog>,
    open_failures: VecDeque<StreamError>,
    history: HashMap<SubscriptionKey, Result<String, StreamError>>,
    options: Vec<StreamOptions>,
}

/// Records the close of a scripted connection when dropped
struct CloseGuard {
    key: SubscriptionKey,
    inner: Arc<Mutex<Inner>>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.inner
            .lock()
            .log
            .push(TransportLog::Close(self.key.clone()));
    }
}

#[derive(Clone, Default)]
pub struct ScriptedSource {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk; every line becomes one frame on the live connection
    pub fn send_raw(&self, key: &SubscriptionKey, raw: &str) {
        self.send_bytes(key, raw.as_bytes());
    }

    pub fn send_bytes(&self, key: &SubscriptionKey, raw: &[u8]) {
        let inner = self.inner.lock();
        if let Some(tx) = inner.senders.get(key) {
            let _ = tx.send(Ok(raw.to_vec()));
        }
    }

    pub fn fail_stream(&self, key: &SubscriptionKey, reason: &str) {
        let inner = self.inner.lock();
        if let Some(tx) = inner.senders.get(key) {
            let _ = tx.send(Err(io::Error::other(reason.to_string())));
        }
    }

    /// End the live connection cleanly
    pub fn end_stream(&self, key: &SubscriptionKey) {
        self.inner.lock().senders.remove(key);
    }

    pub fn fail_next_open(&self, err: StreamError) {
        self.inner.lock().open_failures.push_back(err);
    }

    pub fn set_history(&self, key: &SubscriptionKey, result: Result<String, StreamError>) {
        self.inner.lock().history.insert(key.clone(), result);
    }

    pub fn transport_log(&self) -> Vec<TransportLog> {
        self.inner.lock().log.clone()
    }

    pub fn open_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|entry| matches!(entry, TransportLog::Open(k) if k == key))
            .count()
    }

    /// Options passed to each `open_stream` call
    pub fn open_options(&self) -> Vec<StreamOptions> {
        self.inner.lock().options.clone()
    }
}

impl LogSource for ScriptedSource {
    fn open_stream(
        &self,
        key: &SubscriptionKey,
        _credential: &Credential,
        options: &StreamOptions,
    ) -> BoxFuture<'static, Result<LineStream, StreamError>> {
        let mut inner = self.inner.lock();
        inner.log.push(TransportLog::Open(key.clone()));
        inner.options.push(options.clone());

        if let Some(err) = inner.open_failures.pop_front() {
            return async move { Err(err) }.boxed();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.senders.insert(key.clone(), tx);

        let guard = CloseGuard {
            key: key.clone(),
            inner: Arc::clone(&self.inner),
        };
        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .map(move |item| {
            let _connection = &guard;
            item
        })
        .boxed();
        let lines = frame_lines(chunks.into_async_read());

        async move { Ok(lines) }.boxed()
    }

    fn fetch_history(
        &self,
        key: &SubscriptionKey,
        _credential: &Credential,
        _options: &StreamOptions,
    ) -> BoxFuture<'static, Result<String, StreamError>> {
        let mut inner = self.inner.lock();
        inner.log.push(TransportLog::History(key.clone()));
        let result = inner
            .history
            .get(key)
            .cloned()
            .unwrap_or_else(|| Ok(String::new()));
        async move { result }.boxed()
    }
}
