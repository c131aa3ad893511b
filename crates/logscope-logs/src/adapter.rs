use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use logscope_types::{Credential, StreamError, StreamEvent, SubscriptionKey};

use crate::parser::{FrameFormat, LogParser};
use crate::source::{LineStream, LogSource, StreamOptions};

/// Shared arrival counter. Clones hand out from the same sequence.
#[derive(Clone, Debug, Default)]
pub struct SequenceGenerator(Arc<AtomicU64>);

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number, starting at 1
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The transport handle, owned exclusively by the adapter
enum Connection {
    Idle,
    Opening(BoxFuture<'static, Result<LineStream, StreamError>>),
    Open(LineStream),
    /// Transport ended on its own; waiting for `stop`
    Finished,
    Stopped,
}

/// Wraps a single live log connection and turns its frames into events
pub struct LogStreamAdapter {
    target: SubscriptionKey,
    sequence: SequenceGenerator,
    format: FrameFormat,
    resume_after: Option<DateTime<Utc>>,
    connection: Connection,
}

impl LogStreamAdapter {
    pub fn new(target: SubscriptionKey, sequence: SequenceGenerator) -> Self {
        Self {
            target,
            sequence,
            format: FrameFormat::default(),
            resume_after: None,
            connection: Connection::Idle,
        }
    }

    pub fn target(&self) -> &SubscriptionKey {
        &self.target
    }

    /// Open the transport connection. Events are pulled with `next_event`.
    pub fn start(
        &mut self,
        source: &dyn LogSource,
        credential: &Credential,
        options: &StreamOptions,
    ) -> Result<(), StreamError> {
        if !matches!(self.connection, Connection::Idle) {
            return Err(StreamError::SubscriptionConflict(self.target.clone()));
        }

        debug!(target = %self.target, resume_after = ?options.resume_after, "opening log stream");
        self.format = options.format;
        self.resume_after = options.resume_after;
        self.connection =
            Connection::Opening(source.open_stream(&self.target, credential, options));
        Ok(())
    }

    /// Whether a connection is opening or open
    pub fn is_live(&self) -> bool {
        matches!(
            self.connection,
            Connection::Opening(_) | Connection::Open(_)
        )
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.connection, Connection::Stopped)
    }

    /// Release the transport. Returns true only for the call that actually tore down.
    pub fn stop(&mut self) -> bool {
        if self.is_stopped() {
            return false;
        }
        // Dropping the pending open or the line stream closes the connection
        self.connection = Connection::Stopped;
        debug!(target = %self.target, "log stream stopped");
        true
    }

    /// Wait for the next event. Never resolves when idle, finished or stopped.
    ///
    /// Cancel safe: the connection lives in `self`, so dropping this future
    /// loses nothing.
    pub async fn next_event(&mut self) -> StreamEvent {
        loop {
            match &mut self.connection {
                Connection::Opening(open) => {
                    let result = open.await;
                    return match result {
                        Ok(lines) => {
                            self.connection = Connection::Open(lines);
                            StreamEvent::Ready
                        }
                        Err(err) => {
                            self.connection = Connection::Finished;
                            warn!(target = %self.target, error = %err, "failed to open log stream");
                            StreamEvent::Error(err)
                        }
                    };
                }
                Connection::Open(lines) => {
                    let next = lines.next().await;
                    match next {
                        Some(Ok(line)) => {
                            if let Some(event) = self.handle_frame(&line) {
                                return event;
                            }
                        }
                        Some(Err(err)) => {
                            self.connection = Connection::Finished;
                            warn!(target = %self.target, error = %err, "log stream read failed");
                            return StreamEvent::Error(StreamError::ConnectionLost(
                                err.to_string(),
                            ));
                        }
                        None => {
                            self.connection = Connection::Finished;
                            debug!(target = %self.target, "log stream closed by server");
                            return StreamEvent::Closed;
                        }
                    }
                }
                Connection::Idle | Connection::Finished | Connection::Stopped => {
                    return std::future::pending().await;
                }
            }
        }
    }

    /// Parse one frame; `None` means nothing to emit
    fn handle_frame(&self, line: &str) -> Option<StreamEvent> {
        match LogParser::parse_frame(line, self.format) {
            Ok(Some(frame)) => {
                if let (Some(after), Some(ts)) = (self.resume_after, frame.logical_time) {
                    if ts <= after {
                        trace!(target = %self.target, "skipping replayed line");
                        return None;
                    }
                }
                let record = frame.into_record(self.sequence.next(), &self.target);
                Some(StreamEvent::Record(record))
            }
            Ok(None) => None,
            Err(err) => {
                warn!(target = %self.target, error = %err, "skipping malformed log frame");
                Some(StreamEvent::Error(err))
            }
        }
    }
}

impl Drop for LogStreamAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}
