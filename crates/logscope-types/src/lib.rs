//! Shared types for logscope
//!
//! This crate contains data structures used across multiple logscope crates.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Pod information
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub containers: Vec<ContainerInfo>,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            containers: Vec::new(),
        }
    }

    /// Names of all containers in declaration order
    pub fn container_names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub name: String,
}

impl ContainerInfo {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

// ============================================================================
// Subscription Types
// ============================================================================

/// Identifies one tailed container log stream
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Kubeconfig context naming the cluster
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl SubscriptionKey {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    /// A subscription only exists once every field is filled in
    pub fn is_complete(&self) -> bool {
        !self.cluster.is_empty()
            && !self.namespace.is_empty()
            && !self.pod.is_empty()
            && !self.container.is_empty()
    }

    /// Same target with a different container
    pub fn with_container(&self, container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cluster, self.namespace, self.pod, self.container
        )
    }
}

/// Opaque bearer credential injected into every cluster request
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Time range for historical log selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeRange {
    /// Everything the kubelet still has (bounded by tail_lines)
    #[default]
    All,
    Last5m,
    Last15m,
    Last30m,
    Last1h,
    Last6h,
    Last24h,
}

impl TimeRange {
    /// Get the number of seconds for this time range
    pub fn as_seconds(&self) -> Option<i64> {
        match self {
            Self::All => None,
            Self::Last5m => Some(5 * 60),
            Self::Last15m => Some(15 * 60),
            Self::Last30m => Some(30 * 60),
            Self::Last1h => Some(60 * 60),
            Self::Last6h => Some(6 * 60 * 60),
            Self::Last24h => Some(24 * 60 * 60),
        }
    }

    /// Display label, also accepted by `from_label`
    pub fn label(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Last5m => "5m",
            Self::Last15m => "15m",
            Self::Last30m => "30m",
            Self::Last1h => "1h",
            Self::Last6h => "6h",
            Self::Last24h => "24h",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [
            Self::All,
            Self::Last5m,
            Self::Last15m,
            Self::Last30m,
            Self::Last1h,
            Self::Last6h,
            Self::Last24h,
        ]
        .into_iter()
        .find(|r| r.label().eq_ignore_ascii_case(label))
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    #[default]
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRC",
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
            Self::Unknown => "???",
        }
    }
}

/// A single normalized log record
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    /// Arrival index, unique per view and never reused
    pub sequence: u64,

    /// Timestamp taken from the payload, if it had a parseable one
    pub logical_time: Option<DateTime<Utc>>,

    /// Message payload exactly as received (ANSI sequences included)
    pub text: String,

    /// Detected log level
    pub level: LogLevel,

    pub source_cluster: String,
    pub source_namespace: String,
    pub source_pod: String,
    pub source_container: String,
}

impl LogRecord {
    /// Create a record attributed to the given subscription
    pub fn new(sequence: u64, key: &SubscriptionKey, text: String) -> Self {
        Self {
            sequence,
            logical_time: None,
            text,
            level: LogLevel::Unknown,
            source_cluster: key.cluster.clone(),
            source_namespace: key.namespace.clone(),
            source_pod: key.pod.clone(),
            source_container: key.container.clone(),
        }
    }

    pub fn with_time(mut self, logical_time: Option<DateTime<Utc>>) -> Self {
        self.logical_time = logical_time;
        self
    }

    /// Canonical store ordering: logical time, then sequence
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.logical_time
            .cmp(&other.logical_time)
            .then(self.sequence.cmp(&other.sequence))
    }
}

// ============================================================================
// Stream Types
// ============================================================================

/// Errors surfaced by the streaming layer
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// One frame could not be parsed; the stream continues
    #[error("malformed frame ({reason}): {line}")]
    MalformedFrame { line: String, reason: String },

    /// Transport closed or failed while opening or reading
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Credential missing or rejected by the cluster
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A second adapter was started for a live subscription
    #[error("subscription already active for {0}")]
    SubscriptionConflict(SubscriptionKey),

    /// One-shot historical fetch failed
    #[error("history fetch failed: {0}")]
    HistoryFetch(String),
}

impl StreamError {
    pub fn malformed(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Whether the controller may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

/// Events emitted by a log source adapter
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Transport connection established
    Ready,
    Record(LogRecord),
    Error(StreamError),
    /// Transport reached a clean end of stream
    Closed,
}

/// Lifecycle state of a stream subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Errored,
    Stopped,
}

impl StreamState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Errored => "errored",
            Self::Stopped => "stopped",
        }
    }
}
