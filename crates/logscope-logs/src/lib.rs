//! Log streaming for logscope
//!
//! This crate turns a live container log stream into a time-ordered,
//! queryable store: the adapter parses frames, the ingestion buffer stages
//! them, the flush scheduler coalesces bursts and the controller supervises
//! the whole pipeline across subscription changes.

mod adapter;
mod ansi;
mod buffer;
mod controller;
mod filter;
mod parser;
mod scheduler;
mod source;
mod store;

#[cfg(test)]
mod test_support;

pub use adapter::{LogStreamAdapter, SequenceGenerator};
pub use ansi::strip_ansi;
pub use buffer::IngestionBuffer;
pub use controller::{
    Progress, RetryPolicy, StreamConfig, StreamController, StreamNotice, ViewStatus,
};
pub use filter::{CompiledFilter, FilterPresets};
pub use parser::{FrameFormat, LogParser, ParsedFrame};
pub use scheduler::{DEFAULT_QUIESCENCE, FlushScheduler};
pub use source::{KubeLogSource, LineStream, LogSource, StreamOptions};
pub use store::{LevelCounts, OrderedLogStore};

// Re-export types used in our public API
pub use logscope_types::{
    Credential, LogLevel, LogRecord, StreamError, StreamEvent, StreamState, SubscriptionKey,
};
