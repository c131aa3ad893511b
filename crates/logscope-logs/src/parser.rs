use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use logscope_types::{LogLevel, LogRecord, StreamError, SubscriptionKey};

use crate::ansi::strip_ansi;

/// Wire format of the frames a source produces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// `<timestamp><whitespace><message>` lines, as the kubelet sends with timestamps on
    #[default]
    Text,
    /// One JSON object per frame, as sent by the admin gateway event stream
    Json,
}

/// A frame reduced to the fields a record needs
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFrame {
    pub logical_time: Option<DateTime<Utc>>,
    pub text: String,
    pub level: LogLevel,
}

impl ParsedFrame {
    /// Attach a sequence number and provenance
    pub fn into_record(self, sequence: u64, key: &SubscriptionKey) -> LogRecord {
        let mut record = LogRecord::new(sequence, key, self.text).with_time(self.logical_time);
        record.level = self.level;
        record
    }
}

/// Gateway event payload
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    unix: Option<Value>,
}

/// Log parser for extracting structure from raw frames
pub struct LogParser;

impl LogParser {
    /// Parse one frame.
    ///
    /// Blank frames yield `Ok(None)`. A frame that cannot become a record yields
    /// `MalformedFrame`; callers skip it and keep reading.
    pub fn parse_frame(
        frame: &str,
        format: FrameFormat,
    ) -> Result<Option<ParsedFrame>, StreamError> {
        let line = frame.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }

        match format {
            FrameFormat::Text => Self::parse_text(line).map(Some),
            FrameFormat::Json => Self::parse_json(line).map(Some),
        }
    }

    /// Parse every line of a one-shot history body, skipping bad lines
    pub fn parse_body(body: &str, format: FrameFormat) -> (Vec<ParsedFrame>, usize) {
        let mut frames = Vec::new();
        let mut malformed = 0;
        for line in body.lines() {
            match Self::parse_frame(line, format) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(_) => malformed += 1,
            }
        }
        (frames, malformed)
    }

    fn parse_text(line: &str) -> Result<ParsedFrame, StreamError> {
        let (logical_time, text) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => match Self::parse_timestamp(head) {
                Some(ts) => (Some(ts), rest.trim_start()),
                // No timestamp prefix: the whole line is the message
                None => (None, line),
            },
            None => match Self::parse_timestamp(line) {
                Some(ts) => (Some(ts), ""),
                None => {
                    return Err(StreamError::malformed(
                        line,
                        "expected '<timestamp> <message>'",
                    ));
                }
            },
        };

        Ok(ParsedFrame {
            logical_time,
            text: text.to_string(),
            level: Self::detect_level(text),
        })
    }

    fn parse_json(line: &str) -> Result<ParsedFrame, StreamError> {
        // Derived struct impls also accept arrays, so check the shape first
        let value: Value =
            serde_json::from_str(line).map_err(|e| StreamError::malformed(line, e.to_string()))?;
        if !value.is_object() {
            return Err(StreamError::malformed(line, "expected a JSON object"));
        }
        let wire: WireMessage = serde_json::from_value(value)
            .map_err(|e| StreamError::malformed(line, e.to_string()))?;

        let logical_time = wire
            .timestamp
            .as_deref()
            .and_then(Self::parse_timestamp)
            .or_else(|| wire.unix.as_ref().and_then(Self::parse_unix));

        let text = wire.message.or(wire.log).unwrap_or_default();
        let level = Self::detect_level(&text);

        Ok(ParsedFrame {
            logical_time,
            text,
            level,
        })
    }

    /// RFC3339, or the same layout without an offset (taken as UTC)
    fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Unix seconds, as a number or a numeric string
    fn parse_unix(value: &Value) -> Option<DateTime<Utc>> {
        let secs = match value {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
    }

    /// Detect the level of a message body
    pub fn detect_level(text: &str) -> LogLevel {
        let clean = strip_ansi(text);
        let trimmed = clean.trim();
        if trimmed.starts_with('{') {
            if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(trimmed) {
                return Self::extract_level_from_json(&fields);
            }
        }
        Self::extract_level_from_text(trimmed)
    }

    /// Extract log level from JSON fields
    fn extract_level_from_json(fields: &serde_json::Map<String, Value>) -> LogLevel {
        let level_fields = [
            "level",
            "lvl",
            "severity",
            "log.level",
            "loglevel",
            "log_level",
            "Level",
            "LEVEL",
        ];

        for field in level_fields {
            match fields.get(field) {
                Some(Value::String(s)) => return LogLevel::parse(s),
                Some(Value::Number(n)) => {
                    // Some loggers use numeric levels
                    if let Some(num) = n.as_u64() {
                        return match num {
                            0..=10 => LogLevel::Trace,
                            11..=20 => LogLevel::Debug,
                            21..=30 => LogLevel::Info,
                            31..=40 => LogLevel::Warn,
                            41..=50 => LogLevel::Error,
                            _ => LogLevel::Fatal,
                        };
                    }
                }
                _ => {}
            }
        }

        LogLevel::Unknown
    }

    /// Extract log level from plain text patterns
    fn extract_level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        let marked_patterns = [
            ("[FATAL]", LogLevel::Fatal),
            ("[PANIC]", LogLevel::Fatal),
            ("[CRITICAL]", LogLevel::Fatal),
            ("[ERROR]", LogLevel::Error),
            ("[ERR]", LogLevel::Error),
            ("[WARN]", LogLevel::Warn),
            ("[WARNING]", LogLevel::Warn),
            ("[INFO]", LogLevel::Info),
            ("[DEBUG]", LogLevel::Debug),
            ("[TRACE]", LogLevel::Trace),
            ("FATAL:", LogLevel::Fatal),
            ("PANIC:", LogLevel::Fatal),
            ("ERROR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warn),
            ("WARN:", LogLevel::Warn),
            ("INFO:", LogLevel::Info),
            ("DEBUG:", LogLevel::Debug),
            ("TRACE:", LogLevel::Trace),
            (" FATAL ", LogLevel::Fatal),
            (" ERROR ", LogLevel::Error),
            (" WARN ", LogLevel::Warn),
            (" WARNING ", LogLevel::Warn),
            (" INFO ", LogLevel::Info),
            (" DEBUG ", LogLevel::Debug),
            (" TRACE ", LogLevel::Trace),
            ("LEVEL=ERROR", LogLevel::Error),
            ("LEVEL=WARN", LogLevel::Warn),
            ("LEVEL=INFO", LogLevel::Info),
            ("LEVEL=DEBUG", LogLevel::Debug),
        ];

        for (pattern, level) in marked_patterns {
            if upper.contains(pattern) {
                return level;
            }
        }

        // Level word at the start of the message
        let start_patterns = [
            ("FATAL", LogLevel::Fatal),
            ("PANIC", LogLevel::Fatal),
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Trace),
        ];

        for (pattern, level) in start_patterns {
            if upper.starts_with(pattern) {
                return level;
            }
        }

        LogLevel::Unknown
    }
}
