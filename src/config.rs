//! Config file handling
//!
//! Settings live in `~/.config/logscope/config.toml`; command line flags
//! override whatever the file sets.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use logscope_logs::{FrameFormat, RetryPolicy, StreamConfig, StreamOptions};
use logscope_types::{Credential, TimeRange};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub stream: StreamSection,
    pub auth: AuthSection,
}

/// `[stream]`
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSection {
    /// Quiet period before buffered lines are shown
    pub quiescence_ms: u64,
    pub tail_lines: Option<i64>,
    /// Time range label: 5m, 15m, 30m, 1h, 6h, 24h or all
    pub since: Option<String>,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub format: FrameFormat,
}

impl Default for StreamSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            quiescence_ms: 1000,
            tail_lines: Some(100),
            since: None,
            max_retries: retry.max_attempts,
            backoff_initial_ms: retry.initial_backoff.as_millis() as u64,
            backoff_max_ms: retry.max_backoff.as_millis() as u64,
            format: FrameFormat::default(),
        }
    }
}

/// `[auth]`
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    pub token: Option<String>,
    /// File holding the bearer token, e.g. a projected service account token
    pub token_file: Option<PathBuf>,
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".config").join("logscope").join("config.toml"))
    }

    /// Load from `path`, or from the default location if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Controller settings for these values
    pub fn stream_config(&self) -> Result<StreamConfig> {
        let stream = &self.stream;

        let since_seconds = match stream.since.as_deref() {
            None => None,
            Some(label) => match TimeRange::from_label(label) {
                Some(range) => range.as_seconds(),
                None => bail!(
                    "Unknown time range '{}' (expected 5m, 15m, 30m, 1h, 6h, 24h or all)",
                    label
                ),
            },
        };
        if stream.backoff_initial_ms > stream.backoff_max_ms {
            bail!("backoff_initial_ms must not exceed backoff_max_ms");
        }

        Ok(StreamConfig {
            quiescence: Duration::from_millis(stream.quiescence_ms),
            retry: RetryPolicy {
                max_attempts: stream.max_retries,
                initial_backoff: Duration::from_millis(stream.backoff_initial_ms),
                max_backoff: Duration::from_millis(stream.backoff_max_ms),
            },
            options: StreamOptions {
                tail_lines: stream.tail_lines,
                since_seconds,
                resume_after: None,
                format: stream.format,
            },
        })
    }
}

/// Bearer token from the command line, then `[auth] token`, then `[auth] token_file`
pub fn resolve_credential(cli_token: Option<String>, auth: &AuthSection) -> Result<Option<Credential>> {
    if let Some(token) = cli_token.or_else(|| auth.token.clone()) {
        return Ok(non_empty(&token));
    }

    match &auth.token_file {
        Some(path) => {
            let token = fs::read_to_string(path)
                .with_context(|| format!("Failed to read token file {}", path.display()))?;
            Ok(non_empty(&token))
        }
        None => Ok(None),
    }
}

fn non_empty(token: &str) -> Option<Credential> {
    let token = token.trim();
    (!token.is_empty()).then(|| Credential::new(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        let stream = config.stream_config().unwrap();
        assert_eq!(stream.quiescence, Duration::from_secs(1));
        assert_eq!(stream.options.tail_lines, Some(100));
        assert_eq!(stream.options.since_seconds, None);
        assert_eq!(stream.retry.max_attempts, 5);
    }

    #[test]
    fn test_parse_sections() {
        let config = Config::parse(
            r#"
            [stream]
            quiescence_ms = 250
            since = "15m"
            max_retries = 2
            format = "json"

            [auth]
            token = "abc"
            "#,
        )
        .unwrap();

        let stream = config.stream_config().unwrap();
        assert_eq!(stream.quiescence, Duration::from_millis(250));
        assert_eq!(stream.options.since_seconds, Some(900));
        assert_eq!(stream.options.format, FrameFormat::Json);
        assert_eq!(stream.retry.max_attempts, 2);
        assert_eq!(config.auth.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("[stream]\nunknown = 1").is_err());

        let mut config = Config::default();
        config.stream.since = Some("3d".to_string());
        assert!(config.stream_config().is_err());

        let mut config = Config::default();
        config.stream.backoff_initial_ms = 20_000;
        assert!(config.stream_config().is_err());
    }

    #[test]
    fn test_cli_token_wins() {
        let auth = AuthSection {
            token: Some("from-file".to_string()),
            token_file: None,
        };
        let credential = resolve_credential(Some("from-cli".to_string()), &auth).unwrap();
        assert_eq!(credential.map(|c| c.token().to_string()), Some("from-cli".to_string()));

        let credential = resolve_credential(None, &auth).unwrap();
        assert_eq!(credential.map(|c| c.token().to_string()), Some("from-file".to_string()));
    }

    #[test]
    fn test_blank_token_is_no_credential() {
        let credential = resolve_credential(Some("  \n".to_string()), &AuthSection::default()).unwrap();
        assert!(credential.is_none());
        assert!(resolve_credential(None, &AuthSection::default()).unwrap().is_none());
    }

    #[test]
    fn test_missing_token_file_is_an_error() {
        let auth = AuthSection {
            token: None,
            token_file: Some(PathBuf::from("/nonexistent/logscope/token")),
        };
        assert!(resolve_credential(None, &auth).is_err());
    }
}
