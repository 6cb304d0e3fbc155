//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::retry::{ExhaustionPolicy, RetrySchedule};

const DEFAULT_JOURNAL_PATH: &str = "./logs/journal.log";
const DEFAULT_REPLAY_BATCH_SIZE: usize = 64;
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);

/// Configuration for a [`crate::Client`].
///
/// ```
/// use tether_ws::config::{Config, JournalConfig};
/// use tether_ws::retry::RetrySchedule;
///
/// let config = Config::builder()
///     .uri("wss://feed.example.com/stream")
///     .retry_schedule(RetrySchedule::from_secs(&[1, 1, 5]).unwrap())
///     .retry_indefinitely(false)
///     .journal(JournalConfig::new("/var/lib/feed/journal.log"))
///     .build();
///
/// assert_eq!(config.endpoint().unwrap().as_str(), "wss://feed.example.com/stream");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Endpoint to connect to. `http`/`https` are rewritten to `ws`/`wss`.
    #[builder(into)]
    pub uri: String,
    /// Delays between reconnect attempts
    #[builder(default)]
    pub retry_schedule: RetrySchedule,
    /// Keep retrying with the last delay once the schedule is used up (default: true).
    /// When false the client stops and reports [`crate::error::RetriesExhausted`].
    #[builder(default = true)]
    pub retry_indefinitely: bool,
    /// Journal outbound messages sent while disconnected. Disabled when `None`, in
    /// which case those messages are dropped.
    pub journal: Option<JournalConfig>,
    /// Keep-alive settings for the tokio transport
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Configuration with only an endpoint; everything else uses defaults.
    #[must_use]
    pub fn new<S: Into<String>>(uri: S) -> Self {
        Self::builder().uri(uri).build()
    }

    #[must_use]
    pub fn exhaustion_policy(&self) -> ExhaustionPolicy {
        ExhaustionPolicy::from_retry_indefinitely(self.retry_indefinitely)
    }

    /// Parse and normalize the configured endpoint.
    pub fn endpoint(&self) -> Result<Url> {
        normalize_uri(&self.uri)
    }
}

impl From<&str> for Config {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for Config {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

/// Where and how outbound messages are journaled.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    /// File holding the journal, one message per line
    pub path: PathBuf,
    /// Entries written per replay step before pending client commands are handled
    pub replay_batch_size: usize,
}

impl JournalConfig {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            replay_batch_size: DEFAULT_REPLAY_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_replay_batch_size(mut self, replay_batch_size: usize) -> Self {
        self.replay_batch_size = replay_batch_size.max(1);
        self
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_PATH)
    }
}

/// Ping/pong keep-alive for the tokio transport.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between PING frames; `None` disables the heartbeat
    pub interval: Option<Duration>,
    /// Maximum time to wait for a PONG before the connection is considered dead
    pub timeout: Duration,
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            interval: None,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
        }
    }

    #[must_use]
    pub const fn every(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: Some(interval),
            timeout,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::every(
            DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
        )
    }
}

fn normalize_uri(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::configuration("uri is required"));
    }

    let mut url = Url::parse(raw)
        .map_err(|e| Error::configuration(format!("uri [{raw}] must be a valid uri: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::configuration(format!(
                "uri [{raw}] has unsupported scheme `{other}`"
            )));
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(Error::configuration(format!(
            "uri [{raw}] cannot be converted to {scheme}"
        )));
    }

    if !url.has_host() {
        return Err(Error::configuration(format!("uri [{raw}] has no host")));
    }
    if url.path().is_empty() {
        url.set_path("/");
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn defaults() {
        let config = Config::new("ws://localhost:9000");

        assert!(config.retry_indefinitely);
        assert_eq!(config.exhaustion_policy(), ExhaustionPolicy::RepeatLast);
        assert_eq!(config.retry_schedule, RetrySchedule::default());
        assert!(config.journal.is_none());
        assert_eq!(config.heartbeat.interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn bare_string_is_uri_shorthand() {
        let config: Config = "wss://example.com/feed".into();
        assert_eq!(config.uri, "wss://example.com/feed");
    }

    #[test]
    fn http_schemes_are_rewritten() {
        assert_eq!(
            Config::new("http://example.com").endpoint().unwrap().as_str(),
            "ws://example.com/"
        );
        assert_eq!(
            Config::new("HTTPS://Example.com:8443/a/b?x=1")
                .endpoint()
                .unwrap()
                .as_str(),
            "wss://example.com:8443/a/b?x=1"
        );
    }

    #[test]
    fn empty_path_becomes_root() {
        let url = Config::new("ws://localhost:9000").endpoint().unwrap();
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn invalid_uris_are_configuration_errors() {
        for uri in ["", "   ", "not a uri", "ftp://example.com/", "ws://"] {
            let err = Config::new(uri).endpoint().unwrap_err();
            assert_eq!(err.kind(), Kind::Configuration, "{uri}");
        }
    }

    #[test]
    fn exhaustion_policy_follows_retry_flag() {
        let config = Config::builder()
            .uri("ws://localhost")
            .retry_indefinitely(false)
            .build();
        assert_eq!(config.exhaustion_policy(), ExhaustionPolicy::Fail);
    }

    #[test]
    fn journal_defaults() {
        let journal = JournalConfig::default();
        assert_eq!(journal.path, PathBuf::from("./logs/journal.log"));
        assert_eq!(journal.replay_batch_size, 64);
        assert_eq!(journal.with_replay_batch_size(0).replay_batch_size, 1);
    }
}
