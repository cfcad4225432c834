//! Typed configuration.
//!
//! The TOML document is schema-checked before it is deserialized, so startup
//! fails fast with every violation listed. Secrets never live in the file:
//! each endpoint's credentials are read from the environment variable named by
//! its `credentials_env` (default `recognizer.credentials_env`) and wrapped in
//! `secrecy::SecretString`.

pub mod reload;
pub mod schema;
pub mod secrets;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Violations};
use crate::model::{FingerprintStrategy, IdentityStrategy};

pub use reload::{ConfigDiff, ConfigReloader, FieldChange};

/// Validated configuration snapshot. Never mutated after validation; a reload
/// replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub watch: WatchConfig,
    pub workers: WorkerConfig,
    pub rate: RateConfig,
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    pub recognizer: RecognizerConfig,
    /// Named recognizer endpoints, each with its own worker slots.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Name used for `recognizer.endpoint` when no `[endpoints]` are listed.
pub const DEFAULT_ENDPOINT: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub fingerprint: FingerprintStrategy,
    #[serde(default)]
    pub identity: IdentityStrategy,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Skip native filesystem events and only poll.
    #[serde(default)]
    pub force_polling: bool,
    /// Quiet period after a native event before the file is fingerprinted.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Full rescan interval while native events are in use.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum simultaneous recognizer calls.
    pub max_concurrent: usize,
    /// Optional rolling-window quota: calls per `window_ms`.
    #[serde(default)]
    pub max_calls_per_window: Option<u32>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling per processing cycle.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    /// Maximum records written per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delay before retrying a failed write.
    #[serde(default = "default_write_retry_ms")]
    pub write_retry_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Single endpoint, used when `[endpoints]` is empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the service credentials.
    pub credentials_env: String,
    /// Executable invoked once per file by the command adapter.
    #[serde(default)]
    pub command: Option<PathBuf>,
    /// Where successful results are written, one JSON file per item.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    /// Worker slots for this endpoint. Defaults to `workers.concurrency`.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Defaults to `recognizer.credentials_env`.
    #[serde(default)]
    pub credentials_env: Option<String>,
}

/// An endpoint with its defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    pub concurrency: usize,
    pub credentials_env: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Listen address of the status endpoint. None disables it.
    #[serde(default = "default_status_bind")]
    pub bind: Option<String>,
    #[serde(default = "default_recent_failures")]
    pub recent_failures: usize,
    #[serde(default)]
    pub run_summary_path: Option<PathBuf>,
    #[serde(default = "default_summary_interval_ms")]
    pub summary_interval_ms: u64,
}

fn default_extensions() -> Vec<String> {
    ["wav", "mp3", "flac", "ogg", "m4a"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_channel_capacity() -> usize {
    1_024
}
fn default_settle_ms() -> u64 {
    250
}
fn default_rescan_interval_ms() -> u64 {
    300_000
}
fn default_call_timeout_ms() -> u64 {
    600_000
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("batchkit.db")
}
fn default_batch_size() -> usize {
    64
}
fn default_write_retry_ms() -> u64 {
    500
}
fn default_status_bind() -> Option<String> {
    Some("127.0.0.1:8080".to_string())
}
fn default_recent_failures() -> usize {
    50
}
fn default_summary_interval_ms() -> u64 {
    30_000
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            batch_size: default_batch_size(),
            write_retry_ms: default_write_retry_ms(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: default_status_bind(),
            recent_failures: default_recent_failures(),
            run_summary_path: None,
            summary_interval_ms: default_summary_interval_ms(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document. All violations are reported at once.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let doc: toml::Table = text.parse().map_err(|e: toml::de::Error| {
            let mut v = Violations::default();
            v.push("<document>", e.message().to_string());
            Error::InvalidConfig(v)
        })?;

        let mut violations = schema::check_document(&doc);
        violations.extend(schema::check_constraints(&doc));
        violations.into_result()?;

        let config: Config = toml::Value::Table(doc).try_into().map_err(|e: toml::de::Error| {
            let mut v = Violations::default();
            v.push("<document>", e.message().to_string());
            Error::InvalidConfig(v)
        })?;

        Ok(config.normalized())
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Lower-case extensions without leading dots.
    fn normalized(mut self) -> Self {
        self.watch.extensions = self
            .watch
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    /// Endpoints to run slots against, ordered by name. Without an
    /// `[endpoints]` section, `recognizer.endpoint` runs as [`DEFAULT_ENDPOINT`].
    pub fn endpoint_specs(&self) -> Vec<EndpointSpec> {
        if self.endpoints.is_empty() {
            return self
                .recognizer
                .endpoint
                .iter()
                .map(|url| EndpointSpec {
                    name: DEFAULT_ENDPOINT.to_string(),
                    url: url.clone(),
                    concurrency: self.workers.concurrency,
                    credentials_env: self.recognizer.credentials_env.clone(),
                })
                .collect();
        }
        self.endpoints
            .iter()
            .map(|(name, ep)| EndpointSpec {
                name: name.clone(),
                url: ep.url.clone(),
                concurrency: ep.concurrency.unwrap_or(self.workers.concurrency),
                credentials_env: ep
                    .credentials_env
                    .clone()
                    .unwrap_or_else(|| self.recognizer.credentials_env.clone()),
            })
            .collect()
    }

    /// Total worker slots across all endpoints.
    pub fn total_slots(&self) -> usize {
        self.endpoint_specs().iter().map(|ep| ep.concurrency).sum()
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    /// Does `path` carry one of the accepted extensions?
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(ext))
            })
    }
}

impl WorkerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl RateConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, given `attempt` failed attempts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.backoff_max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Runtime settings that come from the process environment rather than the
/// config document.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    pub otel_endpoint: Option<String>,
}

impl EnvSettings {
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Self {
        Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        }
    }
}

pub(crate) fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
