//! Recognition capability: `Transcribe(endpoint, file) -> Outcome`.
//!
//! The scheduler only sees the [`Transcriber`] trait. [`CommandTranscriber`]
//! is the shipped adapter: it runs an operator-provided executable per file
//! and maps its exit status onto the three-way outcome. Every call names the
//! [`Endpoint`] whose worker slot made it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{Config, EndpointSpec, RecognizerConfig, required_var};
use crate::error::Result;
use crate::model::Outcome;

/// Exit status meaning "temporary failure, try again later" (sysexits EX_TEMPFAIL).
pub const EXIT_TEMPFAIL: i32 = 75;

/// A named recognizer endpoint with its credentials read from the environment.
#[derive(Debug)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    credentials: SecretString,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>, credentials: SecretString) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            credentials,
        }
    }

    /// Read the credentials `spec` names. Fails if the variable is unset.
    pub fn resolve(spec: &EndpointSpec) -> Result<Self> {
        let credentials = SecretString::from(required_var(&spec.credentials_env)?);
        Ok(Self::new(spec.name.clone(), spec.url.clone(), credentials))
    }

    pub fn credentials(&self) -> &SecretString {
        &self.credentials
    }

    /// Same name, URL and credentials. Anything else needs fresh slots.
    pub fn same_target(&self, other: &Endpoint) -> bool {
        self.name == other.name
            && self.url == other.url
            && self.credentials.expose_secret() == other.credentials.expose_secret()
    }
}

/// Resolve every configured endpoint with its slot count.
pub fn resolve_endpoints(config: &Config) -> Result<Vec<(Arc<Endpoint>, usize)>> {
    config
        .endpoint_specs()
        .iter()
        .map(|spec| Ok((Arc::new(Endpoint::resolve(spec)?), spec.concurrency)))
        .collect()
}

/// Anything that can turn an audio file into a recognition outcome.
///
/// Implementations must not panic on bad input; a panic is still caught by
/// the worker slot and counted as a retryable failure.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, endpoint: &Endpoint, path: &Path) -> Outcome;
}

/// Runs `command <file>` and reads the result from stdout.
///
/// The endpoint is passed as `BATCHKIT_ENDPOINT` and `BATCHKIT_ENDPOINT_NAME`,
/// its credentials as `BATCHKIT_CREDENTIALS`. Exit 0 is success (stdout parsed
/// as JSON, or kept as a string), exit 75 is retryable, any other exit is
/// terminal.
pub struct CommandTranscriber {
    command: PathBuf,
}

impl CommandTranscriber {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }

    /// Build the adapter from the recognizer section. Returns `None` when no
    /// command is configured.
    pub fn from_config(config: &RecognizerConfig) -> Result<Option<Self>> {
        let Some(command) = &config.command else {
            return Ok(None);
        };
        // Resolve relative commands against the process CWD.
        let command = if command.is_relative() {
            std::env::current_dir()?.join(command)
        } else {
            command.clone()
        };
        Ok(Some(Self::new(command)))
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, endpoint: &Endpoint, path: &Path) -> Outcome {
        if !path.is_file() {
            return Outcome::Terminal(format!("input file missing: {}", path.display()));
        }

        let start = Instant::now();
        debug!(
            command = %self.command.display(),
            endpoint = %endpoint.name,
            file = %path.display(),
            "running recognizer"
        );

        // kill_on_drop: a cancelled call must not leave the process running.
        let output = Command::new(&self.command)
            .arg(path)
            .env("BATCHKIT_ENDPOINT", &endpoint.url)
            .env("BATCHKIT_ENDPOINT_NAME", &endpoint.name)
            .env("BATCHKIT_CREDENTIALS", endpoint.credentials.expose_secret())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                warn!(command = %self.command.display(), "recognizer failed to start: {e}");
                return Outcome::Retryable(format!("recognizer failed to start: {e}"));
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let result = serde_json::from_str(stdout.trim())
                    .unwrap_or_else(|_| serde_json::Value::String(stdout.trim().to_string()));
                debug!(file = %path.display(), duration_ms, "recognizer succeeded");
                Outcome::Success(result)
            }
            Some(EXIT_TEMPFAIL) => Outcome::Retryable(failure_reason(EXIT_TEMPFAIL, stderr)),
            // killed by a signal
            None => Outcome::Retryable(failure_reason(-1, stderr)),
            Some(code) => Outcome::Terminal(failure_reason(code, stderr)),
        }
    }
}

fn failure_reason(code: i32, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("recognizer exited with status {code}")
    } else {
        format!("recognizer exited with status {code}: {stderr}")
    }
}
