//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use batchkit::config::Config;
use batchkit::db::Db;
use batchkit::engine::{DrainReport, Recovery, Scheduler};
use batchkit::error::Result;
use batchkit::model::{Fingerprint, FingerprintStrategy, Outcome};
use batchkit::ratelimit::{RateBudget, RateLimiter};
use batchkit::status::StatusSnapshot;
use batchkit::transcribe::{Endpoint, Transcriber};
use batchkit::watcher::Discovery;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Minimal valid document rooted at `root`.
pub fn config_toml(root: &Path) -> String {
    format!(
        r#"
[watch]
root = "{root}"
extensions = ["wav", "mp3"]
poll_interval_ms = 50

[workers]
concurrency = 3
call_timeout_ms = 5000

[rate]
max_concurrent = 2
acquire_timeout_ms = 1000

[retry]
max_attempts = 3
backoff_initial_ms = 10
backoff_max_ms = 40

[recognizer]
endpoint = "http://asr.local"
credentials_env = "BATCHKIT_TEST_CREDENTIALS"

[status]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    )
}

/// Credentials variable named by [`config_toml`].
pub const CREDENTIALS_ENV: &str = "BATCHKIT_TEST_CREDENTIALS";

fn set_test_credentials() {
    static SET: Once = Once::new();
    SET.call_once(|| unsafe {
        std::env::set_var(CREDENTIALS_ENV, "test-key");
    });
}

/// Scratch directory with an `inbox/` root and a checkpoint database.
pub struct Workspace {
    pub dir: TempDir,
    pub root: PathBuf,
    pub db_path: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        set_test_credentials();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("inbox");
        std::fs::create_dir_all(&root).unwrap();
        let db_path = dir.path().join("checkpoints.db");
        Self { dir, root, db_path }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::from_toml_str(&config_toml(&self.root)).unwrap();
        config.checkpoint.path = self.db_path.clone();
        config
    }

    pub async fn db(&self) -> Arc<Db> {
        Arc::new(Db::open_and_migrate(&self.db_path).await.unwrap())
    }

    /// Create `name` under the root with `content` and return its path.
    pub fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}

type Script = dyn Fn(&Path, u32) -> Outcome + Send + Sync;

/// Transcriber double: answers from a script and records concurrency.
pub struct Scripted {
    script: Box<Script>,
    delay: Duration,
    calls: Mutex<HashMap<PathBuf, u32>>,
    endpoint_calls: Mutex<HashMap<String, u32>>,
    /// Per endpoint URL, overrides `delay`.
    slow: Mutex<HashMap<String, Duration>>,
    active: Mutex<HashSet<PathBuf>>,
    concurrent: AtomicUsize,
    pub peak: AtomicUsize,
    pub total: AtomicUsize,
    /// Calls that started while the same file was already being processed.
    pub overlaps: AtomicUsize,
}

impl Scripted {
    /// `script(path, n)` decides the outcome of the n-th call (1-based) for `path`.
    pub fn new(
        delay: Duration,
        script: impl Fn(&Path, u32) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: Mutex::new(HashMap::new()),
            endpoint_calls: Mutex::new(HashMap::new()),
            slow: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
        })
    }

    pub fn succeeding(delay: Duration) -> Arc<Self> {
        Self::new(delay, |path, _| {
            Outcome::Success(serde_json::json!({ "text": path.display().to_string() }))
        })
    }

    pub fn calls_for(&self, path: &Path) -> u32 {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Calls made against the endpoint at `url`.
    pub fn calls_on(&self, url: &str) -> u32 {
        self.endpoint_calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Make calls against `url` take `delay`.
    pub fn slow_on(&self, url: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Marks a call finished even when it is aborted mid-flight.
struct ActiveCall<'a> {
    owner: &'a Scripted,
    path: PathBuf,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.owner.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.owner.active.lock().unwrap().remove(&self.path);
    }
}

#[async_trait]
impl Transcriber for Scripted {
    async fn transcribe(&self, endpoint: &Endpoint, path: &Path) -> Outcome {
        if !self.active.lock().unwrap().insert(path.to_path_buf()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        let active = ActiveCall {
            owner: self,
            path: path.to_path_buf(),
        };
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .endpoint_calls
            .lock()
            .unwrap()
            .entry(endpoint.url.clone())
            .or_default() += 1;
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(path.to_path_buf()).or_default();
            *n += 1;
            *n
        };

        let delay = self
            .slow
            .lock()
            .unwrap()
            .get(&endpoint.url)
            .copied()
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        drop(active);
        (self.script)(path, n)
    }
}

/// A running scheduler fed directly with discoveries.
pub struct Harness {
    pub config: watch::Sender<Arc<Config>>,
    pub status: watch::Receiver<StatusSnapshot>,
    pub limiter: Arc<RateLimiter>,
    pub recovery: Recovery,
    discoveries: mpsc::Sender<Discovery>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<DrainReport>>,
}

impl Harness {
    pub async fn start(config: Config, db: Arc<Db>, transcriber: Arc<dyn Transcriber>) -> Self {
        let limiter = RateLimiter::new(RateBudget::from(&config.rate));
        let (config_tx, config_rx) = watch::channel(Arc::new(config));
        let mut scheduler = Scheduler::new(config_rx, db, Arc::clone(&limiter), transcriber);
        let recovery = scheduler.recover().await.unwrap();
        let status = scheduler.status();

        let (discoveries, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(rx, shutdown.clone()));

        Self {
            config: config_tx,
            status,
            limiter,
            recovery,
            discoveries,
            shutdown,
            task,
        }
    }

    /// Announce `path` the way the watcher would.
    pub async fn discover(&self, path: &Path) {
        let fingerprint = Fingerprint::compute(FingerprintStrategy::Content, path).unwrap();
        self.discover_as(path, fingerprint).await;
    }

    pub async fn discover_as(&self, path: &Path, fingerprint: Fingerprint) {
        self.discoveries
            .send(Discovery {
                path: path.to_path_buf(),
                fingerprint,
                detected_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    /// Wait (up to 10s) until the published status satisfies `pred`.
    pub async fn wait_until(&mut self, pred: impl Fn(&StatusSnapshot) -> bool) -> StatusSnapshot {
        let snapshot = tokio::time::timeout(Duration::from_secs(10), self.status.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for scheduler status")
            .expect("scheduler stopped")
            .clone();
        snapshot
    }

    /// Drain and return the report.
    pub async fn stop(self) -> DrainReport {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("drain timed out")
            .unwrap()
            .unwrap()
    }

    /// Kill the scheduler task without draining, like a crashed process.
    pub async fn crash(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}
