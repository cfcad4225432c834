//! Live configuration reload.
//!
//! The applied configuration is an `Arc<Config>` published on a watch channel;
//! consumers read the current snapshot and never see a half-applied update.
//! A candidate is diffed field by field against the applied snapshot and
//! swapped in only when every changed field is hot-reloadable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Config;
use crate::error::{Error, Result};

/// Fields (or whole sections) that can change without a restart.
const HOT_RELOADABLE: &[&str] = &[
    "workers.concurrency",
    "workers.call_timeout_ms",
    "rate",
    "retry",
    "recognizer.endpoint",
    "endpoints",
    "status.recent_failures",
];

/// One changed leaf, addressed by dotted path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

impl FieldChange {
    pub fn is_hot_reloadable(&self) -> bool {
        HOT_RELOADABLE.iter().any(|safe| {
            self.path == *safe
                || self
                    .path
                    .strip_prefix(safe)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// Structural difference between two configuration snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub changes: Vec<FieldChange>,
}

impl ConfigDiff {
    pub fn between(old: &Config, new: &Config) -> Result<Self> {
        let mut changes = Vec::new();
        diff_values("", &serde_json::to_value(old)?, &serde_json::to_value(new)?, &mut changes);
        Ok(Self { changes })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn unsafe_fields(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| !c.is_hot_reloadable())
            .map(|c| c.path.clone())
            .collect()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.path.as_str()).collect()
    }
}

fn diff_values(prefix: &str, old: &Value, new: &Value, out: &mut Vec<FieldChange>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                diff_values(
                    &path,
                    a.get(key).unwrap_or(&Value::Null),
                    b.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (a, b) if a != b => out.push(FieldChange {
            path: prefix.to_string(),
            old: a.clone(),
            new: b.clone(),
        }),
        _ => {}
    }
}

/// Owns the applied configuration and the file it came from.
pub struct ConfigReloader {
    path: PathBuf,
    current: watch::Sender<Arc<Config>>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, initial: Config) -> Self {
        let (current, _) = watch::channel(Arc::new(initial));
        Self {
            path: path.into(),
            current,
        }
    }

    /// Receiver that always yields the currently applied snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.borrow().clone()
    }

    /// Swap in `candidate` if it only touches hot-reloadable fields.
    ///
    /// On rejection the applied snapshot is left untouched.
    pub fn apply(&self, candidate: Config) -> Result<ConfigDiff> {
        let diff = ConfigDiff::between(&self.current(), &candidate)?;
        if diff.is_empty() {
            return Ok(diff);
        }

        let unsafe_fields = diff.unsafe_fields();
        if !unsafe_fields.is_empty() {
            return Err(Error::UnsafeReload {
                fields: unsafe_fields,
            });
        }

        self.current.send_replace(Arc::new(candidate));
        Ok(diff)
    }

    /// Load, validate and apply the file on disk.
    pub fn reload_from_disk(&self) -> Result<ConfigDiff> {
        let candidate = Config::load(&self.path)?;
        self.apply(candidate)
    }

    /// Watch the config file and apply changes until cancelled.
    ///
    /// Rejected reloads are logged and the previous snapshot stays active.
    pub async fn run(self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<()>(16);
        let poll_interval = self.current().watch.poll_interval();

        let _watcher = match self.watch_file(tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(path = %self.path.display(), "config watch unavailable, polling: {e}");
                None
            }
        };

        let mut last_modified = modified_at(&self.path);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("config reloader stopped");
                    return;
                }
                Some(()) = rx.recv() => {
                    // editors often write in several steps
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    while rx.try_recv().is_ok() {}
                }
                _ = ticker.tick() => {
                    let modified = modified_at(&self.path);
                    if modified == last_modified {
                        continue;
                    }
                }
            }

            last_modified = modified_at(&self.path);
            self.reload_and_log();
        }
    }

    fn reload_and_log(&self) {
        match self.reload_from_disk() {
            Ok(diff) if diff.is_empty() => debug!("config file touched, nothing changed"),
            Ok(diff) => info!(fields = ?diff.paths(), "configuration reloaded"),
            Err(Error::UnsafeReload { fields }) => {
                error!(?fields, "configuration reload rejected, restart required for these fields")
            }
            Err(e) => error!("configuration reload rejected: {e}"),
        }
    }

    fn watch_file(&self, tx: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let touches_config = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if touches_config && !event.kind.is_access() {
                    let _ = tx.try_send(());
                }
            }
        })?;

        // Watch the directory so replace-by-rename saves are seen too.
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

fn modified_at(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
