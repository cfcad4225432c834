//! Directory watcher: turns files under the watched root into discovery events.
//!
//! An initial recursive scan is followed by native filesystem events. A path
//! named by an event is fingerprinted once it has been quiet for the settle
//! period, so a file still being copied is not picked up half-written. A full
//! rescan runs when the native backend reports that it dropped events, and on
//! a slow safety-net interval. If the native watcher cannot be created, or
//! reports an error, the watcher falls back to periodic scans. A path is
//! emitted again only when its fingerprint differs from the last one emitted
//! (or seeded from a checkpoint).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::error::Result;
use crate::model::Fingerprint;

/// A file that is new, or whose content changed, under the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub detected_at: DateTime<Utc>,
}

/// Modification time and length, checked before a file is hashed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

impl Stamp {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
        })
    }
}

/// Last fingerprint emitted for a path.
struct Seen {
    fingerprint: Fingerprint,
    /// None for seeded entries, which are hashed on the first scan.
    stamp: Option<Stamp>,
}

pub struct FileWatcher {
    config: WatchConfig,
    seen: HashMap<PathBuf, Seen>,
    /// Paths named by native events, with the time they become quiet.
    settling: HashMap<PathBuf, Instant>,
    tx: mpsc::Sender<Discovery>,
}

/// The receiving side went away or shutdown was requested.
struct Stopped;

impl FileWatcher {
    pub fn new(config: WatchConfig, tx: mpsc::Sender<Discovery>) -> Self {
        Self {
            config,
            seen: HashMap::new(),
            settling: HashMap::new(),
            tx,
        }
    }

    /// Mark files as already handled, typically from terminal checkpoints.
    pub fn seed(&mut self, processed: impl IntoIterator<Item = (PathBuf, Fingerprint)>) {
        self.seen.extend(processed.into_iter().map(|(path, fingerprint)| {
            (
                path,
                Seen {
                    fingerprint,
                    stamp: None,
                },
            )
        }));
    }

    /// Scan once, then follow changes until `shutdown` fires or the receiver
    /// is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let (event_tx, mut events) = mpsc::unbounded_channel();

        let mut native = if self.config.force_polling {
            None
        } else {
            match self.watch_native(event_tx) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(root = %self.config.root.display(), "native watch unavailable, polling: {e}");
                    None
                }
            }
        };
        info!(
            root = %self.config.root.display(),
            polling = native.is_none(),
            "file watcher started"
        );

        // Scan after the native watcher is registered so no file slips through.
        let root = self.config.root.clone();
        if self.scan(&root, true, &shutdown).await.is_err() {
            return Ok(());
        }

        let mut ticker = if native.is_some() {
            scan_ticker(self.config.rescan_interval()).await
        } else {
            scan_ticker(self.config.poll_interval()).await
        };

        loop {
            let next_settle = self.settling.values().min().copied();
            let step = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(res) = events.recv(), if native.is_some() => match res {
                    Ok(event) => self.handle_event(event, &shutdown).await,
                    Err(e) => {
                        warn!("native watch failed, falling back to polling: {e}");
                        native = None;
                        ticker = scan_ticker(self.config.poll_interval()).await;
                        self.scan(&root, true, &shutdown).await
                    }
                },
                _ = sleep_until_opt(next_settle), if next_settle.is_some() => {
                    self.settle_due(&shutdown).await
                }
                _ = ticker.tick() => self.scan(&root, true, &shutdown).await,
            };
            if step.is_err() {
                break;
            }
        }

        debug!("file watcher stopped");
        Ok(())
    }

    fn watch_native(
        &self,
        events: mpsc::UnboundedSender<notify::Result<notify::Event>>,
    ) -> Result<notify::RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = events.send(res);
        })?;
        watcher.watch(&self.config.root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    async fn handle_event(
        &mut self,
        event: notify::Event,
        shutdown: &CancellationToken,
    ) -> std::result::Result<(), Stopped> {
        if event.need_rescan() {
            // The backend dropped events; only a full scan is trustworthy.
            info!(root = %self.config.root.display(), "native events were dropped, rescanning");
            let root = self.config.root.clone();
            return self.scan(&root, true, shutdown).await;
        }
        match event.kind {
            EventKind::Access(_) => {}
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.seen.remove(path);
                    self.settling.remove(path);
                }
            }
            _ => {
                let quiet_at = Instant::now() + self.config.settle();
                for path in event.paths {
                    self.settling.insert(path, quiet_at);
                }
            }
        }
        Ok(())
    }

    /// Handle every settling path whose quiet period is over.
    async fn settle_due(&mut self, shutdown: &CancellationToken) -> std::result::Result<(), Stopped> {
        let now = Instant::now();
        let mut due: Vec<PathBuf> = self
            .settling
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort();

        for path in due {
            self.settling.remove(&path);
            if path.is_dir() {
                // Files moved in together with a new directory raise no
                // events of their own.
                self.scan(&path, false, shutdown).await?;
            } else if self.config.accepts(&path) {
                self.consider(path, true, shutdown).await?;
            }
        }
        Ok(())
    }

    /// Walk `dir` and consider every accepted file. A full scan also forgets
    /// paths that no longer exist.
    async fn scan(
        &mut self,
        dir: &Path,
        full: bool,
        shutdown: &CancellationToken,
    ) -> std::result::Result<(), Stopped> {
        let config = self.config.clone();
        let dir = dir.to_path_buf();
        let files = match tokio::task::spawn_blocking(move || collect_files(&dir, &config)).await
        {
            Ok(files) => files,
            Err(e) => {
                warn!("directory scan failed: {e}");
                return Ok(());
            }
        };

        if full {
            let present: HashSet<&PathBuf> = files.iter().collect();
            self.seen.retain(|p, _| present.contains(p));
        }
        for path in files {
            self.consider(path, false, shutdown).await?;
        }
        Ok(())
    }

    /// Fingerprint `path` and emit it if it is new or changed.
    ///
    /// Unless `force` is set, a file whose modification time and length match
    /// the last look is not hashed again.
    async fn consider(
        &mut self,
        path: PathBuf,
        force: bool,
        shutdown: &CancellationToken,
    ) -> std::result::Result<(), Stopped> {
        let known = if force {
            None
        } else {
            self.seen.get(&path).and_then(|seen| seen.stamp)
        };
        let strategy = self.config.fingerprint;
        let target = path.clone();
        let checked = tokio::task::spawn_blocking(move || -> Result<Option<(Stamp, Fingerprint)>> {
            let stamp = Stamp::of(&target)?;
            if known == Some(stamp) {
                return Ok(None);
            }
            Ok(Some((stamp, Fingerprint::compute(strategy, &target)?)))
        })
        .await;
        let (stamp, fingerprint) = match checked {
            Ok(Ok(Some(fresh))) => fresh,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                debug!(path = %path.display(), "skipping unreadable file: {e}");
                return Ok(());
            }
            Err(e) => {
                warn!(path = %path.display(), "fingerprint task failed: {e}");
                return Ok(());
            }
        };

        if let Some(seen) = self.seen.get_mut(&path) {
            if seen.fingerprint == fingerprint {
                seen.stamp = Some(stamp);
                return Ok(());
            }
        }
        self.seen.insert(
            path.clone(),
            Seen {
                fingerprint: fingerprint.clone(),
                stamp: Some(stamp),
            },
        );

        let discovery = Discovery {
            path,
            fingerprint,
            detected_at: Utc::now(),
        };
        debug!(path = %discovery.path.display(), fingerprint = %discovery.fingerprint, "discovered");

        // A full channel holds the watcher back instead of buffering without bound.
        tokio::select! {
            sent = self.tx.send(discovery) => sent.map_err(|_| Stopped),
            _ = shutdown.cancelled() => Err(Stopped),
        }
    }
}

/// Interval whose first tick is already consumed.
async fn scan_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    ticker
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn collect_files(dir: &Path, config: &WatchConfig) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                debug!("skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && config.accepts(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}
