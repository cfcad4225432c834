//! Work item types: identity, fingerprint, lifecycle state, outcome.
//!
//! A work item is one input file. Its identity is derived from the path
//! relative to the watched root, so the same file keeps the same identity
//! across restarts.

use std::fmt;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable key of a work item. Exactly-once dispatch is enforced per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    /// Derive the identity of `path` (under `root`) with the given strategy.
    pub fn derive(
        strategy: IdentityStrategy,
        root: &Path,
        path: &Path,
        fingerprint: &Fingerprint,
    ) -> Self {
        let relative = relative_key(root, path);
        match strategy {
            IdentityStrategy::Path => Self(relative),
            IdentityStrategy::PathAndContent => Self(format!("{relative}#{fingerprint}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendering, used to name per-item output files.
    pub fn slug(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `/`-separated path relative to the watched root. Paths outside the root
/// keep their full form.
fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// How identities are derived from discovered files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// One identity per path. A changed fingerprint re-processes the same item.
    #[default]
    Path,
    /// One identity per (path, content). An edited file becomes a new item.
    PathAndContent,
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Detects whether a file changed since it was last processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintStrategy {
    /// SHA-256 of the file bytes.
    #[default]
    Content,
    /// Modification time and size. Cheap, but blind to same-size rewrites
    /// within the timestamp resolution.
    Mtime,
}

impl Fingerprint {
    /// Compute a fingerprint for `path`. Blocking; call from `spawn_blocking`.
    pub fn compute(strategy: FingerprintStrategy, path: &Path) -> Result<Self> {
        match strategy {
            FingerprintStrategy::Content => {
                let mut file = std::fs::File::open(path)?;
                let mut hasher = Sha256::new();
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(Self(format!("sha256:{:x}", hasher.finalize())))
            }
            FingerprintStrategy::Mtime => {
                let meta = std::fs::metadata(path)?;
                let modified: DateTime<Utc> = meta.modified()?.into();
                Ok(Self(format!(
                    "mtime:{}:{}",
                    modified.timestamp_nanos_opt().unwrap_or_default(),
                    meta.len()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Seen by the watcher, not yet admitted to the queue.
    Discovered,
    /// Waiting for a free slot and a rate token.
    Queued,
    /// Held by exactly one worker slot.
    InProgress,
    /// Done. Terminal.
    Succeeded,
    /// Last attempt failed transiently; waiting out the backoff.
    FailedRetryable,
    /// Permanent failure or retries exhausted. Terminal.
    FailedTerminal,
}

impl State {
    pub const ALL: [State; 6] = [
        State::Discovered,
        State::Queued,
        State::InProgress,
        State::Succeeded,
        State::FailedRetryable,
        State::FailedTerminal,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Discovered, Queued)
                | (Queued, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, FailedRetryable)
                | (InProgress, FailedTerminal)
                | (FailedRetryable, Queued)
                | (FailedRetryable, FailedTerminal)
                // re-processing after the file changed
                | (Succeeded, Queued)
                | (FailedTerminal, Queued)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::FailedTerminal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Discovered => "discovered",
            State::Queued => "queued",
            State::InProgress => "in_progress",
            State::Succeeded => "succeeded",
            State::FailedRetryable => "failed_retryable",
            State::FailedTerminal => "failed_terminal",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown state: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// One input file and where it is in its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub identity: Identity,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub state: State,

    /// Number of recognizer calls started for the current processing cycle.
    pub attempt_count: u32,
    pub last_error: Option<String>,

    /// Content seen while a call was running on the older one. Adopted the
    /// next time the item is queued.
    pub pending_fingerprint: Option<Fingerprint>,
    /// Set once this cycle has had a crashed attempt refunded.
    pub orphan_refunded: bool,

    pub enqueued_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn discovered(identity: Identity, path: PathBuf, fingerprint: Fingerprint) -> Self {
        Self {
            identity,
            path,
            fingerprint,
            state: State::Discovered,
            attempt_count: 0,
            last_error: None,
            pending_fingerprint: None,
            orphan_refunded: false,
            enqueued_at: None,
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Apply a validated state transition and its bookkeeping.
    ///
    /// Entering `InProgress` counts an attempt. Re-queueing a terminal item
    /// starts a fresh cycle. Any queueing adopts a pending fingerprint.
    pub fn transition(&mut self, to: State) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let now = Utc::now();
        match to {
            State::Queued => {
                if from.is_terminal() {
                    self.attempt_count = 0;
                    self.last_error = None;
                    self.completed_at = None;
                    self.orphan_refunded = false;
                }
                if let Some(fingerprint) = self.pending_fingerprint.take() {
                    self.fingerprint = fingerprint;
                }
                self.enqueued_at = Some(now);
            }
            State::InProgress => self.attempt_count += 1,
            State::Succeeded | State::FailedTerminal => self.completed_at = Some(now),
            State::Discovered | State::FailedRetryable => {}
        }

        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record content that changed underneath a running or backed-off
    /// attempt. Returns false if the content is already the one in use.
    pub fn defer_fingerprint(&mut self, fingerprint: Fingerprint) -> bool {
        let latest = self.pending_fingerprint.as_ref().unwrap_or(&self.fingerprint);
        if *latest == fingerprint {
            return false;
        }
        self.pending_fingerprint = (fingerprint != self.fingerprint).then_some(fingerprint);
        self.updated_at = Utc::now();
        true
    }

    /// Latest content seen for this item, pending or adopted.
    pub fn latest_fingerprint(&self) -> &Fingerprint {
        self.pending_fingerprint.as_ref().unwrap_or(&self.fingerprint)
    }

    /// Re-queue an item a crash left `InProgress`.
    ///
    /// The first crash in a cycle is refunded. Later ones count, so a file
    /// that keeps killing the process still runs out of attempts.
    pub fn recover_orphan(&mut self) -> Result<()> {
        let refund = !self.orphan_refunded;
        self.requeue_in_progress(refund)?;
        self.orphan_refunded = true;
        Ok(())
    }

    /// Re-queue an attempt the process cancelled on purpose. Always refunded.
    pub fn cancel_attempt(&mut self) -> Result<()> {
        self.requeue_in_progress(true)
    }

    fn requeue_in_progress(&mut self, refund: bool) -> Result<()> {
        if self.state != State::InProgress {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: State::Queued,
            });
        }
        let now = Utc::now();
        if refund {
            self.attempt_count = self.attempt_count.saturating_sub(1);
        }
        if let Some(fingerprint) = self.pending_fingerprint.take() {
            self.fingerprint = fingerprint;
        }
        self.state = State::Queued;
        self.enqueued_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Three-way result of one recognizer call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// Recognition result. Opaque to the scheduler.
    Success(serde_json::Value),
    /// Timeout, throttling, network trouble. Worth another attempt.
    Retryable(String),
    /// Malformed input or explicit rejection. Never retried.
    Terminal(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Retryable(_) => "retryable",
            Outcome::Terminal(_) => "terminal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::discovered(
            Identity("a.wav".into()),
            PathBuf::from("/in/a.wav"),
            Fingerprint("sha256:00".into()),
        )
    }

    #[test]
    fn identity_is_relative_to_root() {
        let fp = Fingerprint("sha256:ab".into());
        let id = Identity::derive(
            IdentityStrategy::Path,
            Path::new("/data/in"),
            Path::new("/data/in/day1/a.wav"),
            &fp,
        );
        assert_eq!(id.as_str(), "day1/a.wav");

        let id = Identity::derive(
            IdentityStrategy::PathAndContent,
            Path::new("/data/in"),
            Path::new("/data/in/day1/a.wav"),
            &fp,
        );
        assert_eq!(id.as_str(), "day1/a.wav#sha256:ab");
        assert_eq!(id.slug(), "day1_a.wav_sha256_ab");
    }

    #[test]
    fn lifecycle_counts_attempts() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        assert!(w.enqueued_at.is_some());
        w.transition(State::InProgress).unwrap();
        w.transition(State::FailedRetryable).unwrap();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();
        assert_eq!(w.attempt_count, 2);
        w.transition(State::Succeeded).unwrap();
        assert!(w.completed_at.is_some());
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut w = item();
        let err = w.transition(State::InProgress).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: State::Discovered,
                to: State::InProgress
            }
        ));
        assert_eq!(w.state, State::Discovered);
        assert!(!State::InProgress.can_transition_to(State::InProgress));
        assert!(!State::Succeeded.can_transition_to(State::InProgress));
    }

    #[test]
    fn orphan_recovery_refunds_the_interrupted_attempt() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();
        w.transition(State::FailedRetryable).unwrap();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();
        assert_eq!(w.attempt_count, 2);

        w.recover_orphan().unwrap();
        assert_eq!(w.state, State::Queued);
        assert_eq!(w.attempt_count, 1);
        assert!(w.recover_orphan().is_err());
    }

    #[test]
    fn only_the_first_crash_in_a_cycle_is_refunded() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();
        w.recover_orphan().unwrap();
        assert_eq!(w.attempt_count, 0);

        w.transition(State::InProgress).unwrap();
        w.recover_orphan().unwrap();
        assert_eq!(w.attempt_count, 1);
        w.transition(State::InProgress).unwrap();
        w.recover_orphan().unwrap();
        assert_eq!(w.attempt_count, 2);

        // a new cycle earns a fresh refund
        w.transition(State::InProgress).unwrap();
        w.transition(State::Succeeded).unwrap();
        w.transition(State::Queued).unwrap();
        assert!(!w.orphan_refunded);
        w.transition(State::InProgress).unwrap();
        w.recover_orphan().unwrap();
        assert_eq!(w.attempt_count, 0);
    }

    #[test]
    fn cancelled_attempts_are_always_refunded() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        for _ in 0..3 {
            w.transition(State::InProgress).unwrap();
            w.cancel_attempt().unwrap();
        }
        assert_eq!(w.attempt_count, 0);
        assert_eq!(w.state, State::Queued);
    }

    #[test]
    fn content_seen_mid_attempt_is_adopted_on_requeue() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();

        assert!(w.defer_fingerprint(Fingerprint("sha256:01".into())));
        assert!(!w.defer_fingerprint(Fingerprint("sha256:01".into())));
        assert_eq!(w.fingerprint, Fingerprint("sha256:00".into()));
        assert_eq!(w.latest_fingerprint(), &Fingerprint("sha256:01".into()));

        w.transition(State::FailedRetryable).unwrap();
        w.transition(State::Queued).unwrap();
        assert_eq!(w.fingerprint, Fingerprint("sha256:01".into()));
        assert!(w.pending_fingerprint.is_none());
    }

    #[test]
    fn reverting_to_the_dispatched_content_clears_the_pending_one() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();
        assert!(w.defer_fingerprint(Fingerprint("sha256:01".into())));
        assert!(w.defer_fingerprint(Fingerprint("sha256:00".into())));
        assert!(w.pending_fingerprint.is_none());
    }

    #[test]
    fn requeue_after_terminal_resets_cycle() {
        let mut w = item();
        w.transition(State::Queued).unwrap();
        w.transition(State::InProgress).unwrap();
        w.last_error = Some("bad header".into());
        w.transition(State::FailedTerminal).unwrap();

        w.transition(State::Queued).unwrap();
        assert_eq!(w.attempt_count, 0);
        assert!(w.last_error.is_none());
        assert!(w.completed_at.is_none());
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("running".parse::<State>().is_err());
    }

    #[test]
    fn content_fingerprint_tracks_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        std::fs::write(&path, b"one").unwrap();
        let first = Fingerprint::compute(FingerprintStrategy::Content, &path).unwrap();
        assert_eq!(
            first,
            Fingerprint::compute(FingerprintStrategy::Content, &path).unwrap()
        );
        std::fs::write(&path, b"two").unwrap();
        let second = Fingerprint::compute(FingerprintStrategy::Content, &path).unwrap();
        assert_ne!(first, second);
        assert!(second.0.starts_with("sha256:"));
    }
}
