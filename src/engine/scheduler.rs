//! The scheduler: sole owner of work item state.
//!
//! One task runs [`Scheduler::run`]. Discoveries, worker reports, retry
//! timers, rate-token grants, checkpoint acknowledgements and config changes
//! all arrive as events on that task, so every decision sees a consistent
//! table and at most one slot ever holds an identity.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::{Assignment, SlotId, WorkerPool, WorkerReport};
use crate::checkpoint::{CheckpointHandle, CheckpointStore, CheckpointWriter, Persisted};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{CheckpointRecord, Fingerprint, Identity, Outcome, State, WorkItem};
use crate::ratelimit::{RateBudget, RateLimiter, RatePermit};
use crate::status::{EndpointStatus, FailureEntry, InFlightEntry, StatusSnapshot};
use crate::telemetry::metrics;
use crate::telemetry::work::record_state_transition;
use crate::transcribe::{Endpoint, Transcriber, resolve_endpoints};
use crate::watcher::Discovery;

type Acquisition = Pin<Box<dyn Future<Output = Result<RatePermit>> + Send>>;

struct InFlight {
    slot: SlotId,
    attempt: u32,
    started_at: DateTime<Utc>,
}

/// What startup reconciliation found in the checkpoint store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Non-terminal records put back on the queue.
    pub requeued: usize,
    /// Records a crash left `InProgress` and that were re-queued; included in
    /// `requeued`.
    pub orphans: usize,
    /// Records already terminal, kept for de-duplication.
    pub terminal: usize,
    /// Records that had used up their attempts and were failed on load,
    /// including repeat crash victims.
    pub exhausted: usize,
}

/// State of the table after a drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub counts: BTreeMap<State, u64>,
    /// Items left `Queued`; picked up again on the next start.
    pub queued: usize,
    /// Items left waiting out a retry backoff.
    pub awaiting_retry: usize,
    /// Records that could not be confirmed durable.
    pub unsaved: usize,
}

pub struct Scheduler {
    config: watch::Receiver<Arc<Config>>,
    store: Arc<dyn CheckpointStore>,
    limiter: Arc<RateLimiter>,
    transcriber: Arc<dyn Transcriber>,
    checkpoints: CheckpointHandle,
    run_id: Uuid,
    started_at: DateTime<Utc>,

    items: HashMap<Identity, WorkItem>,
    counts: BTreeMap<State, u64>,
    queue: VecDeque<Identity>,
    in_flight: HashMap<Identity, InFlight>,
    retries: BinaryHeap<Reverse<(Instant, Identity)>>,
    failures: VecDeque<FailureEntry>,
    /// Identity -> sequence number of its latest record not yet acknowledged.
    unsaved: HashMap<Identity, u64>,

    status: watch::Sender<StatusSnapshot>,
    draining: bool,
}

impl Scheduler {
    /// Create the scheduler and start its checkpoint writer.
    pub fn new(
        config: watch::Receiver<Arc<Config>>,
        store: Arc<dyn CheckpointStore>,
        limiter: Arc<RateLimiter>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        let cfg = config.borrow().clone();
        let checkpoints = CheckpointWriter::spawn(
            Arc::clone(&store),
            cfg.checkpoint.batch_size,
            Duration::from_millis(cfg.checkpoint.write_retry_ms),
        );
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let (status, _) = watch::channel(StatusSnapshot {
            run_id,
            started_at: Some(started_at),
            ..Default::default()
        });

        Self {
            config,
            store,
            limiter,
            transcriber,
            checkpoints,
            run_id,
            started_at,
            items: HashMap::new(),
            counts: State::ALL.into_iter().map(|s| (s, 0)).collect(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            retries: BinaryHeap::new(),
            failures: VecDeque::new(),
            unsaved: HashMap::new(),
            status,
            draining: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Receiver for the snapshots published after every decision.
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Path and fingerprint of every terminal item, for seeding the watcher.
    /// Content that changed mid-attempt is left out so it gets rediscovered.
    pub fn processed_files(&self) -> Vec<(PathBuf, Fingerprint)> {
        self.items
            .values()
            .filter(|item| item.is_terminal() && item.pending_fingerprint.is_none())
            .map(|item| (item.path.clone(), item.fingerprint.clone()))
            .collect()
    }

    fn policy(&self) -> Arc<Config> {
        self.config.borrow().clone()
    }

    /// Load every checkpoint and re-queue whatever was not finished.
    pub async fn recover(&mut self) -> Result<Recovery> {
        let records = self.store.list(None).await?;
        let max_attempts = self.policy().retry.max_attempts;
        let mut recovery = Recovery::default();

        let mut unfinished = Vec::new();
        let mut failed = Vec::new();
        for record in records {
            let item = record.into_item();
            *self.counts.entry(item.state).or_default() += 1;
            match item.state {
                // finished, but the file changed during that last cycle
                _ if item.is_terminal() && item.pending_fingerprint.is_some() => {
                    unfinished.push((item.enqueued_at, item.identity.clone()));
                }
                State::Succeeded => recovery.terminal += 1,
                State::FailedTerminal => {
                    recovery.terminal += 1;
                    failed.push(failure_entry(&item));
                }
                _ => unfinished.push((item.enqueued_at, item.identity.clone())),
            }
            self.items.insert(item.identity.clone(), item);
        }

        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        failed.truncate(self.policy().status.recent_failures);
        self.failures.extend(failed);

        // Oldest first, so recovery keeps roughly the original order.
        unfinished.sort();
        for (_, identity) in unfinished {
            let (state, attempts, refunded) = match self.items.get(&identity) {
                Some(item) => (item.state, item.attempt_count, item.orphan_refunded),
                None => continue,
            };
            match state {
                // A second crash in the same cycle is not refunded.
                State::InProgress if refunded && attempts >= max_attempts => {
                    let reason = self.last_error(&identity, "attempt interrupted by a crash");
                    self.fail_terminal(&identity, reason)?;
                    recovery.exhausted += 1;
                    continue;
                }
                State::InProgress => {
                    self.recover_orphan(&identity)?;
                    recovery.orphans += 1;
                }
                State::FailedRetryable if attempts >= max_attempts => {
                    let reason = self.last_error(&identity, "retry ceiling reached");
                    self.fail_terminal(&identity, reason)?;
                    recovery.exhausted += 1;
                    continue;
                }
                State::Discovered
                | State::FailedRetryable
                | State::Succeeded
                | State::FailedTerminal => {
                    self.set_state(&identity, State::Queued)?;
                }
                State::Queued => {}
            }
            self.queue.push_back(identity);
            recovery.requeued += 1;
        }

        info!(
            requeued = recovery.requeued,
            orphans = recovery.orphans,
            terminal = recovery.terminal,
            exhausted = recovery.exhausted,
            "checkpoint recovery complete"
        );
        self.publish(&[]);
        Ok(recovery)
    }

    /// Process events until `shutdown` fires, then drain.
    ///
    /// Draining stops discovery, retries and dispatch, waits for every busy
    /// slot to report, and flushes the checkpoint writer.
    pub async fn run(
        mut self,
        mut discoveries: mpsc::Receiver<Discovery>,
        shutdown: CancellationToken,
    ) -> Result<DrainReport> {
        let cfg = self.policy();
        let (report_tx, mut reports) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(
            Arc::clone(&self.transcriber),
            cfg.workers.call_timeout(),
            cfg.recognizer.output_dir.clone(),
            report_tx,
        );
        pool.configure(resolve_endpoints(&cfg)?);
        self.limiter.set_budget(RateBudget::from(&cfg.rate));

        let mut config_rx = self.config.clone();
        config_rx.borrow_and_update();

        let mut acquiring: Option<Acquisition> = None;
        let mut acquire_failures: u32 = 0;
        let mut hold_dispatch_until: Option<Instant> = None;
        let mut discoveries_open = true;

        info!(
            run_id = %self.run_id,
            workers = pool.size(),
            endpoints = pool.status().len(),
            queued = self.queue.len(),
            "scheduler started"
        );
        self.publish(&pool.status());

        loop {
            if self.draining {
                if pool.busy() == 0 {
                    break;
                }
            } else if acquiring.is_none()
                && hold_dispatch_until.is_none()
                && pool.has_free_slot()
                && !self.queue.is_empty()
            {
                // The head stays Queued until a token is granted.
                let limiter = Arc::clone(&self.limiter);
                acquiring = Some(Box::pin(async move { limiter.acquire().await }));
            }

            let next_retry = self.retries.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                _ = shutdown.cancelled(), if !self.draining => {
                    info!(in_flight = pool.busy(), queued = self.queue.len(), "draining");
                    self.draining = true;
                    acquiring = None;
                }
                Some(report) = reports.recv() => {
                    pool.release(&report.slot);
                    self.on_report(report)?;
                }
                discovery = discoveries.recv(), if discoveries_open && !self.draining => {
                    match discovery {
                        Some(d) => self.on_discovery(d)?,
                        None => {
                            debug!("discovery channel closed");
                            discoveries_open = false;
                        }
                    }
                }
                _ = sleep_until_opt(next_retry), if next_retry.is_some() && !self.draining => {
                    self.on_retries_due(Instant::now())?;
                }
                _ = sleep_until_opt(hold_dispatch_until), if hold_dispatch_until.is_some() && !self.draining => {
                    hold_dispatch_until = None;
                }
                granted = wait_for(&mut acquiring), if acquiring.is_some() => {
                    acquiring = None;
                    match granted {
                        Ok(permit) => {
                            acquire_failures = 0;
                            self.dispatch_head(&mut pool, permit)?;
                        }
                        Err(e) if e.is_retryable() => {
                            acquire_failures += 1;
                            let delay = self.policy().retry.backoff(acquire_failures);
                            warn!(
                                failures = acquire_failures,
                                "no rate token, holding dispatch for {delay:?}: {e}"
                            );
                            hold_dispatch_until = Some(Instant::now() + delay);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(ack) = self.checkpoints.next_ack() => self.on_ack(ack),
                Ok(()) = config_rx.changed() => {
                    let cfg = config_rx.borrow_and_update().clone();
                    self.apply_policy(&cfg, &mut pool)?;
                }
            }

            self.publish(&pool.status());
        }

        drop(acquiring);
        for ack in self.checkpoints.flush().await {
            self.on_ack(ack);
        }
        self.publish(&pool.status());

        let report = DrainReport {
            counts: self.counts.clone(),
            queued: self.queue.len(),
            awaiting_retry: self
                .items
                .values()
                .filter(|i| i.state == State::FailedRetryable)
                .count(),
            unsaved: self.unsaved.len(),
        };
        info!(
            queued = report.queued,
            awaiting_retry = report.awaiting_retry,
            unsaved = report.unsaved,
            "scheduler drained"
        );
        Ok(report)
    }

    fn on_discovery(&mut self, discovery: Discovery) -> Result<()> {
        let policy = self.policy();
        let Discovery {
            path, fingerprint, ..
        } = discovery;
        let identity = Identity::derive(
            policy.watch.identity,
            &policy.watch.root,
            &path,
            &fingerprint,
        );

        if !self.items.contains_key(&identity) {
            debug!(%identity, "new file");
            self.items.insert(
                identity.clone(),
                WorkItem::discovered(identity.clone(), path, fingerprint),
            );
            *self.counts.entry(State::Discovered).or_default() += 1;
            metrics::work_discovered().add(1, &[KeyValue::new("result", "new")]);
            self.set_state(&identity, State::Queued)?;
            self.queue.push_back(identity);
            return Ok(());
        }

        let item = self
            .items
            .get_mut(&identity)
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;
        if *item.latest_fingerprint() == fingerprint {
            return Ok(());
        }
        let state = item.state;
        item.path = path;

        match state {
            State::Succeeded | State::FailedTerminal => {
                item.fingerprint = fingerprint;
                info!(%identity, previous = %state, "file changed, processing again");
                metrics::work_discovered().add(1, &[KeyValue::new("result", "changed")]);
                self.set_state(&identity, State::Queued)?;
                self.queue.push_back(identity);
            }
            // Not started yet: the new content is what will be processed.
            State::Queued | State::Discovered => {
                item.fingerprint = fingerprint;
                self.persist(&identity)?;
            }
            // The running attempt used the old content. The new one is picked
            // up when the item is next queued, or right after it finishes.
            State::InProgress | State::FailedRetryable => {
                item.defer_fingerprint(fingerprint);
                debug!(%identity, %state, "file changed while active, will process the new content");
                self.persist(&identity)?;
            }
        }
        Ok(())
    }

    fn dispatch_head(&mut self, pool: &mut WorkerPool, permit: RatePermit) -> Result<()> {
        if !pool.has_free_slot() {
            // The pool shrank while the token was on its way.
            return Ok(());
        }

        while let Some(identity) = self.queue.pop_front() {
            let queued = self
                .items
                .get(&identity)
                .is_some_and(|item| item.state == State::Queued);
            if !queued || self.in_flight.contains_key(&identity) {
                warn!(%identity, "skipping stale queue entry");
                continue;
            }

            self.set_state(&identity, State::InProgress)?;
            let (path, attempt) = match self.items.get(&identity) {
                Some(item) => (item.path.clone(), item.attempt_count),
                None => continue,
            };
            let slot = pool.dispatch(Assignment {
                identity: identity.clone(),
                path,
                attempt,
                permit,
            })?;
            debug!(%identity, %slot, attempt, "dispatched");
            self.in_flight.insert(
                identity,
                InFlight {
                    slot,
                    attempt,
                    started_at: Utc::now(),
                },
            );
            return Ok(());
        }
        Ok(())
    }

    fn on_report(&mut self, report: WorkerReport) -> Result<()> {
        let WorkerReport {
            identity,
            attempt,
            slot,
            outcome,
            elapsed,
        } = report;
        match self.in_flight.get(&identity) {
            Some(current) if current.slot == slot => {
                self.in_flight.remove(&identity);
            }
            // A slot cancelled by an endpoint change; its item was re-queued.
            _ => {
                debug!(%identity, %slot, attempt, "ignoring report from a stale slot");
                return Ok(());
            }
        }
        let elapsed_ms = elapsed.as_millis() as u64;

        match outcome {
            Outcome::Success(_) => {
                self.set_state(&identity, State::Succeeded)?;
                info!(%identity, attempt, elapsed_ms, "transcribed");
                self.requeue_if_changed(&identity)?;
            }
            Outcome::Terminal(reason) => self.fail_terminal(&identity, reason)?,
            Outcome::Retryable(reason) => {
                let retry = self.policy().retry.clone();
                let attempts = self
                    .items
                    .get(&identity)
                    .map_or(attempt, |item| item.attempt_count);
                if attempts >= retry.max_attempts {
                    self.fail_terminal(&identity, reason)?;
                } else {
                    let delay = retry.backoff(attempts);
                    warn!(%identity, attempt, elapsed_ms, ?delay, %reason, "attempt failed, will retry");
                    self.set_last_error(&identity, reason);
                    self.set_state(&identity, State::FailedRetryable)?;
                    self.retries.push(Reverse((Instant::now() + delay, identity)));
                }
            }
        }
        Ok(())
    }

    fn on_retries_due(&mut self, now: Instant) -> Result<()> {
        let max_attempts = self.policy().retry.max_attempts;
        loop {
            let due = matches!(self.retries.peek(), Some(Reverse((at, _))) if *at <= now);
            if !due {
                return Ok(());
            }
            let Some(Reverse((_, identity))) = self.retries.pop() else {
                return Ok(());
            };
            let Some(item) = self.items.get(&identity) else {
                continue;
            };
            if item.state != State::FailedRetryable {
                continue;
            }
            // The ceiling may have been lowered by a reload.
            if item.attempt_count >= max_attempts {
                let reason = self.last_error(&identity, "retry ceiling reached");
                self.fail_terminal(&identity, reason)?;
            } else {
                self.set_state(&identity, State::Queued)?;
                self.queue.push_back(identity);
            }
        }
    }

    fn on_ack(&mut self, ack: Persisted) {
        if self
            .unsaved
            .get(&ack.identity)
            .is_some_and(|&seq| seq <= ack.seq)
        {
            self.unsaved.remove(&ack.identity);
        }
    }

    fn apply_policy(&mut self, cfg: &Config, pool: &mut WorkerPool) -> Result<()> {
        let plan = self.endpoint_plan(cfg, pool);
        let cancelled = pool.configure(plan);
        pool.set_call_timeout(cfg.workers.call_timeout());
        self.limiter.set_budget(RateBudget::from(&cfg.rate));
        self.failures.truncate(cfg.status.recent_failures);

        for slot in cancelled {
            let Some(identity) = self
                .in_flight
                .iter()
                .find(|(_, f)| f.slot == slot)
                .map(|(identity, _)| identity.clone())
            else {
                continue;
            };
            self.in_flight.remove(&identity);
            self.cancel_attempt(&identity)?;
            self.queue.push_front(identity);
        }

        info!(
            workers = pool.size(),
            endpoints = pool.status().len(),
            max_concurrent = cfg.rate.max_concurrent,
            max_attempts = cfg.retry.max_attempts,
            "scheduling policy updated"
        );
        Ok(())
    }

    /// Endpoints for `cfg`. One whose credentials cannot be read keeps its
    /// current target, or is left out if it is new.
    fn endpoint_plan(&self, cfg: &Config, pool: &WorkerPool) -> Vec<(Arc<Endpoint>, usize)> {
        cfg.endpoint_specs()
            .iter()
            .filter_map(|spec| match Endpoint::resolve(spec) {
                Ok(endpoint) => Some((Arc::new(endpoint), spec.concurrency)),
                Err(e) => {
                    error!(endpoint = %spec.name, "cannot apply endpoint change: {e}");
                    pool.endpoint(&spec.name).map(|current| (current, spec.concurrency))
                }
            })
            .collect()
    }

    fn fail_terminal(&mut self, identity: &Identity, reason: String) -> Result<()> {
        self.set_last_error(identity, reason);
        self.set_state(identity, State::FailedTerminal)?;

        let cap = self.policy().status.recent_failures;
        if let Some(item) = self.items.get(identity) {
            warn!(
                %identity,
                attempts = item.attempt_count,
                reason = item.last_error.as_deref().unwrap_or_default(),
                "work item failed permanently"
            );
            self.failures.push_front(failure_entry(item));
            self.failures.truncate(cap);
        }
        self.requeue_if_changed(identity)
    }

    /// Start a new cycle for a finished item whose file changed during the
    /// last one.
    fn requeue_if_changed(&mut self, identity: &Identity) -> Result<()> {
        let changed = self
            .items
            .get(identity)
            .is_some_and(|item| item.is_terminal() && item.pending_fingerprint.is_some());
        if changed {
            info!(%identity, "file changed during processing, processing again");
            metrics::work_discovered().add(1, &[KeyValue::new("result", "changed")]);
            self.set_state(identity, State::Queued)?;
            self.queue.push_back(identity.clone());
        }
        Ok(())
    }

    fn set_last_error(&mut self, identity: &Identity, reason: String) {
        if let Some(item) = self.items.get_mut(identity) {
            item.last_error = Some(reason);
        }
    }

    fn last_error(&self, identity: &Identity, fallback: &str) -> String {
        self.items
            .get(identity)
            .and_then(|item| item.last_error.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    fn recover_orphan(&mut self, identity: &Identity) -> Result<()> {
        let item = self
            .items
            .get_mut(identity)
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;
        item.recover_orphan()?;
        warn!(%identity, attempt = item.attempt_count + 1, "re-queueing attempt interrupted by a crash");
        self.move_count(State::InProgress, State::Queued);
        self.persist(identity)
    }

    fn cancel_attempt(&mut self, identity: &Identity) -> Result<()> {
        let item = self
            .items
            .get_mut(identity)
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;
        item.cancel_attempt()?;
        info!(%identity, "endpoint changed under a running attempt, re-queueing");
        self.move_count(State::InProgress, State::Queued);
        self.persist(identity)
    }

    /// Apply a transition, count it and queue its checkpoint.
    fn set_state(&mut self, identity: &Identity, to: State) -> Result<()> {
        let item = self
            .items
            .get_mut(identity)
            .ok_or_else(|| Error::NotFound(identity.to_string()))?;
        let from = item.state;
        item.transition(to)?;

        self.move_count(from, to);
        record_state_transition(identity, from, to);
        metrics::work_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
        self.persist(identity)
    }

    fn move_count(&mut self, from: State, to: State) {
        if let Some(n) = self.counts.get_mut(&from) {
            *n = n.saturating_sub(1);
        }
        *self.counts.entry(to).or_default() += 1;
    }

    fn persist(&mut self, identity: &Identity) -> Result<()> {
        let record = match self.items.get(identity) {
            Some(item) => CheckpointRecord::from_item(item, self.run_id),
            None => return Err(Error::NotFound(identity.to_string())),
        };
        let seq = self.checkpoints.submit(record)?;
        self.unsaved.insert(identity.clone(), seq);
        Ok(())
    }

    fn publish(&self, endpoints: &[EndpointStatus]) {
        let mut in_flight: Vec<InFlightEntry> = self
            .in_flight
            .iter()
            .map(|(identity, f)| InFlightEntry {
                identity: identity.clone(),
                endpoint: f.slot.endpoint.clone(),
                slot: f.slot.index,
                attempt: f.attempt,
                started_at: f.started_at,
                elapsed_ms: 0,
            })
            .collect();
        in_flight.sort_by(|a, b| (&a.endpoint, a.slot).cmp(&(&b.endpoint, b.slot)));

        let snapshot = StatusSnapshot {
            run_id: self.run_id,
            started_at: Some(self.started_at),
            uptime_secs: 0,
            counts: self.counts.clone(),
            queue_depth: self.queue.len(),
            in_flight,
            recent_failures: self.failures.iter().cloned().collect(),
            pending_checkpoints: self.unsaved.len(),
            workers: endpoints.iter().map(|e| e.slots).sum(),
            endpoints: endpoints.to_vec(),
            rate: self.limiter.snapshot(),
            draining: self.draining,
        };
        self.status.send_replace(snapshot.refreshed(Utc::now()));
    }
}

fn failure_entry(item: &WorkItem) -> FailureEntry {
    FailureEntry {
        identity: item.identity.clone(),
        path: item.path.clone(),
        attempts: item.attempt_count,
        reason: item.last_error.clone().unwrap_or_default(),
        failed_at: item.completed_at.unwrap_or(item.updated_at),
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Await the pending acquisition without giving up ownership of it.
async fn wait_for(acquiring: &mut Option<Acquisition>) -> Result<RatePermit> {
    match acquiring.as_mut() {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}
