//! Worker slots: run one item at a time and report back to the scheduler.
//!
//! A slot receives an item together with a rate permit that the scheduler has
//! already acquired. It calls the recognizer under a deadline, gives the
//! permit back, and sends exactly one [`WorkerReport`]. Slots are grouped per
//! recognizer endpoint. The pool itself is plain bookkeeping owned by the
//! scheduler task; slots never touch item state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info};

use crate::error::{Error, Result};
use crate::model::{Identity, Outcome};
use crate::ratelimit::RatePermit;
use crate::status::EndpointStatus;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_work_span};
use crate::transcribe::{Endpoint, Transcriber};

/// One slot, addressed across endpoint reconfigurations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub endpoint: String,
    /// Changes whenever the endpoint's target changes. Reports from an older
    /// generation are stale.
    pub generation: u64,
    pub index: usize,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.index)
    }
}

/// Result of one attempt, sent from a slot to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub identity: Identity,
    pub attempt: u32,
    pub slot: SlotId,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// One item handed to a slot.
#[derive(Debug)]
pub struct Assignment {
    pub identity: Identity,
    pub path: PathBuf,
    pub attempt: u32,
    pub permit: RatePermit,
}

/// Per-slot settings, captured at dispatch time.
#[derive(Clone)]
struct SlotContext {
    transcriber: Arc<dyn Transcriber>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    call_timeout: Duration,
    output_dir: Option<PathBuf>,
}

/// The slots of one endpoint.
struct SlotGroup {
    endpoint: Arc<Endpoint>,
    generation: u64,
    size: usize,
    free: BTreeSet<usize>,
    busy: HashMap<usize, AbortHandle>,
}

impl SlotGroup {
    fn new(endpoint: Arc<Endpoint>, generation: u64, size: usize) -> Self {
        Self {
            endpoint,
            generation,
            size,
            free: (0..size).collect(),
            busy: HashMap::new(),
        }
    }

    /// Growing takes effect at once; shrinking retires busy slots as they
    /// report.
    fn resize(&mut self, size: usize) {
        if size == self.size {
            return;
        }
        debug!(
            endpoint = %self.endpoint.name,
            from = self.size,
            to = size,
            busy = self.busy.len(),
            "resizing endpoint slots"
        );
        self.free.retain(|&slot| slot < size);
        for slot in self.size..size {
            if !self.busy.contains_key(&slot) {
                self.free.insert(slot);
            }
        }
        self.size = size;
    }

    fn release(&mut self, index: usize) {
        if self.busy.remove(&index).is_some() && index < self.size {
            self.free.insert(index);
        }
    }

    /// Abort every busy slot and return their ids.
    fn cancel(self) -> Vec<SlotId> {
        self.busy
            .into_iter()
            .map(|(index, task)| {
                task.abort();
                SlotId {
                    endpoint: self.endpoint.name.clone(),
                    generation: self.generation,
                    index,
                }
            })
            .collect()
    }
}

pub struct WorkerPool {
    ctx: SlotContext,
    groups: BTreeMap<String, SlotGroup>,
    next_generation: u64,
}

impl WorkerPool {
    /// An empty pool. Call [`configure`](Self::configure) to add endpoints.
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        call_timeout: Duration,
        output_dir: Option<PathBuf>,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        Self {
            ctx: SlotContext {
                transcriber,
                reports,
                call_timeout,
                output_dir,
            },
            groups: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Bring the pool in line with `plan` (endpoint, slot count).
    ///
    /// An endpoint whose target is unchanged is only resized. A removed
    /// endpoint, or one whose URL or credentials changed, has its busy slots
    /// aborted; their ids are returned so the scheduler can re-queue the work.
    pub fn configure(&mut self, plan: Vec<(Arc<Endpoint>, usize)>) -> Vec<SlotId> {
        let mut cancelled = Vec::new();

        let removed: Vec<String> = self
            .groups
            .keys()
            .filter(|name| !plan.iter().any(|(ep, _)| &ep.name == *name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(group) = self.groups.remove(&name) {
                info!(endpoint = %name, busy = group.busy.len(), "endpoint removed");
                cancelled.extend(group.cancel());
            }
        }

        for (endpoint, size) in plan {
            let unchanged = self
                .groups
                .get(&endpoint.name)
                .map(|group| group.endpoint.same_target(&endpoint));
            match unchanged {
                Some(true) => {
                    if let Some(group) = self.groups.get_mut(&endpoint.name) {
                        group.resize(size);
                    }
                }
                Some(false) | None => {
                    let generation = self.next_generation;
                    self.next_generation += 1;
                    let name = endpoint.name.clone();
                    let url = endpoint.url.clone();
                    let group = SlotGroup::new(endpoint, generation, size);
                    match self.groups.insert(name.clone(), group) {
                        Some(old) => {
                            info!(endpoint = %name, %url, busy = old.busy.len(), "endpoint changed, restarting its slots");
                            cancelled.extend(old.cancel());
                        }
                        None => info!(endpoint = %name, %url, slots = size, "endpoint added"),
                    }
                }
            }
        }

        cancelled
    }

    /// Current endpoint named `name`, if configured.
    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.groups.get(name).map(|group| Arc::clone(&group.endpoint))
    }

    /// Total slots across endpoints.
    pub fn size(&self) -> usize {
        self.groups.values().map(|g| g.size).sum()
    }

    pub fn busy(&self) -> usize {
        self.groups.values().map(|g| g.busy.len()).sum()
    }

    pub fn has_free_slot(&self) -> bool {
        self.groups.values().any(|g| !g.free.is_empty())
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.groups
            .values()
            .map(|g| EndpointStatus {
                name: g.endpoint.name.clone(),
                url: g.endpoint.url.clone(),
                slots: g.size,
                busy: g.busy.len(),
            })
            .collect()
    }

    /// Deadline applied to calls dispatched from now on.
    pub fn set_call_timeout(&mut self, call_timeout: Duration) {
        self.ctx.call_timeout = call_timeout;
    }

    /// Start `job` on the endpoint with the most free slots (ties go to the
    /// first by name) and return the slot it runs on.
    pub fn dispatch(&mut self, job: Assignment) -> Result<SlotId> {
        let group = self
            .groups
            .values_mut()
            .filter(|g| !g.free.is_empty())
            .rev()
            .max_by_key(|g| g.free.len())
            .ok_or_else(|| Error::Other("no free worker slot".to_string()))?;
        let index = group
            .free
            .pop_first()
            .ok_or_else(|| Error::Other("no free worker slot".to_string()))?;
        let slot = SlotId {
            endpoint: group.endpoint.name.clone(),
            generation: group.generation,
            index,
        };
        let task = tokio::spawn(run_slot(
            self.ctx.clone(),
            Arc::clone(&group.endpoint),
            slot.clone(),
            job,
        ));
        group.busy.insert(index, task.abort_handle());
        Ok(slot)
    }

    /// Return a slot after its report was received. Stale slots are ignored.
    pub fn release(&mut self, slot: &SlotId) {
        if let Some(group) = self.groups.get_mut(&slot.endpoint) {
            if group.generation == slot.generation {
                group.release(slot.index);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for group in self.groups.values() {
            for task in group.busy.values() {
                task.abort();
            }
        }
    }
}

/// Sends a retryable report if the slot task ends without reporting.
struct ReportGuard {
    reports: mpsc::UnboundedSender<WorkerReport>,
    pending: Option<(Identity, u32, SlotId)>,
    started: Instant,
}

impl ReportGuard {
    fn send(mut self, outcome: Outcome) {
        if let Some((identity, attempt, slot)) = self.pending.take() {
            let _ = self.reports.send(WorkerReport {
                identity,
                attempt,
                slot,
                outcome,
                elapsed: self.started.elapsed(),
            });
        }
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if let Some((identity, attempt, slot)) = self.pending.take() {
            debug!(%identity, %slot, "slot task ended before reporting");
            let _ = self.reports.send(WorkerReport {
                identity,
                attempt,
                slot,
                outcome: Outcome::Retryable("worker slot ended without reporting".to_string()),
                elapsed: self.started.elapsed(),
            });
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_slot(ctx: SlotContext, endpoint: Arc<Endpoint>, slot: SlotId, job: Assignment) {
    let Assignment {
        identity,
        path,
        attempt,
        permit,
    } = job;
    let guard = ReportGuard {
        reports: ctx.reports.clone(),
        pending: Some((identity.clone(), attempt, slot.clone())),
        started: Instant::now(),
    };
    let span = start_work_span(&identity, attempt, &slot.endpoint, slot.index);

    async {
        let started = Instant::now();
        let outcome = call_with_deadline(&ctx, endpoint, path).await;
        drop(permit);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        metrics::recognizer_call_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("outcome", outcome.label()),
                KeyValue::new("endpoint", slot.endpoint.clone()),
            ],
        );
        record_outcome(&span, outcome.label());

        let outcome = match (&outcome, &ctx.output_dir) {
            (Outcome::Success(result), Some(dir)) => {
                match write_result(dir, &identity, result).await {
                    Ok(()) => outcome,
                    Err(e) => Outcome::Retryable(format!("failed to write result: {e}")),
                }
            }
            _ => outcome,
        };

        debug!(%identity, attempt, %slot, outcome = outcome.label(), "attempt finished");
        guard.send(outcome);
    }
    .instrument(span.clone())
    .await
}

/// Run the recognizer in its own task so a panic or an overrun is contained.
/// Aborting the slot aborts the call with it.
async fn call_with_deadline(ctx: &SlotContext, endpoint: Arc<Endpoint>, path: PathBuf) -> Outcome {
    let transcriber = Arc::clone(&ctx.transcriber);
    let call = tokio::spawn(async move { transcriber.transcribe(&endpoint, &path).await });
    let _abort = AbortOnDrop(call.abort_handle());

    match tokio::time::timeout(ctx.call_timeout, call).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Outcome::Retryable(format!("recognizer panicked: {message}"))
        }
        Ok(Err(_)) => Outcome::Retryable("recognizer call was cancelled".to_string()),
        Err(_) => Outcome::Retryable(format!(
            "deadline exceeded after {}ms",
            ctx.call_timeout.as_millis()
        )),
    }
}

async fn write_result(dir: &std::path::Path, identity: &Identity, result: &serde_json::Value) -> Result<()> {
    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "identity": identity,
        "result": result,
    }))?;
    crate::fs::write_atomic(&dir.join(format!("{}.json", identity.slug())), &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateBudget, RateLimiter};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::path::Path;

    struct Fixed(Outcome);

    #[async_trait]
    impl Transcriber for Fixed {
        async fn transcribe(&self, _endpoint: &Endpoint, _path: &Path) -> Outcome {
            self.0.clone()
        }
    }

    struct Panics;

    #[async_trait]
    impl Transcriber for Panics {
        async fn transcribe(&self, _endpoint: &Endpoint, _path: &Path) -> Outcome {
            panic!("decoder crashed");
        }
    }

    struct Hangs;

    #[async_trait]
    impl Transcriber for Hangs {
        async fn transcribe(&self, _endpoint: &Endpoint, _path: &Path) -> Outcome {
            std::future::pending().await
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        RateLimiter::new(RateBudget {
            max_concurrent: 4,
            window: None,
            acquire_timeout: Duration::from_secs(1),
        })
    }

    fn endpoint(name: &str, url: &str) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(name, url, SecretString::from("k")))
    }

    fn pool(
        transcriber: Arc<dyn Transcriber>,
        call_timeout: Duration,
        output_dir: Option<PathBuf>,
        plan: Vec<(Arc<Endpoint>, usize)>,
    ) -> (WorkerPool, mpsc::UnboundedReceiver<WorkerReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(transcriber, call_timeout, output_dir, tx);
        assert!(pool.configure(plan).is_empty());
        (pool, rx)
    }

    async fn assignment(limiter: &Arc<RateLimiter>, name: &str) -> Assignment {
        Assignment {
            identity: Identity(name.into()),
            path: PathBuf::from("/in").join(name),
            attempt: 1,
            permit: limiter.acquire().await.unwrap(),
        }
    }

    async fn run_one(
        transcriber: Arc<dyn Transcriber>,
        call_timeout: Duration,
        output_dir: Option<PathBuf>,
    ) -> (WorkerReport, Arc<RateLimiter>) {
        let limiter = limiter();
        let (mut pool, mut rx) = pool(
            transcriber,
            call_timeout,
            output_dir,
            vec![(endpoint("default", "http://asr"), 1)],
        );
        let slot = pool.dispatch(assignment(&limiter, "day1/a.wav").await).unwrap();
        assert!(!pool.has_free_slot());
        let report = rx.recv().await.unwrap();
        assert_eq!(report.slot, slot);
        pool.release(&slot);
        assert!(pool.has_free_slot());
        (report, limiter)
    }

    #[tokio::test]
    async fn success_writes_result_file() {
        let out = tempfile::tempdir().unwrap();
        let (report, limiter) = run_one(
            Arc::new(Fixed(Outcome::Success(serde_json::json!({"text": "hi"})))),
            Duration::from_secs(5),
            Some(out.path().to_path_buf()),
        )
        .await;

        assert!(matches!(report.outcome, Outcome::Success(_)));
        assert_eq!(report.attempt, 1);
        assert_eq!(limiter.snapshot().in_flight, 0);
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.path().join("day1_a.wav.json")).unwrap())
                .unwrap();
        assert_eq!(written["result"]["text"], "hi");
    }

    #[tokio::test]
    async fn panic_is_reported_retryable() {
        let (report, limiter) = run_one(Arc::new(Panics), Duration::from_secs(5), None).await;
        assert_eq!(
            report.outcome,
            Outcome::Retryable("recognizer panicked: decoder crashed".into())
        );
        assert_eq!(limiter.snapshot().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_is_cancelled_at_the_deadline() {
        let (report, limiter) = run_one(Arc::new(Hangs), Duration::from_millis(250), None).await;
        assert_eq!(
            report.outcome,
            Outcome::Retryable("deadline exceeded after 250ms".into())
        );
        assert_eq!(limiter.snapshot().in_flight, 0);
    }

    #[test]
    fn shrinking_retires_busy_slots_on_release() {
        let (mut pool, _rx) = pool(
            Arc::new(Fixed(Outcome::Terminal("x".into()))),
            Duration::from_secs(1),
            None,
            vec![(endpoint("default", "http://asr"), 3)],
        );
        let slot = |index| SlotId {
            endpoint: "default".into(),
            generation: 0,
            index,
        };
        // Pretend slots 1 and 2 are running.
        let idle = tokio::runtime::Builder::new_current_thread().build().unwrap();
        {
            let group = pool.groups.get_mut("default").unwrap();
            group.free.remove(&1);
            group.free.remove(&2);
            let task = idle.spawn(async {});
            group.busy.insert(1, task.abort_handle());
            group.busy.insert(2, task.abort_handle());
        }

        pool.configure(vec![(endpoint("default", "http://asr"), 1)]);
        let free = |pool: &WorkerPool| pool.groups["default"].free.iter().copied().collect::<Vec<_>>();
        assert_eq!(free(&pool), vec![0]);
        pool.release(&slot(2));
        assert!(!pool.groups["default"].free.contains(&2));
        assert_eq!(pool.busy(), 1);

        pool.configure(vec![(endpoint("default", "http://asr"), 4)]);
        assert_eq!(free(&pool), vec![0, 2, 3]);
        pool.release(&slot(1));
        assert_eq!(pool.groups["default"].free.len(), 4);
        assert_eq!(pool.size(), 4);
    }

    #[tokio::test]
    async fn dispatch_spreads_across_endpoints() {
        let limiter = limiter();
        let (mut pool, _rx) = pool(
            Arc::new(Hangs),
            Duration::from_secs(60),
            None,
            vec![
                (endpoint("east", "http://east"), 2),
                (endpoint("west", "http://west"), 2),
            ],
        );

        let first = pool.dispatch(assignment(&limiter, "a.wav").await).unwrap();
        let second = pool.dispatch(assignment(&limiter, "b.wav").await).unwrap();
        assert_eq!(first.endpoint, "east");
        assert_eq!(second.endpoint, "west");
        let status = pool.status();
        assert_eq!(status.iter().map(|e| e.busy).collect::<Vec<_>>(), vec![1, 1]);
        assert_eq!(pool.size(), 4);
    }

    #[tokio::test]
    async fn retargeted_endpoint_cancels_its_busy_slots() {
        let limiter = limiter();
        let (mut pool, mut rx) = pool(
            Arc::new(Hangs),
            Duration::from_secs(60),
            None,
            vec![
                (endpoint("east", "http://east"), 1),
                (endpoint("west", "http://west"), 1),
            ],
        );
        let east = pool.dispatch(assignment(&limiter, "a.wav").await).unwrap();
        let west = pool.dispatch(assignment(&limiter, "b.wav").await).unwrap();

        let cancelled = pool.configure(vec![
            (endpoint("east", "http://east-2"), 1),
            (endpoint("west", "http://west"), 1),
        ]);
        assert_eq!(cancelled, vec![east.clone()]);
        assert_eq!(pool.busy(), 1);
        assert!(pool.has_free_slot());
        assert_eq!(pool.endpoint("east").unwrap().url, "http://east-2");

        // the aborted slot still reports, with its old generation
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.slot, east);
        pool.release(&report.slot);
        assert_eq!(pool.groups["east"].free.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while limiter.snapshot().in_flight > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("aborted slot kept its rate permit");

        let cancelled = pool.configure(vec![(endpoint("east", "http://east-2"), 1)]);
        assert_eq!(cancelled, vec![west]);
        assert!(pool.endpoint("west").is_none());
        assert_eq!(pool.busy(), 0);
    }
}
