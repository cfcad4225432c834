//! Read-only status surface.
//!
//! The scheduler publishes a [`StatusSnapshot`] after every decision on a
//! watch channel. This module serves the latest one over HTTP and can write
//! it to a run-summary file on an interval. Nothing here can change state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Identity, State};
use crate::ratelimit::RateSnapshot;

/// One item currently held by a worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightEntry {
    pub identity: Identity,
    pub endpoint: String,
    pub slot: usize,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// A terminal failure and its reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub identity: Identity,
    pub path: PathBuf,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Slot usage of one recognizer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub url: String,
    pub slots: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub counts: BTreeMap<State, u64>,
    pub queue_depth: usize,
    pub in_flight: Vec<InFlightEntry>,
    /// Most recent first.
    pub recent_failures: Vec<FailureEntry>,
    /// Checkpoint records submitted but not yet acknowledged as durable.
    pub pending_checkpoints: usize,
    /// Total worker slots across endpoints.
    pub workers: usize,
    #[serde(default)]
    pub endpoints: Vec<EndpointStatus>,
    pub rate: RateSnapshot,
    pub draining: bool,
}

impl StatusSnapshot {
    /// Recompute the time-derived fields against `now`.
    pub fn refreshed(mut self, now: DateTime<Utc>) -> Self {
        if let Some(started) = self.started_at {
            self.uptime_secs = (now - started).num_seconds().max(0) as u64;
        }
        for entry in &mut self.in_flight {
            entry.elapsed_ms = (now - entry.started_at).num_milliseconds().max(0) as u64;
        }
        self
    }

    pub fn count(&self, state: State) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct StatusService {
    status: watch::Receiver<StatusSnapshot>,
}

impl StatusService {
    pub fn new(status: watch::Receiver<StatusSnapshot>) -> Self {
        Self { status }
    }

    fn current(&self) -> StatusSnapshot {
        self.status.borrow().clone().refreshed(Utc::now())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(full_status))
            .route("/status/failures", get(failures))
            .route("/health", get(health))
            .with_state(self.clone())
    }

    /// Bind the listener. Split from [`serve`](Self::serve) so callers can
    /// bind port 0 and learn the address.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Serve until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        info!(?addr, "status endpoint listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        debug!("status endpoint stopped");
        Ok(())
    }

    /// Write the snapshot to `path` every `interval`, and once more on
    /// shutdown.
    pub async fn write_summaries(
        self,
        path: PathBuf,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let stop = tokio::select! {
                _ = shutdown.cancelled() => true,
                _ = ticker.tick() => false,
            };
            if let Err(e) = self.write_summary(&path).await {
                warn!(path = %path.display(), "failed to write run summary: {e}");
            }
            if stop {
                return;
            }
        }
    }

    pub async fn write_summary(&self, path: &std::path::Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.current())?;
        crate::fs::write_atomic(path, &body).await
    }
}

async fn full_status(AxumState(svc): AxumState<StatusService>) -> Json<StatusSnapshot> {
    Json(svc.current())
}

async fn failures(AxumState(svc): AxumState<StatusService>) -> Json<Vec<FailureEntry>> {
    Json(svc.current().recent_failures)
}

async fn health(AxumState(svc): AxumState<StatusService>) -> impl IntoResponse {
    let snapshot = svc.current();
    let code = if snapshot.draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = serde_json::json!({
        "status": if snapshot.draining { "draining" } else { "ok" },
        "run_id": snapshot.run_id,
        "uptime_secs": snapshot.uptime_secs,
    });
    (code, Json(body))
}
