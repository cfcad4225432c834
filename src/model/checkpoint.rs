//! Durable checkpoint record, one per identity.
//!
//! Stored as versioned JSON. Readers ignore unknown fields and default missing
//! optional ones, so records written by a newer or older build stay readable.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work::{Fingerprint, Identity, State, WorkItem};

/// Current on-disk record layout.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "default_version")]
    pub format_version: u32,
    pub identity: Identity,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub state: State,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub pending_fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub orphan_refunded: bool,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Process run that wrote this record.
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

fn default_version() -> u32 {
    FORMAT_VERSION
}

impl CheckpointRecord {
    pub fn from_item(item: &WorkItem, run_id: Uuid) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            identity: item.identity.clone(),
            path: item.path.clone(),
            fingerprint: item.fingerprint.clone(),
            state: item.state,
            attempt_count: item.attempt_count,
            last_error: item.last_error.clone(),
            pending_fingerprint: item.pending_fingerprint.clone(),
            orphan_refunded: item.orphan_refunded,
            enqueued_at: item.enqueued_at,
            updated_at: item.updated_at,
            completed_at: item.completed_at,
            run_id: Some(run_id),
        }
    }

    /// Rebuild the in-memory item exactly as it was checkpointed.
    pub fn into_item(self) -> WorkItem {
        WorkItem {
            identity: self.identity,
            path: self.path,
            fingerprint: self.fingerprint,
            state: self.state,
            attempt_count: self.attempt_count,
            last_error: self.last_error,
            pending_fingerprint: self.pending_fingerprint,
            orphan_refunded: self.orphan_refunded,
            enqueued_at: self.enqueued_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}
