//! Checkpoint persistence: one row per identity, replaced atomically.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use crate::model::checkpoint::FORMAT_VERSION;
use crate::model::{CheckpointRecord, Identity, State};
use crate::telemetry::metrics;

const UPSERT: &str = "INSERT INTO checkpoints (identity, state, version, record, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (identity) DO UPDATE SET
        state = excluded.state,
        version = excluded.version,
        record = excluded.record,
        updated_at = excluded.updated_at";

impl super::Db {
    /// Record counts per state, straight from the table.
    pub async fn count_by_state(&self) -> Result<BTreeMap<State, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM checkpoints GROUP BY state")
                .fetch_all(self.pool())
                .await?;

        let mut counts = BTreeMap::new();
        for (state, n) in rows {
            counts.insert(state.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

fn decode(rows: Vec<(String,)>) -> Result<Vec<CheckpointRecord>> {
    rows.into_iter()
        .map(|(json,)| serde_json::from_str(&json).map_err(Into::into))
        .collect()
}

#[async_trait]
impl CheckpointStore for super::Db {
    async fn upsert(&self, record: &CheckpointRecord) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(record)).await
    }

    /// All records commit together or not at all.
    async fn upsert_batch(&self, records: &[CheckpointRecord]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for record in records {
            let json = serde_json::to_string(record)?;
            sqlx::query(UPSERT)
                .bind(record.identity.as_str())
                .bind(record.state.as_str())
                .bind(FORMAT_VERSION as i64)
                .bind(json)
                .bind(record.updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        metrics::checkpoint_writes().add(records.len() as u64, &[]);
        Ok(())
    }

    async fn get(&self, identity: &Identity) -> Result<Option<CheckpointRecord>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM checkpoints WHERE identity = ?1")
                .bind(identity.as_str())
                .fetch_optional(self.pool())
                .await?;

        row.map(|(json,)| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }

    async fn list(&self, state: Option<State>) -> Result<Vec<CheckpointRecord>> {
        let rows: Vec<(String,)> = match state {
            Some(state) => {
                sqlx::query_as(
                    "SELECT record FROM checkpoints WHERE state = ?1 ORDER BY identity",
                )
                .bind(state.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT record FROM checkpoints ORDER BY identity")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        decode(rows)
    }
}
