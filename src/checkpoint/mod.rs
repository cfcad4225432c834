//! Durable per-identity checkpoint store and its asynchronous writer.
//!
//! The store is the source of truth for recovery. The scheduler never writes
//! to it inline; records go through [`CheckpointWriter`], which batches,
//! retries and acknowledges them.

pub mod writer;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CheckpointRecord, Identity, State};

pub use writer::{CheckpointHandle, CheckpointWriter, Persisted};

/// Durable key-value mapping from identity to checkpoint record.
///
/// Every write is atomic per record: a concurrent reader or a later restart
/// sees either the previous record or the new one, never a mix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace one record.
    async fn upsert(&self, record: &CheckpointRecord) -> Result<()>;

    /// Insert or replace several records.
    async fn upsert_batch(&self, records: &[CheckpointRecord]) -> Result<()> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(())
    }

    async fn get(&self, identity: &Identity) -> Result<Option<CheckpointRecord>>;

    /// All records, or only those in `state`.
    async fn list(&self, state: Option<State>) -> Result<Vec<CheckpointRecord>>;
}
