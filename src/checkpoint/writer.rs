//! Background checkpoint writer.
//!
//! Receives records over a channel, coalesces them per identity, writes them
//! in batches and acknowledges each durable write. Failed writes are retried
//! with capped exponential backoff; until acknowledged, a record is treated as
//! not yet durable by the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::CheckpointStore;
use crate::error::{Error, Result};
use crate::model::{CheckpointRecord, Identity};
use crate::telemetry::metrics;

/// Acknowledgement that the record with sequence number `seq` (or a later one
/// for the same identity) is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persisted {
    pub identity: Identity,
    pub seq: u64,
}

struct PendingWrite {
    seq: u64,
    record: CheckpointRecord,
}

/// Scheduler-side handle to the writer task.
pub struct CheckpointHandle {
    tx: Option<mpsc::UnboundedSender<PendingWrite>>,
    acks: mpsc::UnboundedReceiver<Persisted>,
    task: Option<JoinHandle<()>>,
    next_seq: u64,
}

impl CheckpointHandle {
    /// Queue a record for writing. Returns its sequence number.
    pub fn submit(&mut self, record: CheckpointRecord) -> Result<u64> {
        let stopped = || Error::Other("checkpoint writer stopped".to_string());
        let tx = self.tx.as_ref().ok_or_else(stopped)?;
        self.next_seq += 1;
        let seq = self.next_seq;
        tx.send(PendingWrite { seq, record }).map_err(|_| stopped())?;
        Ok(seq)
    }

    /// Next acknowledgement. Cancel-safe.
    pub async fn next_ack(&mut self) -> Option<Persisted> {
        self.acks.recv().await
    }

    /// Stop accepting records, wait until every queued record is written, and
    /// return the acknowledgements not yet consumed. Later submits fail.
    pub async fn flush(&mut self) -> Vec<Persisted> {
        self.tx.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("checkpoint writer task ended abnormally: {e}");
            }
        }
        let mut rest = Vec::new();
        while let Ok(ack) = self.acks.try_recv() {
            rest.push(ack);
        }
        rest
    }
}

pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    rx: mpsc::UnboundedReceiver<PendingWrite>,
    acks: mpsc::UnboundedSender<Persisted>,
    batch_size: usize,
    retry_delay: Duration,
}

impl CheckpointWriter {
    /// Start the writer task.
    pub fn spawn(
        store: Arc<dyn CheckpointStore>,
        batch_size: usize,
        retry_delay: Duration,
    ) -> CheckpointHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let writer = Self {
            store,
            rx,
            acks: ack_tx,
            batch_size: batch_size.max(1),
            retry_delay,
        };
        let task = tokio::spawn(writer.run());
        CheckpointHandle {
            tx: Some(tx),
            acks: ack_rx,
            task: Some(task),
            next_seq: 0,
        }
    }

    async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            // Latest record per identity wins; order within an identity is
            // preserved because there is a single writer.
            let mut pending: BTreeMap<Identity, PendingWrite> = BTreeMap::new();
            pending.insert(first.record.identity.clone(), first);
            while pending.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(next) => {
                        pending.insert(next.record.identity.clone(), next);
                    }
                    Err(_) => break,
                }
            }

            let (seqs, records): (Vec<_>, Vec<_>) = pending
                .into_values()
                .map(|w| ((w.record.identity.clone(), w.seq), w.record))
                .unzip();

            self.write_until_durable(&records).await;

            for (identity, seq) in seqs {
                let _ = self.acks.send(Persisted { identity, seq });
            }
        }
        debug!("checkpoint writer drained");
    }

    async fn write_until_durable(&self, records: &[CheckpointRecord]) {
        let mut failures: u32 = 0;
        loop {
            match self.store.upsert_batch(records).await {
                Ok(()) => {
                    if failures > 0 {
                        debug!(failures, "checkpoint write recovered");
                    }
                    return;
                }
                Err(e) => {
                    failures += 1;
                    metrics::checkpoint_write_failures().add(1, &[]);
                    let delay = self.retry_delay * 2u32.pow(failures.min(6));
                    warn!(
                        failures,
                        batch = records.len(),
                        "checkpoint write failed, retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
