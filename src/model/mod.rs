//! Core data model.
//!
//! A work item is one input file moving through the lifecycle; a checkpoint
//! is its durable shadow.

pub mod checkpoint;
pub mod work;

pub use checkpoint::CheckpointRecord;
pub use work::{
    Fingerprint, FingerprintStrategy, Identity, IdentityStrategy, Outcome, State, WorkItem,
};
