//! Scheduling engine: the scheduler task and the worker slots it drives.

pub mod scheduler;
pub mod worker;

pub use scheduler::{DrainReport, Recovery, Scheduler};
pub use worker::{Assignment, SlotId, WorkerPool, WorkerReport};
