//! # batchkit
//!
//! Endurance batch transcription. Audio files dropped into a watched folder
//! are discovered, dispatched to a bounded pool of workers that call a
//! rate-limited recognition service, and checkpointed so that each file is
//! processed exactly once across crashes, throttling and restarts.
//!
//! Data flow: [`watcher`] → [`engine::Scheduler`] → [`engine::WorkerPool`]
//! → [`checkpoint`] → [`status`]. [`config`] gates startup and live reloads.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod fs;
pub mod model;
pub mod ratelimit;
pub mod status;
pub mod telemetry;
pub mod transcribe;
pub mod watcher;
