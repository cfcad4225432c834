//! Metric instrument factories for batchkit.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchkit"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for batchkit instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("batchkit")
}

/// Counter: files admitted to the queue.
/// Labels: `result` ("new" | "changed").
pub fn work_discovered() -> Counter<u64> {
    meter()
        .u64_counter("batchkit.work.discovered")
        .with_description("Number of files admitted to the work queue")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("batchkit.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Histogram: recognizer call duration in milliseconds.
/// Labels: `outcome` ("success" | "retryable" | "terminal").
pub fn recognizer_call_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchkit.recognizer.call_ms")
        .with_description("Recognizer call duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: time spent waiting for a rate token.
pub fn rate_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchkit.rate.wait_ms")
        .with_description("Time spent waiting for a rate token")
        .with_unit("ms")
        .build()
}

/// Counter: rate token acquisitions that timed out.
pub fn rate_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("batchkit.rate.timeouts")
        .with_description("Rate token acquisitions that timed out")
        .build()
}

/// Counter: checkpoint records written.
pub fn checkpoint_writes() -> Counter<u64> {
    meter()
        .u64_counter("batchkit.checkpoint.writes")
        .with_description("Number of checkpoint records written")
        .build()
}

/// Counter: failed checkpoint write attempts.
pub fn checkpoint_write_failures() -> Counter<u64> {
    meter()
        .u64_counter("batchkit.checkpoint.write_failures")
        .with_description("Number of failed checkpoint write attempts")
        .build()
}
