//! Integration tests for telemetry initialization and span helpers.

use batchkit::model::{Identity, State};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = batchkit::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "batchkit-test".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = batchkit::telemetry::init_telemetry(config);
}

#[test]
fn work_span_creates_and_records_outcome() {
    let identity = Identity("calls/2024-06-01.wav".to_string());
    let span = batchkit::telemetry::work::start_work_span(&identity, 2, "default", 0);
    batchkit::telemetry::work::record_outcome(&span, "retryable");
}

#[test]
fn state_transition_event_emits() {
    let identity = Identity("calls/2024-06-01.wav".to_string());
    batchkit::telemetry::work::record_state_transition(&identity, State::Queued, State::InProgress);
}

#[test]
fn metric_instruments_build_without_a_provider() {
    batchkit::telemetry::metrics::work_discovered().add(1, &[]);
    batchkit::telemetry::metrics::recognizer_call_ms().record(12.5, &[]);
    batchkit::telemetry::metrics::rate_timeouts().add(1, &[]);
}
