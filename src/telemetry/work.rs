//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the scheduler and worker slots.

use tracing::Span;

use crate::model::{Identity, State};

/// Start a span for one recognizer attempt.
///
/// The `work.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_work_span(identity: &Identity, attempt: u32, endpoint: &str, slot: usize) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.identity" = %identity,
        "work.attempt" = attempt,
        "work.endpoint" = endpoint,
        "work.slot" = slot,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record the attempt's outcome label on the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
}

/// Emit a state transition event.
pub fn record_state_transition(identity: &Identity, from: State, to: State) {
    tracing::debug!(identity = %identity, from = %from, to = %to, "state_transition");
}
