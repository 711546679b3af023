//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for work records
//! flowing through the scheduler.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for one run of a work record.
///
/// The `work.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_work_span(worker: &str, id: &WorkId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.worker" = worker,
        "work.id" = %id.0,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Updates `work.state` and emits a tracing `info` event scoped to the span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
