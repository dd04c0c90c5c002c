//! Job span helpers.
//!
//! Every job owns one span for its whole life. Leaf work runs inside it and
//! each state transition is recorded on it.

use tracing::Span;

use crate::model::{JobId, JobKind, JobState};

/// Start the span for a job.
///
/// The `job.state` field is declared empty and is updated via
/// [`record_state_transition`].
pub fn start_job_span(kind: JobKind, name: &str, id: &JobId) -> Span {
    tracing::info_span!(
        "job",
        "job.kind" = %kind,
        "job.name" = name,
        "job.id" = %id,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the job's span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_state_transition(span: &Span, from: JobState, to: JobState) {
    span.record("job.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
