//! Job execution span helpers.

use tracing::Span;

use crate::model::JobId;

/// Span covering one worker's pass over a job.
///
/// `job.state` starts empty and is filled by [`record_state_transition`].
pub fn start_job_span(kind: &str, job_id: JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.kind" = kind,
        "job.id" = %job_id,
        "job.state" = tracing::field::Empty,
    )
}

/// Emit a state-transition event inside `span` and record the new state.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
