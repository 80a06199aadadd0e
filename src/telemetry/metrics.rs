//! Metric instrument factories.
//!
//! Instruments come from the `"workq"` meter on the globally registered
//! `MeterProvider`. Without a provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: job submissions.
/// Labels: `kind`, `result` ("ok" | "duplicate").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: work items reaching a settled state.
/// Labels: `kind`, `outcome`.
pub fn items_settled() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.settled")
        .with_description("Number of work items settled")
        .build()
}

/// Counter: rate limiter decisions.
/// Labels: `result` ("allowed" | "rejected").
pub fn rate_limit_decisions() -> Counter<u64> {
    meter()
        .u64_counter("workq.rate_limit.decisions")
        .with_description("Number of rate limiter admission decisions")
        .build()
}

/// Counter: circuit breaker state changes.
/// Labels: `operation`, `from`, `to`.
pub fn circuit_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.circuit.transitions")
        .with_description("Number of circuit breaker state transitions")
        .build()
}

/// Counter: dead-letter entries created.
/// Labels: `class`.
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("workq.dead_letters")
        .with_description("Number of dead-letter entries created")
        .build()
}

/// Histogram: work-function call duration in milliseconds.
/// Labels: `operation`, `outcome`.
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.attempt.duration_ms")
        .with_description("Work function attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}
