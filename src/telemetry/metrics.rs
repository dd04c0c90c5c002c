//! Metric instrument factories for jobs-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobs-rs"` meter. Without a
//! registered provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobs-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Counter: job state transitions.
/// Labels: `kind`, `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs launched by `run()`.
/// Labels: `kind`.
pub fn jobs_launched() -> Counter<u64> {
    meter()
        .u64_counter("jobs.launched")
        .with_description("Number of jobs launched")
        .build()
}

/// Histogram: time from launch to terminal state, in milliseconds.
/// Labels: `kind`, `state`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobs.duration_ms")
        .with_description("Job duration from launch to terminal state")
        .with_unit("ms")
        .build()
}

/// Counter: sub-jobs registered with aggregators.
pub fn sub_jobs_added() -> Counter<u64> {
    meter()
        .u64_counter("jobs.sub_jobs_added")
        .with_description("Number of sub-jobs added to aggregators")
        .build()
}
