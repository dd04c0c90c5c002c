//! # jobs-rs
//!
//! Cancellable, progress-reporting jobs that compose into trees.
//!
//! A [`Job`] wraps a unit of work, reports done/total work units and a log,
//! and can be canceled cooperatively. An [`Aggregator`] presents weighted
//! sub-jobs as one job and runs them concurrently. An [`Observer`] adapts an
//! existing long-running operation that reports progress on its own.
//! Running a job yields a [`JobFuture`] that settles once the job reaches a
//! terminal state.
//!
//! Every job carries a tracing span; state transitions and sub-job
//! registrations are also counted through OpenTelemetry metrics.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod model;
pub mod observer;
pub mod telemetry;
pub mod worker;

pub use aggregator::Aggregator;
pub use error::{Error, JobFailure, Panicked, Result};
pub use job::{Job, JobFuture, Outcome, Task};
pub use model::{JobId, JobKind, JobSnapshot, JobState};
pub use observer::Observer;
pub use worker::{Inline, Worker};
