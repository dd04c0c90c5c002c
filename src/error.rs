//! Error types for jobs-rs.
//!
//! [`Error`] covers programming errors surfaced immediately by the API
//! (running a job twice, bad aggregation). [`JobFailure`] is what a job's
//! work produced when it failed; it travels through the asynchronous handle
//! and is only seen by whoever calls `get()`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::model::JobState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job {0} has not been run yet")]
    Waiting(String),

    #[error("job {0} has already been run")]
    AlreadyStarted(String),

    #[error("aggregator {0} cannot be added to itself")]
    SelfAggregation(String),

    #[error("adding {sub} to {aggregator} would create a cycle")]
    Cycle { aggregator: String, sub: String },

    #[error("job {sub} is already registered in {aggregator}")]
    AlreadyRegistered { aggregator: String, sub: String },

    #[error("cannot add jobs to {aggregator} while it is {state}")]
    InvalidState { aggregator: String, state: JobState },

    #[error("invalid weight {0}: must be finite and non-negative")]
    InvalidWeight(f64),

    #[error("weight {weight} for {sub} overflows the work units of {aggregator}")]
    WeightOverflow {
        aggregator: String,
        sub: String,
        weight: f64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Panic payload captured from a job's work.
#[derive(Debug, Error)]
#[error("work panicked: {0}")]
pub struct Panicked(pub String);

/// The failure a job's work ended with.
///
/// Cloning is cheap and every clone refers to the same underlying error, so
/// the failure re-raised by an aggregator is the one its sub-job produced.
#[derive(Clone)]
pub struct JobFailure {
    job: String,
    error: Arc<anyhow::Error>,
}

impl JobFailure {
    pub fn new(job: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            job: job.into(),
            error: Arc::new(error),
        }
    }

    pub(crate) fn panicked(job: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(job, anyhow::Error::new(Panicked(message)))
    }

    /// Name of the job whose work failed.
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    pub fn is_panic(&self) -> bool {
        self.error.is::<Panicked>()
    }

    /// True when both values carry the very same error.
    pub fn same_as(&self, other: &JobFailure) -> bool {
        Arc::ptr_eq(&self.error, &other.error)
    }
}

impl fmt::Debug for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFailure")
            .field("job", &self.job)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} failed: {}", self.job, self.error)
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + Send + Sync + 'static) = (*self.error).as_ref();
        Some(source)
    }
}
