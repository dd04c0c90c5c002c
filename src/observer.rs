//! Observer jobs.
//!
//! An observer adapts a long operation that cannot be restructured around
//! a work callable. The operation keeps its own loop and reports through
//! `report()` (or the plain callbacks on [`Job`]), polling
//! `cancel_requested()` between steps. The observer is running from the
//! moment it is created and ends when `finish()` or `fail()` is called or
//! when it is canceled.

use std::ops::Deref;

use crate::error::JobFailure;
use crate::job::Job;
use crate::model::{DEFAULT_WORK_UNITS, JobKind, JobState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observer {
    job: Job,
}

impl Observer {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_total_work_units(name, DEFAULT_WORK_UNITS)
    }

    pub fn with_total_work_units(name: impl Into<String>, total_work_units: u64) -> Self {
        Self {
            job: Job::build(
                name.into(),
                JobKind::Observer,
                JobState::Running,
                total_work_units,
                None,
            ),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Report `fraction` (0.0 to 1.0) of the work as done and append
    /// `message` to the log.
    pub fn report(&self, fraction: f64, message: impl Into<String>) {
        self.job.done_fraction(fraction);
        self.job.log(message);
    }

    /// The observed operation completed. No effect once canceled.
    pub fn finish(&self) {
        self.job.complete(Ok(()));
    }

    /// The observed operation failed; the error is carried by the handle.
    pub fn fail(&self, error: impl Into<anyhow::Error>) {
        self.job
            .complete(Err(JobFailure::new(self.job.name(), error.into())));
    }
}

impl Deref for Observer {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl AsRef<Job> for Observer {
    fn as_ref(&self) -> &Job {
        &self.job
    }
}

impl From<Observer> for Job {
    fn from(observer: Observer) -> Job {
        observer.job
    }
}
