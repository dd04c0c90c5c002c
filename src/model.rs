//! Core data model.
//!
//! A job has identity (id + name), a kind, a lifecycle state and two
//! work-unit counters. Progress is `done / total`, with a total of zero
//! meaning "not measured".

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Total work units a leaf job or observer starts with.
pub const DEFAULT_WORK_UNITS: u64 = 100;

/// Work units a sub-job of weight 1.0 contributes to its aggregator.
pub const NORMALIZED_SCALE: f64 = 100.0;

/// Weight used when a caller has no reason to favour one sub-job.
pub const DEFAULT_WEIGHT: f64 = 1.0;

// ---------------------------------------------------------------------------
// Job id
// ---------------------------------------------------------------------------

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet run.
    Waiting,
    /// Work in progress.
    Running,
    /// Cancel requested while running; the work has not returned yet.
    Canceling,
    /// Canceled. Terminal.
    Canceled,
    /// Work returned normally. Terminal.
    Finished,
    /// Work returned an error or panicked. Terminal.
    Failed,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Waiting, Running)
                | (Waiting, Canceled)   // canceled before it was ever run
                | (Running, Canceling)
                | (Running, Canceled)   // observers cancel immediately
                | (Running, Finished)
                | (Running, Failed)
                | (Canceling, Canceled)
                | (Canceling, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Canceled | JobState::Finished | JobState::Failed
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Canceling => "canceling",
            JobState::Canceled => "canceled",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "running" => Ok(JobState::Running),
            "canceling" => Ok(JobState::Canceling),
            "canceled" => Ok(JobState::Canceled),
            "finished" => Ok(JobState::Finished),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::Other(format!("unknown job state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// What drives a job's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Runs a single work callable.
    Leaf,
    /// Driven from outside through a polling-style interface.
    Observer,
    /// Weighted union of sub-jobs.
    Aggregator,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Leaf => "leaf",
            JobKind::Observer => "observer",
            JobKind::Aggregator => "aggregator",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a job, suitable for display or serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    pub state: JobState,
    pub done_work_units: u64,
    pub total_work_units: u64,
    pub progress: f64,
    pub cancel_requested: bool,
    /// Sub-jobs of an aggregator, in registration order. Empty otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_jobs: Vec<JobSnapshot>,
}
