//! Structured events for a job.
//!
//! Consumers that prefer a stream over callbacks (progress dialogs, SSE
//! endpoints, audit logs) subscribe here. Events are delivered through a
//! `broadcast` channel fed by hooks, so a slow receiver lags and loses
//! events instead of stalling the job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::Job;
use crate::model::{JobId, JobState};

/// A structured event emitted by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Sequence number within one subscription. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub job_name: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        from: JobState,
        to: JobState,
    },
    DoneWork {
        previous: u64,
        done: u64,
        total: u64,
    },
    TotalWorkUnits {
        previous: u64,
        total: u64,
    },
    CancelRequested,
    Log {
        message: String,
    },
}

/// Stream `job`'s events from now on.
///
/// The subscription lives as long as the job; dropping every receiver just
/// turns the forwarding hooks into no-ops.
pub fn subscribe(job: &Job, capacity: usize) -> broadcast::Receiver<JobEvent> {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    let seq = Arc::new(AtomicU64::new(0));
    let emit = Arc::new(move |job: &Job, kind: EventKind| {
        // No receivers is fine.
        let _ = tx.send(JobEvent {
            seq: seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            job_id: job.id(),
            job_name: job.name().to_string(),
            kind,
        });
    });

    let e = Arc::clone(&emit);
    job.add_state_hook(move |job, from, to| e(job, EventKind::StateChanged { from, to }));

    let e = Arc::clone(&emit);
    job.add_done_work_hook(move |job, previous| {
        let (done, total) = job.work_units();
        e(
            job,
            EventKind::DoneWork {
                previous,
                done,
                total,
            },
        )
    });

    let e = Arc::clone(&emit);
    job.add_total_work_units_hook(move |job, previous| {
        e(
            job,
            EventKind::TotalWorkUnits {
                previous,
                total: job.total_work_units(),
            },
        )
    });

    let e = Arc::clone(&emit);
    job.add_cancel_hook(move |job| e(job, EventKind::CancelRequested));

    job.add_log_hook(move |job, message| {
        emit(
            job,
            EventKind::Log {
                message: message.to_string(),
            },
        )
    });

    rx
}
