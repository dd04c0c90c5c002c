//! Composite jobs.
//!
//! An aggregator presents a tree of sub-jobs as a single job. A sub-job
//! added with weight `w` is worth `norm = round(w * 100)` units: it adds
//! `norm` to the aggregator's total while its own total is measured, and
//! `round(norm * progress)` to the aggregator's done count. That last value
//! is cached per sub-job so each progress tick only applies a delta.
//!
//! Hooks installed on a sub-job hold a weak reference to the aggregator and
//! the sub-job's [`JobId`]; they look the cached entry up on every call.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{Error, Result};
use crate::job::hooks::Pending;
use crate::job::{Core, Job, JobFuture, Outcome, WeakJob};
use crate::model::{JobId, JobKind, JobState, NORMALIZED_SCALE};
use crate::telemetry::metrics;

/// Sub-job table, kept inside the aggregator's own core.
#[derive(Default)]
pub(crate) struct Aggregate {
    pub(crate) sub_jobs: Vec<Job>,
    infos: HashMap<JobId, JobInfo>,
    /// Sum of every registered norm. Bounds both aggregate counters.
    committed: u64,
}

/// What a sub-job currently contributes to its aggregator.
#[derive(Debug, Clone, Copy)]
struct JobInfo {
    norm: u64,
    last_value: u64,
    had_total_work: bool,
}

/// A job whose counters are the weighted union of its sub-jobs' counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregator {
    job: Job,
}

impl Aggregator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            job: Job::build(
                name.into(),
                JobKind::Aggregator,
                JobState::Waiting,
                0,
                None,
            ),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Register `sub` with the given weight.
    ///
    /// Allowed while the aggregator is waiting or running. Sub-jobs added
    /// after `run()` count towards progress but are not run by it.
    pub fn add(&self, sub: &Job, weight: f64) -> Result<()> {
        let this = &self.job;
        if sub.id() == this.id() {
            return Err(Error::SelfAggregation(this.name().to_string()));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(Error::InvalidWeight(weight));
        }
        if sub.contains(this.id()) {
            return Err(Error::Cycle {
                aggregator: this.name().to_string(),
                sub: sub.name().to_string(),
            });
        }

        let norm = (weight * NORMALIZED_SCALE).round() as u64;
        let mut pending = Pending::default();
        {
            let mut core = this.write();
            if !matches!(core.state, JobState::Waiting | JobState::Running) {
                return Err(Error::InvalidState {
                    aggregator: this.name().to_string(),
                    state: core.state,
                });
            }
            if core.aggregate.infos.contains_key(&sub.id()) {
                return Err(Error::AlreadyRegistered {
                    aggregator: this.name().to_string(),
                    sub: sub.name().to_string(),
                });
            }
            // Checked before anything is installed on the sub-job.
            let Some(committed) = core.aggregate.committed.checked_add(norm) else {
                return Err(Error::WeightOverflow {
                    aggregator: this.name().to_string(),
                    sub: sub.name().to_string(),
                    weight,
                });
            };
            core.aggregate.committed = committed;

            // Hooks go in before the sub-job is sampled: an update landing in
            // between blocks on our lock and reconciles once we are done.
            let parent = this.downgrade();
            sub.add_done_work_hook({
                let parent = parent.clone();
                move |sub, _| reconcile(&parent, sub)
            });
            sub.add_total_work_units_hook({
                let parent = parent.clone();
                move |sub, _| reconcile(&parent, sub)
            });
            let logs = sub.subscribe_logs(move |sub, message| {
                if let Some(parent) = parent.upgrade() {
                    parent.log(prefixed(sub.name(), message));
                }
            });

            let (done, total) = sub.work_units();
            let had_total_work = total > 0;
            let last_value = scaled(norm, done, total);

            let new_total = core
                .total_work_units
                .saturating_add(if had_total_work { norm } else { 0 });
            let new_done = core.done_work_units.saturating_add(last_value);
            apply_counters(&mut core, new_total, new_done, &mut pending);

            core.aggregate.infos.insert(
                sub.id(),
                JobInfo {
                    norm,
                    last_value,
                    had_total_work,
                },
            );
            core.aggregate.sub_jobs.push(sub.clone());

            let target = sub.clone();
            core.hooks.cancel.push(Arc::new(move |_: &Job| {
                target.cancel();
            }));

            for line in logs {
                core.append_log(prefixed(sub.name(), &line), &mut pending);
            }
        }
        pending.fire(this);

        metrics::sub_jobs_added().add(1, &[]);
        debug!(
            aggregator = %this.name(),
            sub_job = %sub.name(),
            weight,
            norm,
            "sub-job added"
        );
        Ok(())
    }
}

impl Deref for Aggregator {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.job
    }
}

impl AsRef<Job> for Aggregator {
    fn as_ref(&self) -> &Job {
        &self.job
    }
}

impl From<Aggregator> for Job {
    fn from(aggregator: Aggregator) -> Job {
        aggregator.job
    }
}

fn prefixed(name: &str, message: &str) -> String {
    format!("[{name}] {message}")
}

/// `round(norm * done / total)`, zero while the total is not measured.
fn scaled(norm: u64, done: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (norm as f64 * done as f64 / total as f64).round() as u64
}

/// Apply new counters without a transient done > total: a growing total is
/// applied before done, a shrinking one after it.
fn apply_counters(core: &mut Core, total: u64, done: u64, pending: &mut Pending) {
    if total >= core.total_work_units {
        if total != core.total_work_units {
            core.set_total_work_units(total, pending);
        }
        if done != core.done_work_units {
            core.set_done_work_units(done, pending);
        }
    } else {
        if done != core.done_work_units {
            core.set_done_work_units(done, pending);
        }
        core.set_total_work_units(total, pending);
    }
}

/// Bring the aggregator's counters in line with `sub`'s current counters.
fn reconcile(parent: &WeakJob, sub: &Job) {
    let Some(parent) = parent.upgrade() else {
        return;
    };
    let mut pending = Pending::default();
    {
        let mut core = parent.write();
        let Some(info) = core.aggregate.infos.get(&sub.id()).copied() else {
            return;
        };
        let (done, total) = sub.work_units();
        let has_total_work = total > 0;
        let last_value = scaled(info.norm, done, total);

        let mut new_total = core.total_work_units;
        if has_total_work && !info.had_total_work {
            new_total = new_total.saturating_add(info.norm);
        } else if !has_total_work && info.had_total_work {
            new_total = new_total.saturating_sub(info.norm);
        }
        // Add before subtracting so the unsigned sum never dips below zero.
        // Only a sum past u64::MAX falls back to subtracting first.
        let new_done = match core.done_work_units.checked_add(last_value) {
            Some(sum) => sum.saturating_sub(info.last_value),
            None => core.done_work_units.saturating_sub(info.last_value) + last_value,
        };

        core.aggregate.infos.insert(
            sub.id(),
            JobInfo {
                last_value,
                had_total_work: has_total_work,
                ..info
            },
        );
        apply_counters(&mut core, new_total, new_done, &mut pending);
    }
    pending.fire(&parent);
}

/// Run every sub-job registered so far and complete `this` once all of
/// them have settled, with the first failure in registration order.
pub(crate) fn launch(this: &Job) {
    let sub_jobs = this.sub_jobs();
    let futures: Arc<Vec<JobFuture>> = Arc::new(
        sub_jobs
            .iter()
            .map(|sub| {
                // Already running elsewhere: join it instead.
                sub.launch();
                sub.future()
            })
            .collect(),
    );

    if futures.is_empty() {
        this.complete(Ok(()));
        return;
    }

    let remaining = Arc::new(AtomicUsize::new(futures.len()));
    for future in futures.iter() {
        let remaining = Arc::clone(&remaining);
        let futures = Arc::clone(&futures);
        // Strong: a running aggregator lives until its sub-jobs settle.
        let this = this.clone();
        future.on_settled(move |_| {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                this.complete(first_failure(&futures));
            }
        });
    }
}

fn first_failure(futures: &[JobFuture]) -> Outcome {
    futures
        .iter()
        .find_map(|future| future.try_get().and_then(std::result::Result::err))
        .map_or(Ok(()), Err)
}
