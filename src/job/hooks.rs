//! Hook lists and deferred hook delivery.
//!
//! Updates to a job are made under its lock, but hooks are only collected
//! there. [`Pending`] carries them out of the critical section and fires
//! them once the lock is gone.

use std::sync::Arc;
use std::time::Duration;

use super::Job;
use crate::model::JobState;

/// Fired with the previous done-work value.
pub type DoneWorkHook = Arc<dyn Fn(&Job, u64) + Send + Sync>;
/// Fired with the previous total-work value.
pub type TotalWorkUnitsHook = Arc<dyn Fn(&Job, u64) + Send + Sync>;
/// Fired with the job being canceled.
pub type CancelHook = Arc<dyn Fn(&Job) + Send + Sync>;
/// Fired with each appended log line.
pub type LogHook = Arc<dyn Fn(&Job, &str) + Send + Sync>;
/// Fired with the state left and the state entered.
pub type StateHook = Arc<dyn Fn(&Job, JobState, JobState) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) done_work: Vec<DoneWorkHook>,
    pub(crate) total_work_units: Vec<TotalWorkUnitsHook>,
    pub(crate) cancel: Vec<CancelHook>,
    pub(crate) log: Vec<LogHook>,
    pub(crate) state: Vec<StateHook>,
}

enum Notification {
    Transition {
        from: JobState,
        to: JobState,
        elapsed: Option<Duration>,
    },
    DoneWork(Vec<DoneWorkHook>, u64),
    TotalWorkUnits(Vec<TotalWorkUnitsHook>, u64),
    Cancel(Vec<CancelHook>),
    Log(Vec<LogHook>, String),
    State(Vec<StateHook>, JobState, JobState),
}

/// Notifications queued while a job's lock is held.
#[derive(Default)]
pub(crate) struct Pending {
    notifications: Vec<Notification>,
}

impl Pending {
    pub(crate) fn done_work(&mut self, hooks: &Hooks, previous: u64) {
        if !hooks.done_work.is_empty() {
            self.notifications
                .push(Notification::DoneWork(hooks.done_work.clone(), previous));
        }
    }

    pub(crate) fn total_work_units(&mut self, hooks: &Hooks, previous: u64) {
        if !hooks.total_work_units.is_empty() {
            self.notifications.push(Notification::TotalWorkUnits(
                hooks.total_work_units.clone(),
                previous,
            ));
        }
    }

    pub(crate) fn cancel(&mut self, hooks: &Hooks) {
        if !hooks.cancel.is_empty() {
            self.notifications
                .push(Notification::Cancel(hooks.cancel.clone()));
        }
    }

    pub(crate) fn log(&mut self, hooks: &Hooks, message: String) {
        if !hooks.log.is_empty() {
            self.notifications
                .push(Notification::Log(hooks.log.clone(), message));
        }
    }

    /// Always queued, hooks or not: transitions are traced and counted.
    pub(crate) fn transition(&mut self, from: JobState, to: JobState, elapsed: Option<Duration>) {
        self.notifications
            .push(Notification::Transition { from, to, elapsed });
    }

    pub(crate) fn state(&mut self, hooks: &Hooks, from: JobState, to: JobState) {
        if !hooks.state.is_empty() {
            self.notifications
                .push(Notification::State(hooks.state.clone(), from, to));
        }
    }

    /// Fire everything, in the order it was queued. Must be called without
    /// holding `job`'s lock.
    pub(crate) fn fire(self, job: &Job) {
        for notification in self.notifications {
            match notification {
                Notification::Transition { from, to, elapsed } => {
                    job.record_transition(from, to, elapsed)
                }
                Notification::DoneWork(hooks, previous) => {
                    hooks.iter().for_each(|hook| hook(job, previous))
                }
                Notification::TotalWorkUnits(hooks, previous) => {
                    hooks.iter().for_each(|hook| hook(job, previous))
                }
                Notification::Cancel(hooks) => hooks.iter().for_each(|hook| hook(job)),
                Notification::Log(hooks, message) => {
                    hooks.iter().for_each(|hook| hook(job, &message))
                }
                Notification::State(hooks, from, to) => {
                    hooks.iter().for_each(|hook| hook(job, from, to))
                }
            }
        }
    }
}
