//! The job: a named unit of progress-reporting, cancellable work.
//!
//! All mutable state of a job (lifecycle state, counters, log buffer, hook
//! lists and, for aggregators, the sub-job table) sits behind one `RwLock`
//! private to that job. Hooks are collected while the lock is held and
//! fired after it is released, so a hook may call into any job, including
//! the one that triggered it.
//!
//! Lock order across a job tree is always parent before child.

pub mod future;
pub mod hooks;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::Span;

use crate::aggregator::{self, Aggregate};
use crate::error::{Error, JobFailure, Result};
use crate::model::{DEFAULT_WORK_UNITS, JobId, JobKind, JobSnapshot, JobState};
use crate::telemetry::{job::record_state_transition, job::start_job_span, metrics};
use crate::worker::{Inline, Worker};

pub use future::{JobFuture, Outcome};
use hooks::{Hooks, Pending};

/// Work executed by a leaf job. It reports progress through the job it is
/// handed and should poll `cancel_requested()` between steps.
pub type Task = Box<dyn FnOnce(&Job) -> anyhow::Result<()> + Send + 'static>;

/// Shared handle to a job. Clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

/// Non-owning reference, held by hooks that point back up a job tree.
#[derive(Clone)]
pub(crate) struct WeakJob(Weak<JobInner>);

impl WeakJob {
    pub(crate) fn upgrade(&self) -> Option<Job> {
        self.0.upgrade().map(|inner| Job { inner })
    }
}

struct JobInner {
    id: JobId,
    name: String,
    kind: JobKind,
    task: Mutex<Option<(Task, Arc<dyn Worker>)>>,
    core: RwLock<Core>,
    future: JobFuture,
    span: Span,
}

pub(crate) struct Core {
    pub(crate) state: JobState,
    pub(crate) done_work_units: u64,
    pub(crate) total_work_units: u64,
    pub(crate) cancel_requested: bool,
    launched: bool,
    started_at: Option<Instant>,
    pub(crate) logs: Vec<String>,
    pub(crate) hooks: Hooks,
    pub(crate) aggregate: Aggregate,
}

/// What `launch` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Launch {
    Started,
    AlreadyLaunched,
    /// Canceled before it ever ran; the handle is already settled.
    Settled,
}

impl Core {
    fn new(state: JobState, total_work_units: u64) -> Self {
        Self {
            state,
            done_work_units: 0,
            total_work_units,
            cancel_requested: false,
            launched: false,
            started_at: (state == JobState::Running).then(Instant::now),
            logs: Vec::new(),
            hooks: Hooks::default(),
            aggregate: Aggregate::default(),
        }
    }

    pub(crate) fn progress(&self) -> f64 {
        if self.total_work_units == 0 {
            0.0
        } else {
            self.done_work_units as f64 / self.total_work_units as f64
        }
    }

    /// Set done work, clamped to the total when the total is measured.
    pub(crate) fn set_done_work_units(&mut self, units: u64, pending: &mut Pending) {
        let previous = self.done_work_units;
        self.done_work_units = if self.total_work_units > 0 {
            units.min(self.total_work_units)
        } else {
            units
        };
        pending.done_work(&self.hooks, previous);
    }

    /// Set the total. A nonzero total below the done count pulls done down.
    pub(crate) fn set_total_work_units(&mut self, units: u64, pending: &mut Pending) {
        let previous = self.total_work_units;
        self.total_work_units = units;
        pending.total_work_units(&self.hooks, previous);

        if units > 0 && self.done_work_units > units {
            let previous_done = self.done_work_units;
            self.done_work_units = units;
            pending.done_work(&self.hooks, previous_done);
        }
    }

    pub(crate) fn append_log(&mut self, message: String, pending: &mut Pending) {
        self.logs.push(message.clone());
        pending.log(&self.hooks, message);
    }
}

impl JobInner {
    /// Move to `to` if the transition table allows it. Telemetry and state
    /// hooks are queued on `pending` and run once the lock is released.
    fn transition(&self, core: &mut Core, to: JobState, pending: &mut Pending) -> bool {
        let from = core.state;
        if !from.can_transition_to(to) {
            return false;
        }
        core.state = to;

        if to == JobState::Running {
            core.started_at = Some(Instant::now());
        }
        let elapsed = core
            .started_at
            .filter(|_| to.is_terminal())
            .map(|started_at| started_at.elapsed());

        pending.transition(from, to, elapsed);
        pending.state(&core.hooks, from, to);
        true
    }
}

impl Job {
    /// Create a leaf job whose work runs on the caller's thread inside `run()`.
    pub fn new<F>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(&Job) -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_worker(name, task, Arc::new(Inline))
    }

    /// Create a leaf job whose work is handed to `worker` by `run()`.
    pub fn with_worker<F>(name: impl Into<String>, task: F, worker: Arc<dyn Worker>) -> Self
    where
        F: FnOnce(&Job) -> anyhow::Result<()> + Send + 'static,
    {
        Self::build(
            name.into(),
            JobKind::Leaf,
            JobState::Waiting,
            DEFAULT_WORK_UNITS,
            Some((Box::new(task), worker)),
        )
    }

    pub(crate) fn build(
        name: String,
        kind: JobKind,
        state: JobState,
        total_work_units: u64,
        task: Option<(Task, Arc<dyn Worker>)>,
    ) -> Self {
        let id = JobId::new();
        let span = start_job_span(kind, &name, &id);
        Self {
            inner: Arc::new(JobInner {
                id,
                name,
                kind,
                task: Mutex::new(task),
                core: RwLock::new(Core::new(state, total_work_units)),
                future: JobFuture::pending(),
                span,
            }),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Core> {
        self.inner
            .core
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Core> {
        self.inner
            .core
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn downgrade(&self) -> WeakJob {
        WeakJob(Arc::downgrade(&self.inner))
    }

    pub(crate) fn future(&self) -> JobFuture {
        self.inner.future.clone()
    }

    /// Span event and metrics for one transition. Called without the lock.
    pub(crate) fn record_transition(
        &self,
        from: JobState,
        to: JobState,
        elapsed: Option<Duration>,
    ) {
        record_state_transition(&self.inner.span, from, to);

        let kind = self.kind().to_string();
        metrics::job_state_transitions().add(
            1,
            &[
                KeyValue::new("kind", kind.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        if let Some(elapsed) = elapsed {
            metrics::job_duration_ms().record(
                elapsed.as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("kind", kind),
                    KeyValue::new("state", to.to_string()),
                ],
            );
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    pub fn state(&self) -> JobState {
        self.read().state
    }

    pub fn done_work_units(&self) -> u64 {
        self.read().done_work_units
    }

    pub fn total_work_units(&self) -> u64 {
        self.read().total_work_units
    }

    /// Done and total work units, read together.
    pub fn work_units(&self) -> (u64, u64) {
        let core = self.read();
        (core.done_work_units, core.total_work_units)
    }

    /// `done / total`, or 0.0 while the total is not measured.
    pub fn progress(&self) -> f64 {
        self.read().progress()
    }

    pub fn cancel_requested(&self) -> bool {
        self.read().cancel_requested
    }

    /// Copy of the log buffer.
    pub fn logs(&self) -> Vec<String> {
        self.read().logs.clone()
    }

    /// Sub-jobs of an aggregator, in registration order. Empty for other kinds.
    pub fn sub_jobs(&self) -> Vec<Job> {
        self.read().aggregate.sub_jobs.clone()
    }

    /// Does this job's subtree contain `id`?
    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.sub_jobs()
            .iter()
            .any(|sub| sub.id() == id || sub.contains(id))
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let (snapshot, sub_jobs) = {
            let core = self.read();
            let snapshot = JobSnapshot {
                id: self.id(),
                name: self.name().to_string(),
                kind: self.kind(),
                state: core.state,
                done_work_units: core.done_work_units,
                total_work_units: core.total_work_units,
                progress: core.progress(),
                cancel_requested: core.cancel_requested,
                sub_jobs: Vec::new(),
            };
            (snapshot, core.aggregate.sub_jobs.clone())
        };
        JobSnapshot {
            sub_jobs: sub_jobs.iter().map(Job::snapshot).collect(),
            ..snapshot
        }
    }

    // -----------------------------------------------------------------------
    // Counters and log
    // -----------------------------------------------------------------------

    /// Set the done work units. Values are not required to increase.
    pub fn done_work(&self, units: u64) {
        let mut pending = Pending::default();
        self.write().set_done_work_units(units, &mut pending);
        pending.fire(self);
    }

    /// Mark all work as done.
    pub fn done(&self) {
        let mut pending = Pending::default();
        {
            let mut core = self.write();
            let total = core.total_work_units;
            core.set_done_work_units(total, &mut pending);
        }
        pending.fire(self);
    }

    pub fn set_total_work_units(&self, units: u64) {
        let mut pending = Pending::default();
        self.write().set_total_work_units(units, &mut pending);
        pending.fire(self);
    }

    /// Set done work to `fraction` of the total, in one critical section.
    pub(crate) fn done_fraction(&self, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut pending = Pending::default();
        {
            let mut core = self.write();
            let units = (fraction * core.total_work_units as f64).round() as u64;
            core.set_done_work_units(units, &mut pending);
        }
        pending.fire(self);
    }

    pub fn log(&self, message: impl Into<String>) {
        let mut pending = Pending::default();
        self.write().append_log(message.into(), &mut pending);
        pending.fire(self);
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    /// Called with the job and its previous done-work value.
    pub fn add_done_work_hook<F>(&self, hook: F)
    where
        F: Fn(&Job, u64) + Send + Sync + 'static,
    {
        self.write().hooks.done_work.push(Arc::new(hook));
    }

    /// Called with the job and its previous total.
    pub fn add_total_work_units_hook<F>(&self, hook: F)
    where
        F: Fn(&Job, u64) + Send + Sync + 'static,
    {
        self.write().hooks.total_work_units.push(Arc::new(hook));
    }

    /// Called once, when cancellation is first requested.
    pub fn add_cancel_hook<F>(&self, hook: F)
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.write().hooks.cancel.push(Arc::new(hook));
    }

    pub fn add_simple_cancel_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_cancel_hook(move |_| hook());
    }

    pub fn add_log_hook<F>(&self, hook: F)
    where
        F: Fn(&Job, &str) + Send + Sync + 'static,
    {
        self.write().hooks.log.push(Arc::new(hook));
    }

    /// Called with the job, the state it left and the state it entered.
    pub fn add_state_hook<F>(&self, hook: F)
    where
        F: Fn(&Job, JobState, JobState) + Send + Sync + 'static,
    {
        self.write().hooks.state.push(Arc::new(hook));
    }

    /// Register a log hook and return the lines logged so far, atomically,
    /// so no line is missed or seen twice.
    pub(crate) fn subscribe_logs<F>(&self, hook: F) -> Vec<String>
    where
        F: Fn(&Job, &str) + Send + Sync + 'static,
    {
        let mut core = self.write();
        core.hooks.log.push(Arc::new(hook));
        core.logs.clone()
    }

    /// Progress reporter for code that only accepts a plain callback.
    pub fn progress_callback(&self) -> impl Fn(u64) + Send + Sync + 'static {
        let job = self.clone();
        move |units| job.done_work(units)
    }

    /// Cancellation check for code that only accepts a plain callback.
    pub fn cancel_requested_callback(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let job = self.clone();
        move || job.cancel_requested()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the job and return its handle.
    ///
    /// A leaf job hands its work to its worker, an aggregator runs all of its
    /// sub-jobs concurrently. A job canceled before it was run returns an
    /// already-settled handle. Running a job a second time is an error.
    pub fn run(&self) -> Result<JobFuture> {
        match self.launch() {
            Launch::AlreadyLaunched => Err(Error::AlreadyStarted(self.name().to_string())),
            Launch::Started | Launch::Settled => Ok(self.future()),
        }
    }

    pub(crate) fn launch(&self) -> Launch {
        let mut pending = Pending::default();
        let launch = {
            let mut core = self.write();
            if core.launched {
                return Launch::AlreadyLaunched;
            }
            core.launched = true;
            match core.state {
                JobState::Waiting => {
                    self.inner
                        .transition(&mut core, JobState::Running, &mut pending);
                    Launch::Started
                }
                // Observers are born running.
                JobState::Running => Launch::Started,
                _ => Launch::Settled,
            }
        };
        pending.fire(self);

        if launch == Launch::Started {
            metrics::jobs_launched().add(1, &[KeyValue::new("kind", self.kind().to_string())]);
            match self.kind() {
                JobKind::Leaf => self.dispatch(),
                JobKind::Observer => {}
                JobKind::Aggregator => aggregator::launch(self),
            }
        }
        launch
    }

    fn take_task(&self) -> Option<(Task, Arc<dyn Worker>)> {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn dispatch(&self) {
        let Some((task, worker)) = self.take_task() else {
            return;
        };
        let job = self.clone();
        worker.execute(Box::new(move || job.execute(task)));
    }

    fn execute(&self, task: Task) {
        let result = self
            .inner
            .span
            .in_scope(|| panic::catch_unwind(AssertUnwindSafe(|| task(self))));
        let outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(JobFailure::new(self.name(), error)),
            Err(payload) => Err(JobFailure::panicked(self.name(), payload)),
        };
        self.complete(outcome);
    }

    /// Move to the terminal state matching `outcome`, then settle the handle.
    pub(crate) fn complete(&self, outcome: Outcome) {
        let mut pending = Pending::default();
        {
            let mut core = self.write();
            let to = terminal_state(self.kind(), outcome.is_ok(), core.cancel_requested);
            self.inner.transition(&mut core, to, &mut pending);
        }
        pending.fire(self);
        self.inner.future.settle(outcome);
    }

    /// Request cancellation and return the job's handle.
    ///
    /// Cooperative: a running job keeps running until its work notices
    /// `cancel_requested()`. Cancel hooks fire on the first effective call
    /// only; canceling a canceling or terminal job does nothing.
    pub fn cancel(&self) -> JobFuture {
        let mut pending = Pending::default();
        let settle = {
            let mut core = self.write();
            match core.state {
                JobState::Waiting => {
                    core.cancel_requested = true;
                    self.inner
                        .transition(&mut core, JobState::Canceled, &mut pending);
                    pending.cancel(&core.hooks);
                    true
                }
                JobState::Running => {
                    core.cancel_requested = true;
                    let to = match self.kind() {
                        JobKind::Observer => JobState::Canceled,
                        _ => JobState::Canceling,
                    };
                    self.inner.transition(&mut core, to, &mut pending);
                    pending.cancel(&core.hooks);
                    to == JobState::Canceled
                }
                _ => false,
            }
        };
        pending.fire(self);

        if settle {
            // Work that never ran releases whatever it captured.
            drop(self.take_task());
            self.inner.future.settle(Ok(()));
        }
        self.future()
    }

    /// Block until the job reaches a terminal state.
    ///
    /// Does not re-raise a failure; use the handle's `get()` for that.
    pub fn wait(&self) -> Result<()> {
        if self.state() == JobState::Waiting {
            return Err(Error::Waiting(self.name().to_string()));
        }
        self.inner.future.wait();
        Ok(())
    }
}

/// State a job ends in once its work has returned.
///
/// An aggregator only carries a sub-job's failure through its handle: it
/// ends finished, or canceled when cancellation was requested.
fn terminal_state(kind: JobKind, succeeded: bool, cancel_requested: bool) -> JobState {
    match kind {
        JobKind::Aggregator if cancel_requested => JobState::Canceled,
        JobKind::Aggregator => JobState::Finished,
        _ if !succeeded => JobState::Failed,
        _ if cancel_requested => JobState::Canceled,
        _ => JobState::Finished,
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Job {}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}
