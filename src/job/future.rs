//! The asynchronous handle returned by `run()` and `cancel()`.
//!
//! A `JobFuture` settles exactly once, with either `Ok(())` or the
//! [`JobFailure`] the work ended with. Every clone observes the same
//! outcome, and `get()` re-raises a failure on every call.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::JobFailure;

/// Outcome a job's handle settles with.
pub type Outcome = std::result::Result<(), JobFailure>;

type Callback = Box<dyn FnOnce(&Outcome) + Send + 'static>;

#[derive(Clone)]
pub struct JobFuture {
    shared: Arc<Shared>,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    notify: Notify,
}

#[derive(Default)]
struct Slot {
    outcome: Option<Outcome>,
    callbacks: Vec<Callback>,
}

impl JobFuture {
    pub(crate) fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle with `outcome`. Returns false if already settled.
    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut slot = self.slot();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.callbacks)
        };
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Run `callback` once the handle settles, on the settling thread.
    /// Runs it immediately if the handle has already settled.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.slot();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    pub fn is_ready(&self) -> bool {
        self.slot().outcome.is_some()
    }

    /// The outcome, if settled, without blocking.
    pub fn try_get(&self) -> Option<Outcome> {
        self.slot().outcome.clone()
    }

    /// Block until settled.
    pub fn wait(&self) {
        let mut slot = self.slot();
        while slot.outcome.is_none() {
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until settled or `timeout` elapses. Returns whether it settled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        while slot.outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Block until settled and return the outcome.
    pub fn get(&self) -> Outcome {
        self.wait();
        self.try_get().unwrap_or(Ok(()))
    }

    /// Await the outcome without blocking a runtime thread.
    pub async fn join(&self) -> Outcome {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a settle in between is not missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for JobFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}
