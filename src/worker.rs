//! Executors for leaf-job work.
//!
//! Jobs never create threads themselves. A leaf job hands its work to a
//! [`Worker`]: [`Inline`] runs it on the caller's thread before `run()`
//! returns, a tokio runtime [`Handle`] runs it on the blocking pool.

use tokio::runtime::Handle;

/// A unit of work handed to a worker.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

pub trait Worker: Send + Sync {
    fn execute(&self, work: Work);
}

/// Runs work synchronously on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Worker for Inline {
    fn execute(&self, work: Work) {
        work()
    }
}

impl Worker for Handle {
    fn execute(&self, work: Work) {
        // Detached: completion is reported through the job's own handle.
        drop(self.spawn_blocking(work));
    }
}
