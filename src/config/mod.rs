//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every variable is optional; a variable that is
//! set but does not parse is an error rather than a silent default.

use std::num::NonZeroUsize;

use crate::error::{Error, Result};

/// Default capacity of an event subscription.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Blocking threads available to jobs run on the tokio worker
    /// (`JOBS_WORKER_THREADS`, default: available parallelism).
    pub worker_threads: usize,
    /// Buffer size for `event::subscribe` (`JOBS_EVENT_CAPACITY`).
    pub event_capacity: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker_threads = match lookup("JOBS_WORKER_THREADS") {
            Some(value) => positive("JOBS_WORKER_THREADS", &value)?,
            None => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        };
        let event_capacity = match lookup("JOBS_EVENT_CAPACITY") {
            Some(value) => positive("JOBS_EVENT_CAPACITY", &value)?,
            None => DEFAULT_EVENT_CAPACITY,
        };

        Ok(Self {
            worker_threads,
            event_capacity,
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|endpoint| !endpoint.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn positive(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<NonZeroUsize>()
        .map(NonZeroUsize::get)
        .map_err(|e| Error::Config(format!("{name}={value:?} is not a positive integer: {e}")))
}
