//! Scheduler configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_max_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_idle_timeout_secs() -> u64 {
    60
}

/// Scheduler configuration: worker-pool sizing and thread parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrently live worker threads.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Seconds an idle worker waits for work before retiring.
    #[serde(default = "default_idle_timeout_secs")]
    pub worker_idle_timeout_secs: u64,
    /// Stack size for worker threads; `None` uses the platform default.
    #[serde(default)]
    pub thread_stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerConfig {
    /// Create a configuration with defaults: one worker per CPU, a 60 second
    /// idle timeout, platform stack size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_idle_timeout_secs: default_idle_timeout_secs(),
            thread_stack_size: None,
        }
    }

    /// Set the worker-pool ceiling.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the idle timeout after which a worker retires.
    #[must_use]
    pub const fn with_worker_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.worker_idle_timeout_secs = secs;
        self
    }

    /// Set an explicit worker thread stack size in bytes.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// The idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// A description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be greater than 0".into());
        }
        if self.worker_idle_timeout_secs == 0 {
            return Err("worker_idle_timeout_secs must be greater than 0".into());
        }
        if self.thread_stack_size.is_some_and(|s| s < 64 * 1024) {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }

    /// Parse a configuration from a JSON string and validate it.
    ///
    /// # Errors
    ///
    /// A description of the parse failure or of the first invalid field.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
