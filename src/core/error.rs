//! Error types for scheduler operations.

use thiserror::Error;

/// Usage errors produced by scheduler components.
///
/// These signal caller mistakes immediately and never leave the scheduler in
/// a corrupted state. Failures inside a job's work function are not errors at
/// this level; they are captured as the job's result.
#[derive(Debug, Error)]
pub enum JobError {
    /// A job must carry a non-empty, human-readable name.
    #[error("job name must not be empty")]
    EmptyName,
    /// A job tried to join itself from within its own work function.
    #[error("cannot join a job from its own thread")]
    SelfJoin,
    /// The scheduling rule may only be changed while the job is idle.
    #[error("rule can only be set while the job is idle (state NONE)")]
    RuleInUse,
    /// `end_rule` did not match the innermost `begin_rule` on this thread.
    #[error("mismatched end_rule: {0}")]
    RuleMismatch(String),
    /// A join wait was canceled through the supplied progress monitor.
    #[error("join canceled")]
    JoinCanceled,
    /// `done` was called on a job that is not running asynchronously.
    #[error("job is not running asynchronously")]
    NotAsync,
    /// The manager has been shut down.
    #[error("job manager has been shut down")]
    Shutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
