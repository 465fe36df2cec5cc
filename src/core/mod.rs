//! Core scheduling abstractions: jobs, rules, events, and the manager.

pub mod error;
pub mod events;
pub mod job;
pub mod lock;
pub mod manager;
pub mod progress;
pub mod rule;
pub mod worker_pool;

pub use error::{AppResult, JobError};
pub use events::{JobChangeEvent, JobChangeKind, JobChangeListener, ListenerRef};
pub use job::{Job, JobBuilder, JobId, JobState, JobStatus, Priority};
pub use lock::{LockListener, RuleGuard};
pub use manager::JobManager;
pub use progress::{ProgressGroup, ProgressMonitor};
pub use rule::{IdentityRule, MultiRule, RuleRef, SchedulingRule};
pub use worker_pool::WorkerStats;
