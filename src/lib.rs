//! # Conflict Jobs
//!
//! A cooperative job scheduler with conflict-based rule locking on a bounded,
//! lazily grown worker pool.
//!
//! Work is expressed as named, prioritized, cancellable [`Job`]s. Each job
//! may declare a [`SchedulingRule`] describing the resources it touches; the
//! scheduler guarantees that two jobs whose rules conflict never run at the
//! same time, while non-conflicting jobs run in parallel up to the configured
//! worker ceiling.
//!
//! ## Key Features
//!
//! - **Lifecycle state machine**: jobs move through sleeping, waiting, and
//!   running states and are reusable across any number of schedule cycles
//! - **Rule-based mutual exclusion**: hierarchical conflict detection with
//!   reentrant implicit locking (`begin_rule`/`end_rule`) for plain threads
//! - **Bounded worker pool**: workers are spawned on demand and retire after
//!   an idle timeout, so a quiescent scheduler holds no threads
//! - **Cooperative cancellation**: a running job is asked to stop through its
//!   progress monitor, never terminated by force
//! - **Lifecycle events**: panic-isolated listeners observe scheduling,
//!   execution, and completion, globally or per job
//! - **Join protocol**: any thread can wait for a job, with optional timeout
//!   and cancellation
//!
//! ```rust
//! use conflict_jobs::config::SchedulerConfig;
//! use conflict_jobs::core::{JobManager, JobStatus};
//!
//! let manager = JobManager::new(SchedulerConfig::new()).unwrap();
//! let job = manager
//!     .job("index rebuild")
//!     .work(|monitor| {
//!         monitor.begin_task("rebuilding", 100.0);
//!         for _ in 0..100 {
//!             if monitor.is_canceled() {
//!                 return JobStatus::Cancel;
//!             }
//!             monitor.worked(1.0);
//!         }
//!         JobStatus::Ok
//!     })
//!     .build()
//!     .unwrap();
//!
//! job.schedule();
//! job.join().unwrap();
//! assert_eq!(job.result(), Some(JobStatus::Ok));
//! manager.shutdown();
//! ```
//!
//! For complete examples, see `tests/` and `README.md`.
//!
//! [`Job`]: core::Job
//! [`SchedulingRule`]: core::SchedulingRule

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: jobs, rules, events, and the manager.
pub mod core;
/// Configuration models for the scheduler and its worker pool.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Shared utilities.
pub mod util;
