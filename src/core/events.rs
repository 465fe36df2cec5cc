//! Job lifecycle events and the panic-isolating listener registry.
//!
//! Listeners are ordered observers registered with the manager (global) or
//! with a single job (local). A listener failure is logged and contained; it
//! never prevents later listeners from running and never stalls the state
//! machine — joiners are woken by the scheduler itself, not by listener code.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::error;

use crate::core::job::{Job, JobStatus};

/// Which lifecycle callback an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobChangeKind {
    /// The job was scheduled (possibly with a delay).
    Scheduled,
    /// The job is about to be run; cancelling here vetoes the run.
    AboutToRun,
    /// The job has started running.
    Running,
    /// The job finished a dispatch cycle.
    Done,
}

/// Payload delivered to [`JobChangeListener`] callbacks.
#[derive(Debug, Clone)]
pub struct JobChangeEvent {
    job: Job,
    at_ms: u128,
    delay: Option<Duration>,
    result: Option<JobStatus>,
    reschedule: bool,
}

impl JobChangeEvent {
    pub(crate) fn new(
        job: Job,
        delay: Option<Duration>,
        result: Option<JobStatus>,
        reschedule: bool,
    ) -> Self {
        Self {
            job,
            at_ms: crate::util::clock::now_ms(),
            delay,
            result,
            reschedule,
        }
    }

    /// The job the event concerns.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Wall-clock time the event fired, in milliseconds since the Unix
    /// epoch.
    #[must_use]
    pub fn timestamp_ms(&self) -> u128 {
        self.at_ms
    }

    /// For `scheduled` events: the requested delay.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// For `done` events: the result of the finished cycle.
    #[must_use]
    pub fn result(&self) -> Option<&JobStatus> {
        self.result.as_ref()
    }

    /// For `done` events: whether the job will be scheduled again
    /// immediately (a reschedule was requested during the run).
    #[must_use]
    pub fn is_reschedule(&self) -> bool {
        self.reschedule
    }
}

/// An ordered observer of job lifecycle transitions.
///
/// All callbacks default to no-ops so implementers override only what they
/// need. Callbacks run on scheduler-internal threads and must not block for
/// long; panics are caught and logged.
pub trait JobChangeListener: Send + Sync {
    /// The job was scheduled.
    fn scheduled(&self, event: &JobChangeEvent) {
        let _ = event;
    }

    /// The job is about to run. Calling `event.job().cancel()` here aborts
    /// the dispatch: the work function will not be invoked and `done` fires
    /// with a cancel result.
    fn about_to_run(&self, event: &JobChangeEvent) {
        let _ = event;
    }

    /// The job's work function has started.
    fn running(&self, event: &JobChangeEvent) {
        let _ = event;
    }

    /// The job finished a cycle. Rescheduling the job from here is allowed.
    fn done(&self, event: &JobChangeEvent) {
        let _ = event;
    }
}

/// Shared handle to a listener, used for identity-based removal.
pub type ListenerRef = Arc<dyn JobChangeListener>;

/// Ordered listener set with isolated delivery.
#[derive(Default)]
pub struct ListenerList {
    listeners: RwLock<Vec<ListenerRef>>,
}

impl ListenerList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Duplicate registrations deliver duplicate events.
    pub(crate) fn add(&self, listener: ListenerRef) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener by handle identity. Safe to call from inside a
    /// callback; in-flight deliveries use a snapshot of the registry.
    pub(crate) fn remove(&self, listener: &ListenerRef) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Deliver `event` to every registered listener in order. Each callback
    /// is individually guarded: a panic is logged and the loop continues.
    pub(crate) fn fire(&self, kind: JobChangeKind, event: &JobChangeEvent) {
        let snapshot: Vec<ListenerRef> = self.listeners.read().clone();
        for listener in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
                JobChangeKind::Scheduled => listener.scheduled(event),
                JobChangeKind::AboutToRun => listener.about_to_run(event),
                JobChangeKind::Running => listener.running(event),
                JobChangeKind::Done => listener.done(event),
            }));
            if outcome.is_err() {
                error!(
                    job = %event.job().name(),
                    callback = ?kind,
                    "job change listener panicked; continuing"
                );
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}
