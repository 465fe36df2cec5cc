//! Jobs: named, prioritized, cancellable units of work.
//!
//! A [`Job`] is a cheap handle over shared state owned jointly by the caller
//! and the [`JobManager`](crate::core::JobManager). Jobs are reusable: after
//! a cycle finishes (state back to `None`) the same job may be scheduled
//! again indefinitely.

use std::fmt;
use std::sync::Arc;
use std::thread::Thread;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::error::JobError;
use crate::core::events::{ListenerList, ListenerRef};
use crate::core::manager::{self, ManagerCore};
use crate::core::progress::{ProgressGroup, ProgressMonitor};
use crate::core::rule::RuleRef;

/// Opaque job identity, stable across reschedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Starting-point ordering hint for waiting jobs. Higher variants are
/// dispatched first; this is not preemption — a running job is never paused
/// for a more urgent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Lowest: cosmetic work.
    Decorate,
    /// Long-running background work.
    #[default]
    Long,
    /// Build-class work.
    Build,
    /// Short background work.
    Short,
    /// Highest: the user is actively waiting on this.
    Interactive,
}

/// Externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Not scheduled (initial and terminal state of every cycle).
    None,
    /// Scheduled with an unexpired delay, or explicitly put to sleep.
    Sleeping,
    /// Eligible to run, pending admission by the rule resolver.
    Waiting,
    /// Executing (includes the transient pre-run window).
    Running,
}

/// Internal state, distinguishing the pre-run window during which listeners
/// may still veto the dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalState {
    None,
    Sleeping,
    Waiting,
    AboutToRun,
    Running,
}

impl InternalState {
    pub(crate) fn public(self) -> JobState {
        match self {
            Self::None => JobState::None,
            Self::Sleeping => JobState::Sleeping,
            Self::Waiting => JobState::Waiting,
            Self::AboutToRun | Self::Running => JobState::Running,
        }
    }
}

/// The result of one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// The work function completed normally.
    Ok,
    /// The cycle was canceled (before or during execution).
    Cancel,
    /// The work function failed; the payload describes the failure.
    Failed(String),
    /// The work function handed execution over to a caller-managed thread;
    /// the job stays running until [`Job::done`] is called.
    AsyncFinish,
}

pub(crate) type RunFn = Box<dyn FnMut(&ProgressMonitor) -> JobStatus + Send>;
pub(crate) type ShouldRunFn = Box<dyn Fn() -> bool + Send + Sync>;
pub(crate) type CancelingFn = Box<dyn Fn() + Send + Sync>;
pub(crate) type FamilyFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Mutable scheduling state. Transitions are serialized through the
/// manager's coordinator lock; this inner mutex only guards field access.
pub(crate) struct JobMeta {
    pub(crate) state: InternalState,
    pub(crate) priority: Priority,
    pub(crate) system: bool,
    pub(crate) user: bool,
    pub(crate) rule: Option<RuleRef>,
    pub(crate) result: Option<JobStatus>,
    /// Thread currently owning the run (worker, or the thread an async job
    /// handed itself to).
    pub(crate) thread: Option<Thread>,
    /// Monitor of the active run; target of cooperative cancellation.
    pub(crate) monitor: Option<ProgressMonitor>,
    /// Delay of a reschedule requested while running; collapses to the
    /// latest request and is applied once when the cycle finishes.
    pub(crate) pending: Option<Duration>,
    /// Set when `cancel` arrives in the pre-run window; aborts the dispatch.
    pub(crate) run_canceled: bool,
    /// The canceling hook fires at most once per active run.
    pub(crate) canceling_fired: bool,
    /// The current cycle returned `AsyncFinish` and awaits `done`.
    pub(crate) async_run: bool,
    /// Result delivered by `done` before the worker observed the
    /// `AsyncFinish` return; the worker finalizes the cycle with it.
    pub(crate) early_async_done: Option<JobStatus>,
    pub(crate) group: Option<(ProgressGroup, f64)>,
    /// FIFO tie-break sequence, assigned when the job becomes waiting.
    pub(crate) seq: u64,
    /// Completed dispatch cycles; the join protocol waits on this.
    pub(crate) done_count: u64,
}

pub(crate) struct JobCore {
    pub(crate) id: JobId,
    pub(crate) name: String,
    pub(crate) manager: Arc<ManagerCore>,
    pub(crate) run_fn: Mutex<RunFn>,
    pub(crate) should_run: Option<ShouldRunFn>,
    pub(crate) canceling: Option<CancelingFn>,
    pub(crate) family: Option<FamilyFn>,
    pub(crate) listeners: ListenerList,
    pub(crate) meta: Mutex<JobMeta>,
}

/// A schedulable, cancellable unit of work with a result.
///
/// Handles are cheap to clone and all clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    pub(crate) core: Arc<JobCore>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Job {
    /// The job's stable identity.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.core.id
    }

    /// The human-readable name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Schedule the job to run as soon as a worker and its rule allow.
    pub fn schedule(&self) {
        manager::schedule_job(&self.core, Duration::ZERO);
    }

    /// Schedule the job to become eligible after `delay`.
    pub fn schedule_delayed(&self, delay: Duration) {
        manager::schedule_job(&self.core, delay);
    }

    /// Cancel the job.
    ///
    /// A waiting or sleeping job stops immediately (its `done` event fires
    /// with a cancel result and the work function is never invoked); a
    /// running job is asked to stop cooperatively through its monitor.
    ///
    /// Returns `true` when the job is fully stopped on return, `false` when
    /// it is still winding down cooperatively.
    pub fn cancel(&self) -> bool {
        manager::cancel_job(&self.core)
    }

    /// Put a waiting job to sleep indefinitely (until [`wake_up`]).
    ///
    /// Returns `false` if the job is already running and can no longer be
    /// put to sleep.
    ///
    /// [`wake_up`]: Self::wake_up
    pub fn sleep(&self) -> bool {
        manager::sleep_job(&self.core)
    }

    /// Move a sleeping job to the waiting set immediately.
    pub fn wake_up(&self) {
        manager::wake_up_job(&self.core, Duration::ZERO);
    }

    /// Re-arm a sleeping job's delay.
    pub fn wake_up_delayed(&self, delay: Duration) {
        manager::wake_up_job(&self.core, delay);
    }

    /// Block until the dispatch cycle in flight at call time completes.
    ///
    /// Returns immediately if the job is not scheduled or running.
    ///
    /// # Errors
    ///
    /// [`JobError::SelfJoin`] when called from the job's own work function.
    pub fn join(&self) -> Result<(), JobError> {
        manager::join_job(&self.core, None, None).map(|_| ())
    }

    /// [`join`](Self::join) with a timeout and a cancellation monitor.
    ///
    /// Returns `Ok(true)` on completion, `Ok(false)` on timeout (the job may
    /// still be running).
    ///
    /// # Errors
    ///
    /// [`JobError::JoinCanceled`] when `monitor` is canceled while waiting;
    /// [`JobError::SelfJoin`] for a self-join.
    pub fn join_timeout(
        &self,
        timeout: Duration,
        monitor: &ProgressMonitor,
    ) -> Result<bool, JobError> {
        manager::join_job(&self.core, Some(timeout), Some(monitor))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.core.meta.lock().state.public()
    }

    /// Result of the most recently completed cycle, if any.
    #[must_use]
    pub fn result(&self) -> Option<JobStatus> {
        self.core.meta.lock().result.clone()
    }

    /// The thread currently owning the job's execution, if running.
    #[must_use]
    pub fn thread(&self) -> Option<Thread> {
        self.core.meta.lock().thread.clone()
    }

    /// Record the thread a job running with [`JobStatus::AsyncFinish`] has
    /// handed itself to, so [`thread`](Self::thread) reflects it.
    pub fn set_thread(&self, thread: Thread) {
        manager::set_job_thread(&self.core, thread);
    }

    /// Complete a cycle that previously returned [`JobStatus::AsyncFinish`].
    ///
    /// # Errors
    ///
    /// [`JobError::NotAsync`] if the job is not in an async run.
    pub fn done(&self, result: JobStatus) -> Result<(), JobError> {
        manager::finish_async_job(&self.core, result)
    }

    /// Set the scheduling rule. Immutable once scheduled: allowed only while
    /// the job is in the `None` state.
    ///
    /// # Errors
    ///
    /// [`JobError::RuleInUse`] while the job is waiting, sleeping, or
    /// running.
    pub fn set_rule(&self, rule: Option<RuleRef>) -> Result<(), JobError> {
        let mut meta = self.core.meta.lock();
        if meta.state != InternalState::None {
            return Err(JobError::RuleInUse);
        }
        meta.rule = rule;
        Ok(())
    }

    /// The job's scheduling rule, if any.
    #[must_use]
    pub fn rule(&self) -> Option<RuleRef> {
        self.core.meta.lock().rule.clone()
    }

    /// Set the dispatch priority; effective from the next admission check.
    pub fn set_priority(&self, priority: Priority) {
        self.core.meta.lock().priority = priority;
    }

    /// Current dispatch priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.core.meta.lock().priority
    }

    /// Attach the job to a progress group, claiming `ticks` of it.
    ///
    /// Only honored while the job is in the `None` or `Sleeping` state;
    /// otherwise the request is logged and ignored.
    pub fn set_progress_group(&self, group: &ProgressGroup, ticks: f64) {
        manager::set_job_progress_group(&self.core, group, ticks);
    }

    /// Whether this running job is preventing a strictly-higher-priority
    /// non-system job (or a thread blocked in an implicit rule acquisition)
    /// from proceeding.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        manager::job_is_blocking(&self.core)
    }

    /// Whether this is a system job (excluded from user-visible progress and
    /// from blocking consideration).
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.core.meta.lock().system
    }

    /// Mark the job as a system job.
    pub fn set_system(&self, system: bool) {
        self.core.meta.lock().system = system;
    }

    /// Whether this job was initiated directly by a user.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.core.meta.lock().user
    }

    /// Mark the job as user-initiated.
    pub fn set_user(&self, user: bool) {
        self.core.meta.lock().user = user;
    }

    /// Whether the job belongs to `family` (the builder's `family`
    /// predicate; `false` without one).
    #[must_use]
    pub fn belongs_to(&self, family: &str) -> bool {
        self.core.family.as_ref().is_some_and(|f| f(family))
    }

    /// Register a listener observing only this job.
    pub fn add_listener(&self, listener: ListenerRef) {
        self.core.listeners.add(listener);
    }

    /// Remove a previously registered local listener (by handle identity).
    pub fn remove_listener(&self, listener: &ListenerRef) {
        self.core.listeners.remove(listener);
    }

    pub(crate) fn from_core(core: Arc<JobCore>) -> Self {
        Self { core }
    }
}

/// Configures and creates a [`Job`]. Obtained from
/// [`JobManager::job`](crate::core::JobManager::job).
pub struct JobBuilder {
    manager: Arc<ManagerCore>,
    name: String,
    run_fn: Option<RunFn>,
    should_run: Option<ShouldRunFn>,
    canceling: Option<CancelingFn>,
    family: Option<FamilyFn>,
    rule: Option<RuleRef>,
    priority: Priority,
    system: bool,
    user: bool,
}

impl JobBuilder {
    pub(crate) fn new(manager: Arc<ManagerCore>, name: String) -> Self {
        Self {
            manager,
            name,
            run_fn: None,
            should_run: None,
            canceling: None,
            family: None,
            rule: None,
            priority: Priority::default(),
            system: false,
            user: false,
        }
    }

    /// The work function, invoked with the run's monitor on a worker thread.
    #[must_use]
    pub fn work(
        mut self,
        f: impl FnMut(&ProgressMonitor) -> JobStatus + Send + 'static,
    ) -> Self {
        self.run_fn = Some(Box::new(f));
        self
    }

    /// Last-minute veto consulted once per dispatch attempt; returning
    /// `false` (or panicking) skips the run for that cycle.
    #[must_use]
    pub fn should_run(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.should_run = Some(Box::new(f));
        self
    }

    /// Notification hook invoked once per run when cancellation of the
    /// running job is requested.
    #[must_use]
    pub fn on_canceling(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.canceling = Some(Box::new(f));
        self
    }

    /// Family membership predicate for bulk `find`/`cancel`/`join`.
    #[must_use]
    pub fn family(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.family = Some(Box::new(f));
        self
    }

    /// Scheduling rule declaring the job's resource footprint.
    #[must_use]
    pub fn rule(mut self, rule: RuleRef) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Dispatch priority (defaults to [`Priority::Long`]).
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as a system job.
    #[must_use]
    pub fn system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    /// Mark as user-initiated.
    #[must_use]
    pub fn user(mut self, user: bool) -> Self {
        self.user = user;
        self
    }

    /// Create the job in the `None` state.
    ///
    /// # Errors
    ///
    /// [`JobError::EmptyName`] if the name is empty.
    pub fn build(self) -> Result<Job, JobError> {
        if self.name.is_empty() {
            return Err(JobError::EmptyName);
        }
        let core = Arc::new(JobCore {
            id: JobId::new(),
            name: self.name,
            manager: Arc::clone(&self.manager),
            run_fn: Mutex::new(
                self.run_fn
                    .unwrap_or_else(|| Box::new(|_monitor| JobStatus::Ok)),
            ),
            should_run: self.should_run,
            canceling: self.canceling,
            family: self.family,
            listeners: ListenerList::new(),
            meta: Mutex::new(JobMeta {
                state: InternalState::None,
                priority: self.priority,
                system: self.system,
                user: self.user,
                rule: self.rule,
                result: None,
                thread: None,
                monitor: None,
                pending: None,
                run_canceled: false,
                canceling_fired: false,
                async_run: false,
                early_async_done: None,
                group: None,
                seq: 0,
                done_count: 0,
            }),
        });
        manager::register_job(&self.manager, &core);
        Ok(Job::from_core(core))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Interactive > Priority::Short);
        assert!(Priority::Short > Priority::Build);
        assert!(Priority::Build > Priority::Long);
        assert!(Priority::Long > Priority::Decorate);
        assert_eq!(Priority::default(), Priority::Long);
    }

    #[test]
    fn test_internal_state_projection() {
        assert_eq!(InternalState::AboutToRun.public(), JobState::Running);
        assert_eq!(InternalState::Running.public(), JobState::Running);
        assert_eq!(InternalState::None.public(), JobState::None);
        assert_eq!(InternalState::Sleeping.public(), JobState::Sleeping);
        assert_eq!(InternalState::Waiting.public(), JobState::Waiting);
    }
}
