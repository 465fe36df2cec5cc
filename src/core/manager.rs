//! The job manager: owns the job set, the lifecycle state machine, the timer
//! for delayed jobs, the held-rule table, and listener fan-out.
//!
//! All state transitions are serialized through a single coordinator lock
//! (`ManagerCore::sched`); work functions execute unlocked on worker
//! threads. Suspension points — `join`, `begin_rule`, the worker idle wait,
//! and the delay timer — each wake through the coordinator's condition
//! variables, never by polling scheduler state from the outside.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::error::JobError;
use crate::core::events::{JobChangeEvent, JobChangeKind, ListenerList, ListenerRef};
use crate::core::job::{InternalState, Job, JobBuilder, JobCore, JobStatus};
use crate::core::lock::{LockListener, RuleGuard, RuleTable};
use crate::core::progress::{ProgressGroup, ProgressMonitor};
use crate::core::rule::{rules_conflict, RuleRef};
use crate::core::worker_pool::{self, PoolCounters, WorkerStats};

/// Poll slice for waits that must observe external cancellation (join
/// monitors) or a host that refuses to park (`can_block() == false`).
const WAIT_SLICE: Duration = Duration::from_millis(50);

struct SleepEntry {
    job: Arc<JobCore>,
    /// Absent for jobs put to sleep indefinitely via `sleep()`.
    due: Option<Instant>,
}

/// Everything guarded by the coordinator lock.
pub(crate) struct SchedState {
    waiting: Vec<Arc<JobCore>>,
    sleeping: Vec<SleepEntry>,
    pub(crate) rules: RuleTable,
    registry: Vec<Weak<JobCore>>,
    next_seq: u64,
    pub(crate) total_workers: usize,
    pub(crate) idle_workers: usize,
    shutdown: bool,
}

/// Shared coordinator state behind every [`Job`] and worker thread.
pub(crate) struct ManagerCore {
    pub(crate) config: SchedulerConfig,
    sched: Mutex<SchedState>,
    /// Signaled on every transition: joiners and `begin_rule` waiters.
    change: Condvar,
    /// Signaled when the sleep queue changes or shutdown begins.
    timer_cv: Condvar,
    ready_tx: Mutex<Option<Sender<Arc<JobCore>>>>,
    pub(crate) ready_rx: Receiver<Arc<JobCore>>,
    global_listeners: ListenerList,
    lock_listener: RwLock<Option<Arc<dyn LockListener>>>,
    pub(crate) counters: PoolCounters,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The coordinator: schedules jobs onto a bounded worker pool while
/// guaranteeing mutual exclusion between jobs whose rules conflict.
///
/// Create one per process scope with [`JobManager::new`] and shut it down
/// with [`JobManager::shutdown`] at teardown. Jobs are created through
/// [`JobManager::job`] and keep the manager's internals alive for as long as
/// any handle exists.
pub struct JobManager {
    core: Arc<ManagerCore>,
}

impl JobManager {
    /// Create a manager with a validated configuration. The timer thread
    /// starts immediately; workers are spawned lazily on demand.
    ///
    /// # Errors
    ///
    /// [`JobError::InvalidConfig`] when the configuration fails validation.
    pub fn new(config: SchedulerConfig) -> Result<Self, JobError> {
        config.validate().map_err(JobError::InvalidConfig)?;
        let (ready_tx, ready_rx) = unbounded();
        let core = Arc::new(ManagerCore {
            config,
            sched: Mutex::new(SchedState {
                waiting: Vec::new(),
                sleeping: Vec::new(),
                rules: RuleTable::default(),
                registry: Vec::new(),
                next_seq: 0,
                total_workers: 0,
                idle_workers: 0,
                shutdown: false,
            }),
            change: Condvar::new(),
            timer_cv: Condvar::new(),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx,
            global_listeners: ListenerList::new(),
            lock_listener: RwLock::new(None),
            counters: PoolCounters::default(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let timer_core = Arc::clone(&core);
        let timer = thread::Builder::new()
            .name("jobs-timer".into())
            .spawn(move || timer_loop(&timer_core))
            .expect("Failed to spawn timer thread");
        core.threads.lock().push(timer);

        info!(
            max_workers = core.config.max_workers,
            idle_timeout_secs = core.config.worker_idle_timeout_secs,
            "job manager initialized"
        );
        Ok(Self { core })
    }

    /// Create a manager with the default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(SchedulerConfig::new()).expect("default configuration is valid")
    }

    /// Start configuring a new job with the given name.
    #[must_use]
    pub fn job(&self, name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(Arc::clone(&self.core), name.into())
    }

    /// Create a progress group for sharing one monitor across several jobs.
    #[must_use]
    pub fn create_progress_group(&self) -> ProgressGroup {
        ProgressGroup::new()
    }

    /// Register a listener observing every job of this manager.
    pub fn add_listener(&self, listener: ListenerRef) {
        self.core.global_listeners.add(listener);
    }

    /// Remove a global listener by handle identity.
    pub fn remove_listener(&self, listener: &ListenerRef) {
        self.core.global_listeners.remove(listener);
    }

    /// Install (or clear) the lock listener consulted before any thread
    /// blocks on a rule or a join.
    pub fn set_lock_listener(&self, listener: Option<Arc<dyn LockListener>>) {
        *self.core.lock_listener.write() = listener;
    }

    /// Acquire `rule` for the calling thread, blocking until no conflicting
    /// rule is held. Reentrant for rules contained in one this thread
    /// already holds. Every `begin_rule` must be balanced by an
    /// [`end_rule`](Self::end_rule) with the same rule on the same thread.
    ///
    /// # Errors
    ///
    /// [`JobError::RuleMismatch`] when the thread already holds an unrelated
    /// rule; [`JobError::Shutdown`] when the manager stops while waiting.
    pub fn begin_rule(&self, rule: &RuleRef) -> Result<(), JobError> {
        begin_rule(&self.core, rule)
    }

    /// Release the innermost [`begin_rule`](Self::begin_rule) of the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// [`JobError::RuleMismatch`] when `rule` does not match the innermost
    /// acquisition.
    pub fn end_rule(&self, rule: &RuleRef) -> Result<(), JobError> {
        end_rule(&self.core, rule)
    }

    /// Scoped variant of [`begin_rule`](Self::begin_rule): the returned
    /// guard releases the rule when dropped, on all exit paths.
    ///
    /// # Errors
    ///
    /// Same as [`begin_rule`](Self::begin_rule).
    pub fn acquire_rule(&self, rule: &RuleRef) -> Result<RuleGuard, JobError> {
        begin_rule(&self.core, rule)?;
        Ok(RuleGuard {
            manager: Arc::clone(&self.core),
            rule: Some(Arc::clone(rule)),
        })
    }

    /// All scheduled, sleeping, or running jobs belonging to `family`.
    #[must_use]
    pub fn find(&self, family: &str) -> Vec<Job> {
        family_members(&self.core, family)
    }

    /// Cancel every job belonging to `family`.
    pub fn cancel_family(&self, family: &str) {
        for job in family_members(&self.core, family) {
            cancel_job(&job.core);
        }
    }

    /// Block until no job of `family` is scheduled or running.
    ///
    /// # Errors
    ///
    /// [`JobError::JoinCanceled`] when `monitor` is canceled while waiting;
    /// [`JobError::SelfJoin`] when a family member is the calling job.
    pub fn join_family(
        &self,
        family: &str,
        monitor: &ProgressMonitor,
    ) -> Result<(), JobError> {
        loop {
            let Some(job) = family_members(&self.core, family).into_iter().next() else {
                return Ok(());
            };
            join_job(&job.core, None, Some(monitor))?;
        }
    }

    /// Snapshot of worker-pool utilization.
    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        let sched = self.core.sched.lock();
        self.core.counters.snapshot(
            self.core.config.max_workers,
            sched.total_workers,
            sched.idle_workers,
        )
    }

    /// Shut down: cancel pending work, request cooperative cancellation of
    /// running jobs, stop the timer, and retire all workers (with a bounded
    /// join per thread; stragglers are detached).
    pub fn shutdown(&self) {
        shutdown_core(&self.core, true);
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        // Signal but do not join: workers detach and the OS reclaims them.
        if !self.core.shutdown.load(Ordering::Acquire) {
            debug!("job manager dropped without explicit shutdown");
            shutdown_core(&self.core, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Event fan-out
// ---------------------------------------------------------------------------

fn fire(
    core: &Arc<ManagerCore>,
    job: &Arc<JobCore>,
    kind: JobChangeKind,
    delay: Option<Duration>,
    result: Option<JobStatus>,
    reschedule: bool,
) {
    if core.global_listeners.is_empty() && job.listeners.is_empty() {
        return;
    }
    let event = JobChangeEvent::new(Job::from_core(Arc::clone(job)), delay, result, reschedule);
    core.global_listeners.fire(kind, &event);
    job.listeners.fire(kind, &event);
}

// ---------------------------------------------------------------------------
// Registration and scheduling
// ---------------------------------------------------------------------------

pub(crate) fn register_job(core: &Arc<ManagerCore>, job: &Arc<JobCore>) {
    let mut sched = core.sched.lock();
    if sched.registry.len() > 64 {
        sched.registry.retain(|w| w.strong_count() > 0);
    }
    sched.registry.push(Arc::downgrade(job));
}

pub(crate) fn schedule_job(job: &Arc<JobCore>, delay: Duration) {
    let core = &job.manager;
    if core.shutdown.load(Ordering::Acquire) {
        warn!(job = %job.name, "schedule ignored: manager is shut down");
        return;
    }

    {
        let mut sched = core.sched.lock();
        let mut meta = job.meta.lock();
        match meta.state {
            InternalState::Running | InternalState::AboutToRun => {
                // Collapses: only the latest requested delay survives.
                meta.pending = Some(delay);
                debug!(job = %job.name, ?delay, "reschedule recorded for running job");
                return;
            }
            InternalState::Waiting => return,
            InternalState::Sleeping => {
                // Re-arm the delay window.
                if delay.is_zero() {
                    drop(meta);
                    promote_sleeping_locked(&mut sched, job);
                    dispatch_locked(core, &mut sched);
                } else if let Some(entry) =
                    sched.sleeping.iter_mut().find(|e| Arc::ptr_eq(&e.job, job))
                {
                    entry.due = Some(Instant::now() + delay);
                    core.timer_cv.notify_all();
                }
                return;
            }
            InternalState::None => {
                meta.run_canceled = false;
                sched.next_seq += 1;
                meta.seq = sched.next_seq;
                if delay.is_zero() {
                    meta.state = InternalState::Waiting;
                    drop(meta);
                    sched.waiting.push(Arc::clone(job));
                } else {
                    meta.state = InternalState::Sleeping;
                    drop(meta);
                    sched.sleeping.push(SleepEntry {
                        job: Arc::clone(job),
                        due: Some(Instant::now() + delay),
                    });
                    core.timer_cv.notify_all();
                }
            }
        }
    }

    debug!(job = %job.name, ?delay, "job scheduled");
    fire(core, job, JobChangeKind::Scheduled, Some(delay), None, false);

    let mut sched = core.sched.lock();
    dispatch_locked(core, &mut sched);
}

/// Move a sleeping job to the waiting set. Caller holds the coordinator
/// lock and must run the dispatcher afterwards.
fn promote_sleeping_locked(sched: &mut SchedState, job: &Arc<JobCore>) {
    sched.sleeping.retain(|e| !Arc::ptr_eq(&e.job, job));
    let mut meta = job.meta.lock();
    meta.state = InternalState::Waiting;
    sched.next_seq += 1;
    meta.seq = sched.next_seq;
    drop(meta);
    sched.waiting.push(Arc::clone(job));
}

pub(crate) fn sleep_job(job: &Arc<JobCore>) -> bool {
    let core = &job.manager;
    let mut sched = core.sched.lock();
    let mut meta = job.meta.lock();
    match meta.state {
        InternalState::None | InternalState::Sleeping => true,
        InternalState::Waiting => {
            meta.state = InternalState::Sleeping;
            drop(meta);
            sched.waiting.retain(|j| !Arc::ptr_eq(j, job));
            sched.sleeping.push(SleepEntry {
                job: Arc::clone(job),
                due: None,
            });
            true
        }
        InternalState::AboutToRun | InternalState::Running => false,
    }
}

pub(crate) fn wake_up_job(job: &Arc<JobCore>, delay: Duration) {
    let core = &job.manager;
    let mut sched = core.sched.lock();
    {
        let meta = job.meta.lock();
        if meta.state != InternalState::Sleeping {
            return;
        }
    }
    if delay.is_zero() {
        promote_sleeping_locked(&mut sched, job);
        dispatch_locked(core, &mut sched);
    } else if let Some(entry) = sched.sleeping.iter_mut().find(|e| Arc::ptr_eq(&e.job, job)) {
        entry.due = Some(Instant::now() + delay);
        core.timer_cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

pub(crate) fn cancel_job(job: &Arc<JobCore>) -> bool {
    let core = &job.manager;

    enum Outcome {
        Idle,
        Stopped { surrender: Option<(ProgressGroup, f64)> },
        Vetoing,
        Cooperative {
            monitor: Option<ProgressMonitor>,
            fire_hook: bool,
        },
    }

    let outcome = {
        let mut sched = core.sched.lock();
        let mut meta = job.meta.lock();
        match meta.state {
            InternalState::None => Outcome::Idle,
            InternalState::Waiting | InternalState::Sleeping => {
                meta.state = InternalState::None;
                meta.result = Some(JobStatus::Cancel);
                meta.pending = None;
                let surrender = meta.group.clone();
                drop(meta);
                sched.waiting.retain(|j| !Arc::ptr_eq(j, job));
                sched.sleeping.retain(|e| !Arc::ptr_eq(&e.job, job));
                Outcome::Stopped { surrender }
            }
            InternalState::AboutToRun => {
                // The dispatch in flight observes this and aborts.
                meta.run_canceled = true;
                Outcome::Vetoing
            }
            InternalState::Running => {
                let fire_hook = !meta.canceling_fired;
                meta.canceling_fired = true;
                Outcome::Cooperative {
                    monitor: meta.monitor.clone(),
                    fire_hook,
                }
            }
        }
    };

    match outcome {
        Outcome::Idle => true,
        Outcome::Stopped { surrender } => {
            debug!(job = %job.name, "canceled before running");
            // A canceled claim reports its full allocation to the group so
            // the shared accounting still completes.
            if let Some((group, ticks)) = surrender {
                group.monitor().worked(ticks);
            }
            fire(
                core,
                job,
                JobChangeKind::Done,
                None,
                Some(JobStatus::Cancel),
                false,
            );
            bump_done(core, job);
            true
        }
        Outcome::Vetoing => false,
        Outcome::Cooperative { monitor, fire_hook } => {
            if let Some(monitor) = monitor {
                monitor.set_canceled();
            }
            if fire_hook {
                if let Some(hook) = &job.canceling {
                    if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                        error!(job = %job.name, "canceling hook panicked; ignored");
                    }
                }
            }
            false
        }
    }
}

/// Mark one dispatch cycle complete and wake joiners. Runs after the `done`
/// event so a successful join implies the event has fired; the wake itself
/// never depends on listener code completing normally.
fn bump_done(core: &Arc<ManagerCore>, job: &Arc<JobCore>) {
    let _sched = core.sched.lock();
    job.meta.lock().done_count += 1;
    core.change.notify_all();
}

// ---------------------------------------------------------------------------
// Dispatch and execution
// ---------------------------------------------------------------------------

/// Admission: repeatedly pick the best waiting job whose rule conflicts with
/// nothing held, mark its rule held, and hand it to a worker. Runs under the
/// coordinator lock.
fn dispatch_locked(core: &Arc<ManagerCore>, sched: &mut SchedState) {
    if sched.shutdown {
        return;
    }
    loop {
        let mut best: Option<(usize, (crate::core::job::Priority, std::cmp::Reverse<u64>))> =
            None;
        for (i, candidate) in sched.waiting.iter().enumerate() {
            let meta = candidate.meta.lock();
            if let Some(rule) = &meta.rule {
                if sched.rules.conflicts_any(rule) {
                    continue;
                }
            }
            let key = (meta.priority, std::cmp::Reverse(meta.seq));
            if best.as_ref().map_or(true, |(_, k)| key > *k) {
                best = Some((i, key));
            }
        }
        let Some((index, _)) = best else { break };
        let job = sched.waiting.remove(index);
        {
            let mut meta = job.meta.lock();
            meta.state = InternalState::AboutToRun;
            if let Some(rule) = &meta.rule {
                sched.rules.acquire_job(job.id, Arc::clone(rule));
            }
        }
        let sent = core
            .ready_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Arc::clone(&job)).is_ok());
        if !sent {
            // Shutting down; put it back and let the drain path cancel it.
            job.meta.lock().state = InternalState::Waiting;
            sched.rules.release_job(job.id);
            sched.waiting.push(job);
            break;
        }
        core.counters.note_dispatched();
        debug!(job = %job.name, "job dispatched");
        worker_pool::ensure_worker(core, sched);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "work function panicked".into())
}

/// One full dispatch cycle on a worker thread: pre-run protocol, execution,
/// completion. Fired events run on this thread, unlocked.
pub(crate) fn execute_cycle(core: &Arc<ManagerCore>, job: &Arc<JobCore>) {
    if core.shutdown.load(Ordering::Acquire) {
        finish_cycle(core, job, JobStatus::Cancel);
        return;
    }
    fire(core, job, JobChangeKind::AboutToRun, None, None, false);

    // A listener (or racing caller) may have canceled inside the pre-run
    // window; the work function must never be invoked then.
    let vetoed = {
        let _sched = core.sched.lock();
        job.meta.lock().run_canceled
    };
    if vetoed {
        debug!(job = %job.name, "dispatch vetoed before run");
        finish_cycle(core, job, JobStatus::Cancel);
        return;
    }

    // Last-minute gate, evaluated unlocked; failure counts as a veto.
    if let Some(hook) = &job.should_run {
        let go = catch_unwind(AssertUnwindSafe(|| hook())).unwrap_or_else(|_| {
            error!(job = %job.name, "should_run panicked; treated as false");
            false
        });
        if !go {
            finish_cycle(core, job, JobStatus::Cancel);
            return;
        }
    }

    let monitor = {
        let mut sched = core.sched.lock();
        let mut meta = job.meta.lock();
        if meta.run_canceled {
            drop(meta);
            drop(sched);
            finish_cycle(core, job, JobStatus::Cancel);
            return;
        }
        let monitor = match &meta.group {
            Some((group, ticks)) => group.claim(*ticks),
            None => ProgressMonitor::new(),
        };
        meta.state = InternalState::Running;
        meta.thread = Some(thread::current());
        meta.monitor = Some(monitor.clone());
        sched
            .rules
            .set_job_thread(job.id, Some(thread::current().id()));
        monitor
    };
    fire(core, job, JobChangeKind::Running, None, None, false);

    let outcome = {
        let mut run = job.run_fn.lock();
        catch_unwind(AssertUnwindSafe(|| (*run)(&monitor)))
    };
    core.counters.note_executed();
    let result = match outcome {
        Ok(status) => status,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(job = %job.name, %message, "work function failed");
            JobStatus::Failed(message)
        }
    };

    if result == JobStatus::AsyncFinish {
        // The job continues on a caller-managed thread until `done`.
        let early = {
            let mut meta = job.meta.lock();
            if let Some(early) = meta.early_async_done.take() {
                Some(early)
            } else {
                meta.async_run = true;
                None
            }
        };
        match early {
            // `done` already arrived from the handover thread.
            Some(result) => finish_cycle(core, job, result),
            None => debug!(job = %job.name, "job continues asynchronously"),
        }
        return;
    }
    // A `done` that raced a synchronous run must not leak into a later
    // asynchronous cycle.
    if job.meta.lock().early_async_done.take().is_some() {
        warn!(job = %job.name, "discarding done result: cycle did not finish asynchronously");
    }
    finish_cycle(core, job, result);
}

/// Terminal step of a cycle that holds a dispatched rule: release the rule,
/// record the result, fire `done`, wake joiners, re-run admission, and apply
/// a pending reschedule.
fn finish_cycle(core: &Arc<ManagerCore>, job: &Arc<JobCore>, result: JobStatus) {
    let pending = {
        let mut sched = core.sched.lock();
        let mut meta = job.meta.lock();
        meta.result = Some(result.clone());
        meta.state = InternalState::None;
        meta.thread = None;
        meta.monitor = None;
        meta.canceling_fired = false;
        meta.run_canceled = false;
        meta.async_run = false;
        meta.early_async_done = None;
        let pending = meta.pending.take();
        drop(meta);
        if sched.rules.release_job(job.id) {
            core.change.notify_all();
        }
        pending
    };

    debug!(job = %job.name, ?result, reschedule = pending.is_some(), "job finished");
    fire(
        core,
        job,
        JobChangeKind::Done,
        None,
        Some(result),
        pending.is_some(),
    );
    bump_done(core, job);

    {
        let mut sched = core.sched.lock();
        dispatch_locked(core, &mut sched);
    }
    if let Some(delay) = pending {
        schedule_job(job, delay);
    }
}

// ---------------------------------------------------------------------------
// Async handover
// ---------------------------------------------------------------------------

pub(crate) fn set_job_thread(job: &Arc<JobCore>, thread: Thread) {
    let core = &job.manager;
    let mut sched = core.sched.lock();
    let mut meta = job.meta.lock();
    sched.rules.set_job_thread(job.id, Some(thread.id()));
    meta.thread = Some(thread);
}

pub(crate) fn finish_async_job(job: &Arc<JobCore>, result: JobStatus) -> Result<(), JobError> {
    let core = &job.manager;
    {
        let mut meta = job.meta.lock();
        if meta.state != InternalState::Running {
            return Err(JobError::NotAsync);
        }
        if !meta.async_run {
            // The worker has not yet observed the `AsyncFinish` return;
            // park the result for it to finalize with.
            meta.early_async_done = Some(result);
            return Ok(());
        }
    }
    finish_cycle(core, job, result);
    Ok(())
}

// ---------------------------------------------------------------------------
// Join protocol
// ---------------------------------------------------------------------------

pub(crate) fn join_job(
    job: &Arc<JobCore>,
    timeout: Option<Duration>,
    monitor: Option<&ProgressMonitor>,
) -> Result<bool, JobError> {
    let core = &job.manager;
    let target = {
        let meta = job.meta.lock();
        if meta.state == InternalState::None {
            return Ok(true);
        }
        if matches!(
            meta.state,
            InternalState::Running | InternalState::AboutToRun
        ) {
            let current = thread::current().id();
            if meta.thread.as_ref().is_some_and(|t| t.id() == current) {
                return Err(JobError::SelfJoin);
            }
        }
        meta.done_count
    };

    let deadline = timeout.map(|t| Instant::now() + t);
    let listener = core.lock_listener.read().clone();
    let mut announced = false;

    let verdict = loop {
        if monitor.is_some_and(ProgressMonitor::is_canceled) {
            break Err(JobError::JoinCanceled);
        }
        let mut sched = core.sched.lock();
        if job.meta.lock().done_count != target {
            break Ok(true);
        }
        if core.shutdown.load(Ordering::Acquire) {
            break Err(JobError::Shutdown);
        }
        let mut slice = WAIT_SLICE;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                break Ok(false);
            }
            slice = slice.min(deadline - now);
        }
        if !announced {
            if let Some(l) = &listener {
                let owner = job.meta.lock().thread.as_ref().map(Thread::id);
                // Consult the host without holding the coordinator.
                drop(sched);
                l.about_to_wait(owner);
                announced = true;
                continue;
            }
            announced = true;
        }
        core.change.wait_for(&mut sched, slice);
    };

    if announced {
        if let Some(l) = &listener {
            l.about_to_release();
        }
    }
    verdict
}

// ---------------------------------------------------------------------------
// Progress groups and blocking queries
// ---------------------------------------------------------------------------

pub(crate) fn set_job_progress_group(job: &Arc<JobCore>, group: &ProgressGroup, ticks: f64) {
    let mut meta = job.meta.lock();
    match meta.state {
        InternalState::None | InternalState::Sleeping => {
            meta.group = Some((group.clone(), ticks));
        }
        _ => {
            warn!(job = %job.name, "progress group ignored: job already waiting or running");
        }
    }
}

pub(crate) fn job_is_blocking(job: &Arc<JobCore>) -> bool {
    let core = &job.manager;
    let sched = core.sched.lock();
    let (rule, priority) = {
        let meta = job.meta.lock();
        if !matches!(
            meta.state,
            InternalState::Running | InternalState::AboutToRun
        ) {
            return false;
        }
        let Some(rule) = meta.rule.clone() else {
            return false;
        };
        (rule, meta.priority)
    };
    // Threads parked in an implicit acquisition have no priority to compare;
    // withholding a rule from them always counts as blocking.
    if sched.rules.blocked_thread_conflicts(&rule) {
        return true;
    }
    sched.waiting.iter().any(|waiter| {
        let meta = waiter.meta.lock();
        !meta.system
            && meta.priority > priority
            && meta
                .rule
                .as_ref()
                .is_some_and(|r| rules_conflict(r, &rule))
    })
}

fn family_members(core: &Arc<ManagerCore>, family: &str) -> Vec<Job> {
    let sched = core.sched.lock();
    sched
        .registry
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|job| {
            job.family.as_ref().is_some_and(|f| f(family))
                && job.meta.lock().state != InternalState::None
        })
        .map(Job::from_core)
        .collect()
}

// ---------------------------------------------------------------------------
// Implicit rule locking
// ---------------------------------------------------------------------------

pub(crate) fn begin_rule(core: &Arc<ManagerCore>, rule: &RuleRef) -> Result<(), JobError> {
    let tid = thread::current().id();
    let listener = core.lock_listener.read().clone();
    let mut waited = false;

    let mut sched = core.sched.lock();
    if sched.rules.try_nest(tid, rule)? {
        return Ok(());
    }
    loop {
        if sched.shutdown {
            return Err(JobError::Shutdown);
        }
        let blocker = sched.rules.conflicting_for_thread(rule, tid).map(HeldOwner::of);
        let Some(owner) = blocker else {
            sched.rules.acquire_thread(tid, Arc::clone(rule));
            break;
        };
        sched.rules.mark_blocked(tid, Arc::clone(rule));
        let can_block = if let Some(l) = &listener {
            // The host is consulted unlocked; it may pump its own events.
            drop(sched);
            l.about_to_wait(owner.0);
            waited = true;
            let can_block = l.can_block();
            sched = core.sched.lock();
            can_block
        } else {
            waited = true;
            true
        };
        // The blocker may have released while the host was consulted.
        if sched.rules.conflicting_for_thread(rule, tid).is_some() {
            if can_block {
                core.change.wait(&mut sched);
            } else {
                core.change.wait_for(&mut sched, WAIT_SLICE);
            }
        }
        sched.rules.unmark_blocked(tid);
    }
    drop(sched);

    if waited {
        if let Some(l) = &listener {
            l.about_to_release();
        }
    }
    Ok(())
}

/// Owning thread of a held rule, extracted before the coordinator lock is
/// released.
struct HeldOwner(Option<ThreadId>);

impl HeldOwner {
    fn of(held: &crate::core::lock::HeldRule) -> Self {
        Self(held.owner_thread())
    }
}

pub(crate) fn end_rule(core: &Arc<ManagerCore>, rule: &RuleRef) -> Result<(), JobError> {
    let tid = thread::current().id();
    let mut sched = core.sched.lock();
    let released = sched.rules.release_thread(tid, rule)?;
    if released {
        core.change.notify_all();
        dispatch_locked(core, &mut sched);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Timer and shutdown
// ---------------------------------------------------------------------------

/// Single timer thread advancing sleeping jobs to waiting at their due time.
fn timer_loop(core: &Arc<ManagerCore>) {
    loop {
        let mut sched = core.sched.lock();
        if sched.shutdown {
            break;
        }
        let now = Instant::now();
        let due_jobs: Vec<Arc<JobCore>> = sched
            .sleeping
            .iter()
            .filter(|e| e.due.is_some_and(|d| d <= now))
            .map(|e| Arc::clone(&e.job))
            .collect();
        if !due_jobs.is_empty() {
            for job in &due_jobs {
                debug!(job = %job.name, "delay elapsed");
                promote_sleeping_locked(&mut sched, job);
            }
            dispatch_locked(core, &mut sched);
            continue;
        }
        match sched.sleeping.iter().filter_map(|e| e.due).min() {
            Some(due) => {
                core.timer_cv.wait_for(&mut sched, due.saturating_duration_since(now));
            }
            None => core.timer_cv.wait(&mut sched),
        }
    }
    debug!("timer thread exiting");
}

fn shutdown_core(core: &Arc<ManagerCore>, join_threads: bool) {
    if core.shutdown.swap(true, Ordering::AcqRel) {
        return;
    }
    info!("shutting down job manager");

    let (drained, running_monitors) = {
        let mut sched = core.sched.lock();
        sched.shutdown = true;
        let mut drained: Vec<Arc<JobCore>> = sched.waiting.drain(..).collect();
        drained.extend(sched.sleeping.drain(..).map(|e| e.job));
        for job in &drained {
            let mut meta = job.meta.lock();
            meta.state = InternalState::None;
            meta.result = Some(JobStatus::Cancel);
            meta.pending = None;
        }
        let monitors: Vec<ProgressMonitor> = sched
            .registry
            .iter()
            .filter_map(Weak::upgrade)
            .filter_map(|job| job.meta.lock().monitor.clone())
            .collect();
        core.timer_cv.notify_all();
        core.change.notify_all();
        (drained, monitors)
    };

    for monitor in running_monitors {
        monitor.set_canceled();
    }
    for job in &drained {
        fire(
            core,
            job,
            JobChangeKind::Done,
            None,
            Some(JobStatus::Cancel),
            false,
        );
        job.meta.lock().done_count += 1;
    }
    core.change.notify_all();

    // Drop the sender: idle workers unblock and exit once the channel drains.
    {
        *core.ready_tx.lock() = None;
    }

    if !join_threads {
        return;
    }
    let handles: Vec<JoinHandle<()>> = core.threads.lock().drain(..).collect();
    for (idx, handle) in handles.into_iter().enumerate() {
        let (tx, rx) = std::sync::mpsc::channel();
        let joiner = thread::spawn(move || {
            let ok = handle.join().is_ok();
            let _ = tx.send(ok);
        });
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(true) => debug!(thread = idx, "scheduler thread joined"),
            Ok(false) => warn!(thread = idx, "scheduler thread panicked"),
            Err(_) => warn!(thread = idx, "scheduler thread did not exit in time; detaching"),
        }
        let _ = joiner.join();
    }
    info!("job manager shut down");
}

/// Track a freshly spawned worker/timer thread for shutdown joining.
pub(crate) fn track_thread(core: &Arc<ManagerCore>, handle: JoinHandle<()>) {
    core.threads.lock().push(handle);
}

/// Accessor used by the worker loop for idle bookkeeping.
pub(crate) fn sched_state<'a>(
    core: &'a Arc<ManagerCore>,
) -> parking_lot::MutexGuard<'a, SchedState> {
    core.sched.lock()
}
