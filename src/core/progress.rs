//! Progress reporting and cooperative cancellation.
//!
//! A [`ProgressMonitor`] is handed to every work function. It carries a
//! monotonic cancellation flag (once set, never cleared) and work-unit
//! accounting, and can be split into nested child monitors for composite
//! tasks. A [`ProgressGroup`] is a monitor shared by several jobs, each
//! claiming a fixed tick allocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Accounting {
    task_name: Option<String>,
    total_work: f64,
    worked: f64,
}

#[derive(Debug)]
struct ParentLink {
    inner: Arc<MonitorInner>,
    /// Ticks of the parent allocated to this child.
    ticks: f64,
    /// Ticks already forwarded to the parent.
    sent: Mutex<f64>,
}

#[derive(Debug)]
struct MonitorInner {
    /// Shared with every child and, for grouped jobs, with the group.
    canceled: Arc<AtomicBool>,
    acct: Mutex<Accounting>,
    parent: Option<ParentLink>,
}

/// Cancellation flag plus work-unit accounting for a single unit of work.
///
/// Handles are cheap to clone; all clones observe the same state. The work
/// function is expected to poll [`is_canceled`](Self::is_canceled) and wind
/// down cooperatively; the scheduler never terminates a running job by force.
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressMonitor {
    /// Create a standalone monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Create a monitor whose cancellation state is the given shared flag.
    pub(crate) fn with_flag(canceled: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                canceled,
                acct: Mutex::new(Accounting::default()),
                parent: None,
            }),
        }
    }

    /// Begin a named task expected to take `total_work` units.
    pub fn begin_task(&self, name: impl Into<String>, total_work: f64) {
        let mut acct = self.inner.acct.lock();
        acct.task_name = Some(name.into());
        acct.total_work = total_work.max(0.0);
    }

    /// Report `units` of completed work.
    pub fn worked(&self, units: f64) {
        if units <= 0.0 {
            return;
        }
        let forward = {
            let mut acct = self.inner.acct.lock();
            acct.worked += units;
            self.inner.parent.as_ref().map(|link| {
                // Scale into the parent's allocation, capped at the claim.
                let share = if acct.total_work > 0.0 {
                    link.ticks * units / acct.total_work
                } else {
                    0.0
                };
                let mut sent = link.sent.lock();
                let send = share.min(link.ticks - *sent).max(0.0);
                *sent += send;
                (Self { inner: Arc::clone(&link.inner) }, send)
            })
        };
        if let Some((parent, send)) = forward {
            if send > 0.0 {
                parent.worked(send);
            }
        }
    }

    /// Mark the task finished, forwarding any unreported allocation to the
    /// parent monitor.
    pub fn done(&self) {
        let forward = self.inner.parent.as_ref().map(|link| {
            let mut sent = link.sent.lock();
            let remainder = (link.ticks - *sent).max(0.0);
            *sent = link.ticks;
            (Self { inner: Arc::clone(&link.inner) }, remainder)
        });
        if let Some((parent, remainder)) = forward {
            if remainder > 0.0 {
                parent.worked(remainder);
            }
        }
    }

    /// Request cooperative cancellation. Monotonic: there is no way to clear
    /// the flag once set.
    pub fn set_canceled(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Split off a child monitor consuming `ticks` of this monitor's
    /// allocation. The child shares this monitor's cancellation flag.
    #[must_use]
    pub fn split(&self, ticks: f64) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                canceled: Arc::clone(&self.inner.canceled),
                acct: Mutex::new(Accounting::default()),
                parent: Some(ParentLink {
                    inner: Arc::clone(&self.inner),
                    ticks: ticks.max(0.0),
                    sent: Mutex::new(0.0),
                }),
            }),
        }
    }

    /// The name passed to [`begin_task`](Self::begin_task), if any.
    #[must_use]
    pub fn task_name(&self) -> Option<String> {
        self.inner.acct.lock().task_name.clone()
    }

    /// Units reported so far.
    #[must_use]
    pub fn worked_units(&self) -> f64 {
        self.inner.acct.lock().worked
    }
}

/// A progress scope shared across several jobs.
///
/// Created by [`JobManager::create_progress_group`]; each participating job
/// claims a tick allocation via [`Job::set_progress_group`]. Cancelling the
/// group cancels the claim of every job that has not started yet, and a job
/// that begins running afterwards observes the cancellation through its own
/// monitor.
///
/// [`JobManager::create_progress_group`]: crate::core::JobManager::create_progress_group
/// [`Job::set_progress_group`]: crate::core::Job::set_progress_group
#[derive(Debug, Clone)]
pub struct ProgressGroup {
    monitor: ProgressMonitor,
}

impl Default for ProgressGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressGroup {
    pub(crate) fn new() -> Self {
        Self {
            monitor: ProgressMonitor::new(),
        }
    }

    /// The shared monitor. `begin_task` on it with the combined tick count
    /// of all participating jobs.
    #[must_use]
    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    /// Cancel the whole group.
    pub fn cancel(&self) {
        self.monitor.set_canceled();
    }

    /// Whether the group has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.monitor.is_canceled()
    }

    /// Claim `ticks` of the group for one job's run.
    pub(crate) fn claim(&self, ticks: f64) -> ProgressMonitor {
        self.monitor.split(ticks)
    }
}
