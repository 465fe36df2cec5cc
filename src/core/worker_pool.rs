//! Lazily grown, idle-retiring pool of worker threads.
//!
//! Workers are spawned on demand when dispatched jobs outrun the idle
//! workers, up to the configured maximum. A worker that stays idle past the
//! configured timeout retires, so a quiescent scheduler holds no threads
//! beyond the timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::RecvTimeoutError;
use tracing::debug;

use crate::core::manager::{self, ManagerCore, SchedState};

/// Monotonic pool counters, updated lock-free from worker threads.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    spawned: AtomicU64,
    retired: AtomicU64,
    dispatched: AtomicU64,
    executed: AtomicU64,
}

impl PoolCounters {
    /// Returns the ordinal of the new worker, used for thread naming.
    fn note_spawned(&self) -> u64 {
        self.spawned.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn note_retired(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        max_workers: usize,
        live_workers: usize,
        idle_workers: usize,
    ) -> WorkerStats {
        WorkerStats {
            max_workers,
            live_workers,
            idle_workers,
            spawned: self.spawned.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time utilization snapshot, from
/// [`JobManager::worker_stats`](crate::core::JobManager::worker_stats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    /// Configured upper bound on concurrently live workers.
    pub max_workers: usize,
    /// Workers currently alive (idle or executing).
    pub live_workers: usize,
    /// Workers currently parked waiting for a job.
    pub idle_workers: usize,
    /// Workers spawned over the manager's lifetime.
    pub spawned: u64,
    /// Workers retired after their idle timeout.
    pub retired: u64,
    /// Jobs handed to the pool.
    pub dispatched: u64,
    /// Work functions actually invoked.
    pub executed: u64,
}

/// Spawn a worker when the ready queue outruns the idle workers. Runs under
/// the coordinator lock.
pub(crate) fn ensure_worker(core: &Arc<ManagerCore>, sched: &mut SchedState) {
    if core.ready_rx.len() <= sched.idle_workers
        || sched.total_workers >= core.config.max_workers
    {
        return;
    }
    sched.total_workers += 1;
    sched.idle_workers += 1;
    let ordinal = core.counters.note_spawned();
    let worker_core = Arc::clone(core);
    let mut builder = thread::Builder::new().name(format!("job-worker-{ordinal}"));
    if let Some(stack) = core.config.thread_stack_size {
        builder = builder.stack_size(stack);
    }
    let handle = builder
        .spawn(move || worker_loop(&worker_core))
        .expect("Failed to spawn worker thread");
    manager::track_thread(core, handle);
    debug!(worker = ordinal, "worker spawned");
}

fn worker_loop(core: &Arc<ManagerCore>) {
    let idle_timeout = core.config.idle_timeout();
    loop {
        match core.ready_rx.recv_timeout(idle_timeout) {
            Ok(job) => {
                manager::sched_state(core).idle_workers -= 1;
                manager::execute_cycle(core, &job);
                manager::sched_state(core).idle_workers += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut sched = manager::sched_state(core);
                // A dispatch may be racing the timeout; only retire when the
                // queue is confirmed empty under the lock.
                if core.ready_rx.is_empty() {
                    sched.total_workers -= 1;
                    sched.idle_workers -= 1;
                    core.counters.note_retired();
                    debug!("idle worker retiring");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                let mut sched = manager::sched_state(core);
                sched.total_workers -= 1;
                sched.idle_workers -= 1;
                debug!("worker exiting on shutdown");
                return;
            }
        }
    }
}
