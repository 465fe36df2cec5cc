//! Integration tests for the job lifecycle state machine.
//!
//! These tests validate:
//! - Schedule, run, result recording, and reuse across cycles
//! - Delayed scheduling and the sleep/wake transitions
//! - Cancellation in every state (waiting, pre-run, running)
//! - Reschedule collapsing and reschedule-from-done
//! - The pre-run veto (`about_to_run` cancel, `should_run`)
//! - Panic containment in work functions
//! - Lifecycle event ordering and asynchronous completion

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conflict_jobs::core::{
    IdentityRule, Job, JobChangeEvent, JobChangeListener, JobState, JobStatus, ListenerRef,
    Priority,
};
use conflict_jobs::util::now_ms;

use common::{test_manager, wait_until};

// ============================================================================
// HELPERS
// ============================================================================

/// Listener recording which callbacks fired, in order.
#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
    done_at_ms: Mutex<Option<u128>>,
}

impl RecordingListener {
    fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, label: &str) {
        self.events.lock().unwrap().push(label.to_string());
    }
}

impl JobChangeListener for RecordingListener {
    fn scheduled(&self, _event: &JobChangeEvent) {
        self.push("scheduled");
    }

    fn about_to_run(&self, _event: &JobChangeEvent) {
        self.push("about_to_run");
    }

    fn running(&self, _event: &JobChangeEvent) {
        self.push("running");
    }

    fn done(&self, event: &JobChangeEvent) {
        *self.done_at_ms.lock().unwrap() = Some(event.timestamp_ms());
        self.push(&format!("done:{:?}", event.result().unwrap()));
    }
}

// ============================================================================
// BASIC LIFECYCLE
// ============================================================================

#[test]
fn test_schedule_runs_and_records_result() {
    let manager = test_manager();
    let runs = Arc::new(AtomicU32::new(0));
    let runs_in_job = Arc::clone(&runs);
    let job = manager
        .job("counter")
        .work(move |_monitor| {
            runs_in_job.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();

    assert_eq!(job.state(), JobState::None);
    assert_eq!(job.result(), None);

    job.schedule();
    job.join().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(job.result(), Some(JobStatus::Ok));
    assert_eq!(job.state(), JobState::None);
    manager.shutdown();
}

#[test]
fn test_job_is_reusable_across_cycles() {
    let manager = test_manager();
    let runs = Arc::new(AtomicU32::new(0));
    let runs_in_job = Arc::clone(&runs);
    let job = manager
        .job("repeat")
        .work(move |_monitor| {
            runs_in_job.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();

    for _ in 0..3 {
        job.schedule();
        job.join().unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    manager.shutdown();
}

#[test]
fn test_delayed_schedule_sleeps_first() {
    let manager = test_manager();
    let job = manager.job("later").build().unwrap();

    let start = Instant::now();
    job.schedule_delayed(Duration::from_millis(150));
    assert_eq!(job.state(), JobState::Sleeping);

    job.join().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(140));
    assert_eq!(job.result(), Some(JobStatus::Ok));
    manager.shutdown();
}

#[test]
fn test_wake_up_short_circuits_delay() {
    let manager = test_manager();
    let job = manager.job("woken").build().unwrap();

    let start = Instant::now();
    job.schedule_delayed(Duration::from_secs(30));
    assert_eq!(job.state(), JobState::Sleeping);
    job.wake_up();
    job.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(job.result(), Some(JobStatus::Ok));
    manager.shutdown();
}

#[test]
fn test_sleep_holds_a_waiting_job() {
    let manager = test_manager();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_job = Arc::clone(&ran);
    let rule = IdentityRule::new();

    // Occupy the rule so "held" stays waiting long enough to be put to sleep.
    let release = Arc::new(AtomicBool::new(false));
    let release_in_job = Arc::clone(&release);
    let blocker = manager
        .job("blocker")
        .rule(Arc::clone(&rule))
        .work(move |_monitor| {
            while !release_in_job.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            JobStatus::Ok
        })
        .build()
        .unwrap();
    let held = manager
        .job("held")
        .rule(Arc::clone(&rule))
        .work(move |_monitor| {
            ran_in_job.store(true, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();

    blocker.schedule();
    assert!(wait_until(
        || blocker.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    held.schedule();
    assert_eq!(held.state(), JobState::Waiting);
    assert!(held.sleep());
    assert_eq!(held.state(), JobState::Sleeping);

    // The rule frees up but the sleeping job must not be dispatched.
    release.store(true, Ordering::SeqCst);
    blocker.join().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(held.state(), JobState::Sleeping);

    held.wake_up();
    held.join().unwrap();
    assert!(ran.load(Ordering::SeqCst));
    manager.shutdown();
}

#[test]
fn test_sleep_fails_on_running_job() {
    let manager = test_manager();
    let job = manager
        .job("busy")
        .work(|monitor| {
            while !monitor.is_canceled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            JobStatus::Cancel
        })
        .build()
        .unwrap();

    job.schedule();
    assert!(wait_until(
        || job.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    assert!(!job.sleep());
    job.cancel();
    job.join().unwrap();
    manager.shutdown();
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancel_waiting_job_never_runs() {
    let manager = test_manager();
    let rule = IdentityRule::new();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_job = Arc::clone(&ran);

    let blocker = manager
        .job("blocker")
        .rule(Arc::clone(&rule))
        .work(|_monitor| {
            std::thread::sleep(Duration::from_millis(150));
            JobStatus::Ok
        })
        .build()
        .unwrap();
    let victim = manager
        .job("victim")
        .rule(Arc::clone(&rule))
        .work(move |_monitor| {
            ran_in_job.store(true, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();

    blocker.schedule();
    assert!(wait_until(
        || blocker.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    victim.schedule();
    assert_eq!(victim.state(), JobState::Waiting);

    // A waiting job stops immediately.
    assert!(victim.cancel());
    assert_eq!(victim.state(), JobState::None);
    assert_eq!(victim.result(), Some(JobStatus::Cancel));

    blocker.join().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
    manager.shutdown();
}

#[test]
fn test_cancel_running_is_cooperative() {
    let manager = test_manager();
    let hook_calls = Arc::new(AtomicU32::new(0));
    let hook_in_job = Arc::clone(&hook_calls);
    let job = manager
        .job("cancellable")
        .work(|monitor| {
            while !monitor.is_canceled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            JobStatus::Cancel
        })
        .on_canceling(move || {
            hook_in_job.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    job.schedule();
    assert!(wait_until(
        || job.state() == JobState::Running,
        Duration::from_secs(2)
    ));

    // Still winding down on return; the hook fires once per run.
    assert!(!job.cancel());
    assert!(!job.cancel());
    job.join().unwrap();
    assert_eq!(job.result(), Some(JobStatus::Cancel));
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    manager.shutdown();
}

#[test]
fn test_cancel_unscheduled_job_is_immediate() {
    let manager = test_manager();
    let job = manager.job("idle").build().unwrap();
    assert!(job.cancel());
    assert_eq!(job.state(), JobState::None);
    manager.shutdown();
}

// ============================================================================
// RESCHEDULING
// ============================================================================

#[test]
fn test_reschedule_requests_collapse_while_running() {
    let manager = test_manager();
    let runs = Arc::new(AtomicU32::new(0));
    let runs_in_job = Arc::clone(&runs);
    let hold = Arc::new(AtomicBool::new(true));
    let hold_in_job = Arc::clone(&hold);
    let job = manager
        .job("collapsing")
        .work(move |_monitor| {
            runs_in_job.fetch_add(1, Ordering::SeqCst);
            while hold_in_job.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            JobStatus::Ok
        })
        .build()
        .unwrap();

    job.schedule();
    assert!(wait_until(
        || runs.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));

    // Several requests during one run collapse into a single extra cycle.
    job.schedule();
    job.schedule();
    job.schedule();
    hold.store(false, Ordering::SeqCst);

    assert!(wait_until(
        || runs.load(Ordering::SeqCst) == 2,
        Duration::from_secs(2)
    ));
    job.join().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    manager.shutdown();
}

#[test]
fn test_schedule_while_waiting_is_ignored() {
    let manager = test_manager();
    let rule = IdentityRule::new();
    let runs = Arc::new(AtomicU32::new(0));
    let runs_in_job = Arc::clone(&runs);

    let blocker = manager
        .job("blocker")
        .rule(Arc::clone(&rule))
        .work(|_monitor| {
            std::thread::sleep(Duration::from_millis(150));
            JobStatus::Ok
        })
        .build()
        .unwrap();
    let waiter = manager
        .job("waiter")
        .rule(Arc::clone(&rule))
        .work(move |_monitor| {
            runs_in_job.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();

    blocker.schedule();
    assert!(wait_until(
        || blocker.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    waiter.schedule();
    assert_eq!(waiter.state(), JobState::Waiting);
    waiter.schedule();
    waiter.schedule();

    blocker.join().unwrap();
    waiter.join().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    manager.shutdown();
}

struct RescheduleOnce {
    remaining: AtomicU32,
}

impl JobChangeListener for RescheduleOnce {
    fn done(&self, event: &JobChangeEvent) {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            event.job().schedule();
        }
    }
}

#[test]
fn test_reschedule_from_done_listener() {
    let manager = test_manager();
    let runs = Arc::new(AtomicU32::new(0));
    let runs_in_job = Arc::clone(&runs);
    let job = manager
        .job("self-perpetuating")
        .work(move |_monitor| {
            runs_in_job.fetch_add(1, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();
    job.add_listener(Arc::new(RescheduleOnce {
        remaining: AtomicU32::new(2),
    }));

    job.schedule();
    assert!(wait_until(
        || runs.load(Ordering::SeqCst) == 3,
        Duration::from_secs(3)
    ));
    job.join().unwrap();
    manager.shutdown();
}

// ============================================================================
// PRE-RUN VETO
// ============================================================================

struct CancelOnAboutToRun;

impl JobChangeListener for CancelOnAboutToRun {
    fn about_to_run(&self, event: &JobChangeEvent) {
        event.job().cancel();
    }
}

#[test]
fn test_about_to_run_listener_can_veto() {
    let manager = test_manager();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_job = Arc::clone(&ran);
    let job = manager
        .job("vetoed")
        .work(move |_monitor| {
            ran_in_job.store(true, Ordering::SeqCst);
            JobStatus::Ok
        })
        .build()
        .unwrap();
    job.add_listener(Arc::new(CancelOnAboutToRun));

    job.schedule();
    job.join().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(job.result(), Some(JobStatus::Cancel));
    manager.shutdown();
}

#[test]
fn test_should_run_false_skips_the_cycle() {
    let manager = test_manager();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_job = Arc::clone(&ran);
    let job = manager
        .job("gated")
        .work(move |_monitor| {
            ran_in_job.store(true, Ordering::SeqCst);
            JobStatus::Ok
        })
        .should_run(|| false)
        .build()
        .unwrap();

    job.schedule();
    job.join().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(job.result(), Some(JobStatus::Cancel));
    manager.shutdown();
}

#[test]
fn test_panicking_work_marks_job_failed() {
    let manager = test_manager();
    let job = manager
        .job("explosive")
        .work(|_monitor| panic!("boom"))
        .build()
        .unwrap();

    job.schedule();
    job.join().unwrap();
    match job.result() {
        Some(JobStatus::Failed(message)) => assert!(message.contains("boom")),
        other => panic!("expected Failed result, got {other:?}"),
    }

    // A failed job schedules again normally.
    job.schedule();
    job.join().unwrap();
    manager.shutdown();
}

// ============================================================================
// EVENTS AND ASYNC COMPLETION
// ============================================================================

#[test]
fn test_event_order_for_successful_run() {
    let manager = test_manager();
    let recorder = Arc::new(RecordingListener::default());
    let listener: ListenerRef = recorder.clone();
    manager.add_listener(listener);

    let started_ms = now_ms();
    let job = manager.job("observed").build().unwrap();
    job.schedule();
    job.join().unwrap();

    assert!(wait_until(
        || recorder.snapshot().len() >= 4,
        Duration::from_secs(2)
    ));
    let events = recorder.snapshot();
    assert_eq!(
        events[..4],
        [
            "scheduled".to_string(),
            "about_to_run".to_string(),
            "running".to_string(),
            "done:Ok".to_string(),
        ]
    );
    let done_at = recorder.done_at_ms.lock().unwrap().unwrap();
    assert!(done_at >= started_ms);
    manager.shutdown();
}

#[test]
fn test_removed_listener_stops_receiving() {
    let manager = test_manager();
    let recorder = Arc::new(RecordingListener::default());
    let listener: ListenerRef = recorder.clone();
    manager.add_listener(listener.clone());

    let job = manager.job("once-observed").build().unwrap();
    job.schedule();
    job.join().unwrap();
    assert!(wait_until(
        || !recorder.snapshot().is_empty(),
        Duration::from_secs(2)
    ));

    manager.remove_listener(&listener);
    let count = recorder.snapshot().len();
    job.schedule();
    job.join().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.snapshot().len(), count);
    manager.shutdown();
}

#[test]
fn test_async_job_completes_via_done() {
    let manager = test_manager();
    let slot: Arc<Mutex<Option<Job>>> = Arc::new(Mutex::new(None));
    let slot_in_job = Arc::clone(&slot);
    let job = manager
        .job("async")
        .work(move |_monitor| {
            let handle = slot_in_job.lock().unwrap().clone().unwrap();
            std::thread::spawn(move || {
                handle.set_thread(std::thread::current());
                std::thread::sleep(Duration::from_millis(100));
                handle.done(JobStatus::Ok).unwrap();
            });
            JobStatus::AsyncFinish
        })
        .build()
        .unwrap();
    *slot.lock().unwrap() = Some(job.clone());

    job.schedule();
    assert!(wait_until(
        || job.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    // Still running after the worker returned: the cycle is now owned by the
    // handover thread.
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(job.state(), JobState::Running);
    assert!(job.thread().is_some());

    job.join().unwrap();
    assert_eq!(job.result(), Some(JobStatus::Ok));
    assert!(job.thread().is_none());

    // done on a non-async job is rejected.
    assert!(job.done(JobStatus::Ok).is_err());
    manager.shutdown();
}

#[test]
fn test_stray_done_during_sync_run_does_not_leak() {
    let manager = test_manager();
    let hold = Arc::new(AtomicBool::new(true));
    let hold_in_job = Arc::clone(&hold);
    let async_mode = Arc::new(AtomicBool::new(false));
    let async_in_job = Arc::clone(&async_mode);
    let job = manager
        .job("mode-switch")
        .work(move |_monitor| {
            if async_in_job.load(Ordering::SeqCst) {
                return JobStatus::AsyncFinish;
            }
            while hold_in_job.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            JobStatus::Ok
        })
        .build()
        .unwrap();

    job.schedule();
    assert!(wait_until(
        || job.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    // A completion delivered during a synchronous run is discarded: the
    // cycle finishes with the work function's own result.
    let _ = job.done(JobStatus::Failed("stray".into()));
    hold.store(false, Ordering::SeqCst);
    job.join().unwrap();
    assert_eq!(job.result(), Some(JobStatus::Ok));

    // The next asynchronous cycle must wait for a real `done`, not
    // complete itself with the discarded result.
    async_mode.store(true, Ordering::SeqCst);
    job.schedule();
    assert!(wait_until(
        || job.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(job.state(), JobState::Running);
    assert_eq!(job.result(), Some(JobStatus::Ok));

    job.done(JobStatus::Ok).unwrap();
    job.join().unwrap();
    assert_eq!(job.state(), JobState::None);
    manager.shutdown();
}

#[test]
fn test_priority_orders_contended_dispatch() {
    let manager = test_manager();
    let rule = IdentityRule::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let blocker = manager
        .job("blocker")
        .rule(Arc::clone(&rule))
        .work(|_monitor| {
            std::thread::sleep(Duration::from_millis(150));
            JobStatus::Ok
        })
        .build()
        .unwrap();
    let order_low = Arc::clone(&order);
    let low = manager
        .job("low")
        .rule(Arc::clone(&rule))
        .priority(Priority::Decorate)
        .work(move |_monitor| {
            order_low.lock().unwrap().push("low");
            JobStatus::Ok
        })
        .build()
        .unwrap();
    let order_high = Arc::clone(&order);
    let high = manager
        .job("high")
        .rule(Arc::clone(&rule))
        .priority(Priority::Interactive)
        .work(move |_monitor| {
            order_high.lock().unwrap().push("high");
            JobStatus::Ok
        })
        .build()
        .unwrap();

    blocker.schedule();
    assert!(wait_until(
        || blocker.state() == JobState::Running,
        Duration::from_secs(2)
    ));
    // Scheduled low first; the higher priority must still win the dispatch
    // once the rule frees up.
    low.schedule();
    high.schedule();

    low.join().unwrap();
    high.join().unwrap();
    assert_eq!(*order.lock().unwrap(), ["high", "low"]);
    manager.shutdown();
}
