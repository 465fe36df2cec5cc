//! Shared helpers for scheduler integration tests.

use std::time::{Duration, Instant};

use conflict_jobs::config::SchedulerConfig;
use conflict_jobs::core::JobManager;
use conflict_jobs::util::init_tracing;

/// A small manager suitable for tests: four workers, fast idle retirement.
/// Set `RUST_LOG` to see scheduler traces from a failing test.
pub fn test_manager() -> JobManager {
    init_tracing();
    JobManager::new(
        SchedulerConfig::new()
            .with_max_workers(4)
            .with_worker_idle_timeout_secs(1),
    )
    .unwrap()
}

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
