//! Builders to construct a job manager from configuration.

use crate::config::SchedulerConfig;
use crate::core::{JobError, JobManager};

/// Build a validated [`JobManager`] from scheduler configuration.
///
/// # Errors
///
/// [`JobError::InvalidConfig`] when the configuration fails validation.
pub fn build_manager(cfg: &SchedulerConfig) -> Result<JobManager, JobError> {
    JobManager::new(cfg.clone())
}

/// Build a [`JobManager`] from a JSON configuration string.
///
/// # Errors
///
/// [`JobError::InvalidConfig`] when the input fails to parse or validate.
pub fn build_manager_from_json(input: &str) -> Result<JobManager, JobError> {
    let cfg = SchedulerConfig::from_json_str(input).map_err(JobError::InvalidConfig)?;
    JobManager::new(cfg)
}
