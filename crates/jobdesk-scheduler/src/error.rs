//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in registry and scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job already registered.
    #[error("job already registered: {0}")]
    DuplicateJob(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Invalid job configuration.
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    /// The scheduler has not been started or has been shut down.
    #[error("scheduler unavailable")]
    Unavailable,

    /// The job is already running and its overlap policy rejects a second run.
    #[error("job already running: {0}")]
    AlreadyRunning(String),
}

/// Errors returned by [`JobDispatcher::trigger_by_name`](crate::JobDispatcher::trigger_by_name).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The identifier is not present in the registry.
    #[error("no job registered as {0}")]
    NotFound(String),

    /// The scheduler is not ready to accept work. Callers may retry.
    #[error("scheduler unavailable")]
    SchedulerUnavailable,

    /// The scheduler refused the run under the job's overlap policy.
    #[error("job {0} is already running")]
    Rejected(String),

    /// Any other scheduler failure.
    #[error("scheduler error: {0}")]
    Scheduler(SchedulerError),

    /// An await-completion job ran and failed.
    #[error("job {job} failed: {error}")]
    JobFailed { job: String, error: String },
}

impl DispatchError {
    /// Whether retrying the same trigger later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SchedulerUnavailable | Self::Rejected(_))
    }
}
