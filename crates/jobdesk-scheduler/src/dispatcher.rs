//! Trigger jobs by name.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    DispatchError, ExecutionMode, JobId, JobRegistry, RunId, Scheduler, SchedulerError,
    TriggerPayload,
};

/// Result of a successful trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The run was handed to the scheduler; it may not have started yet.
    Accepted { run_id: RunId },
    /// The run finished successfully (await-completion jobs only).
    Completed { run_id: RunId },
}

impl TriggerOutcome {
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Accepted { run_id } | Self::Completed { run_id } => *run_id,
        }
    }
}

/// Resolves job identifiers through a registry and submits them to a scheduler.
///
/// Both collaborators are injected; the dispatcher holds no other state and is
/// cheap to clone.
#[derive(Clone)]
pub struct JobDispatcher {
    registry: Arc<JobRegistry>,
    scheduler: Arc<dyn Scheduler>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<JobRegistry>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Registered identifiers in registration order.
    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.registry.enumerate()
    }

    /// Trigger a job by identifier.
    ///
    /// Unknown identifiers fail with [`DispatchError::NotFound`] without touching
    /// the scheduler. Otherwise the job is submitted exactly once; no retries.
    #[tracing::instrument(skip_all, fields(job = %id))]
    pub async fn trigger_by_name(
        &self,
        id: &str,
        payload: Option<TriggerPayload>,
    ) -> Result<TriggerOutcome, DispatchError> {
        let Some(job) = self.registry.lookup(id) else {
            warn!("trigger for unregistered job");
            return Err(DispatchError::NotFound(id.to_string()));
        };

        let payload = payload.unwrap_or_default();
        debug!(payload = ?payload, mode = ?job.mode, "submitting job");

        let submission = self
            .scheduler
            .submit(job, payload)
            .await
            .map_err(|e| match e {
                SchedulerError::Unavailable => DispatchError::SchedulerUnavailable,
                SchedulerError::AlreadyRunning(name) => DispatchError::Rejected(name),
                other => DispatchError::Scheduler(other),
            })?;
        let run_id = submission.run_id;

        match job.mode {
            ExecutionMode::FireAndForget => {
                info!(run_id = %run_id, "job accepted");
                Ok(TriggerOutcome::Accepted { run_id })
            }
            ExecutionMode::AwaitCompletion => {
                submission
                    .wait()
                    .await
                    .map_err(|error| DispatchError::JobFailed {
                        job: id.to_string(),
                        error,
                    })?;
                info!(run_id = %run_id, "job completed");
                Ok(TriggerOutcome::Completed { run_id })
            }
        }
    }
}
