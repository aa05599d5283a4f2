//! Scheduler seam and the in-process tokio implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock, oneshot, watch};
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    JobContext, JobDescriptor, JobId, JobRegistry, JobSchedule, JobState, JobStatus,
    OverlapPolicy, RunId, SchedulerError, TriggerPayload,
};

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep duration between scheduler checks.
const MAX_SLEEP_SECS: u64 = 60;

/// Handle to a run accepted by a [`Scheduler`].
#[derive(Debug)]
pub struct Submission {
    pub run_id: RunId,
    completion: oneshot::Receiver<Result<(), String>>,
}

impl Submission {
    pub fn new(run_id: RunId, completion: oneshot::Receiver<Result<(), String>>) -> Self {
        Self { run_id, completion }
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<(), String> {
        self.completion
            .await
            .unwrap_or_else(|_| Err("run was abandoned before completing".to_string()))
    }
}

/// Something that can execute a job descriptor with a payload.
///
/// `submit` must hand the run off and return without waiting for it.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn submit(
        &self,
        job: &JobDescriptor,
        payload: TriggerPayload,
    ) -> Result<Submission, SchedulerError>;
}

struct Inner {
    accepting: AtomicBool,
    states: RwLock<HashMap<JobId, JobState>>,
    /// Per-job locks used by [`OverlapPolicy::Queue`].
    locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
    /// Number of runs that have been accepted and not yet finished.
    in_flight: watch::Sender<usize>,
    /// Signalled whenever a run finishes.
    finished: Notify,
}

/// Scheduler that runs jobs as tokio tasks in this process.
///
/// Not available until [`start`](Self::start) is called; unavailable again
/// after [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<Inner>,
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioScheduler {
    /// Create a scheduler that has not been started.
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                accepting: AtomicBool::new(false),
                states: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                in_flight,
                finished: Notify::new(),
            }),
        }
    }

    /// Seed run state for every registered job and begin accepting submissions.
    pub async fn start(&self, registry: &JobRegistry) {
        {
            let mut states = self.inner.states.write().await;
            for job in registry.iter() {
                states
                    .entry(job.id.clone())
                    .or_insert_with(|| JobState::for_schedule(job.schedule));
            }
            self.inner.accepting.store(true, Ordering::SeqCst);
        }
        info!(jobs = registry.len(), "scheduler started");
    }

    pub fn is_available(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting submissions and wait for running jobs to drain.
    pub async fn shutdown(&self) {
        {
            // Flipped under the state lock so no run is reserved after this point.
            let _states = self.inner.states.write().await;
            self.inner.accepting.store(false, Ordering::SeqCst);
        }
        let mut rx = self.inner.in_flight.subscribe();
        let pending = *rx.borrow();
        if pending > 0 {
            info!(pending, "waiting for running jobs to finish");
        }
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
        info!("scheduler shut down gracefully");
    }

    /// Current run state of a job.
    pub async fn state(&self, id: &str) -> Option<JobState> {
        self.inner.states.read().await.get(id).cloned()
    }

    /// Number of runs accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Run the recurring loop for interval jobs until shutdown is signalled.
    pub async fn run(&self, registry: Arc<JobRegistry>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler loop starting");

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler loop shutting down");
                break;
            }

            for job in self.due_jobs(&registry).await {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, not starting new jobs");
                    break;
                }

                debug!(job = %job.id, "interval job due");
                if let Err(e) = self.submit(job, TriggerPayload::default()).await {
                    warn!(job = %job.id, error = %e, "failed to submit interval job");
                }
            }

            let sleep_duration = self.calculate_sleep_duration(&registry).await;

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("shutdown sender dropped, scheduler loop stopping");
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = self.inner.finished.notified() => {}
                _ = sleep(sleep_duration) => {}
            }
        }
    }

    /// Interval jobs that are due and not already running.
    async fn due_jobs<'a>(&self, registry: &'a JobRegistry) -> Vec<&'a JobDescriptor> {
        let states = self.inner.states.read().await;
        let now = Utc::now();
        registry
            .iter()
            .filter(|job| states.get(&job.id).is_some_and(|s| s.is_due(now)))
            .collect()
    }

    /// Calculate how long to sleep until the next interval job is due.
    pub async fn calculate_sleep_duration(&self, registry: &JobRegistry) -> std::time::Duration {
        let states = self.inner.states.read().await;
        let now = Utc::now();

        let next_due = registry
            .iter()
            .filter_map(|job| states.get(&job.id))
            .filter(|s| s.active_runs == 0)
            .filter_map(|s| s.next_run)
            .min();

        let secs = match next_due {
            Some(next) => {
                let diff = (next - now).num_seconds();
                (diff.max(MIN_SLEEP_SECS as i64) as u64).min(MAX_SLEEP_SECS)
            }
            None => MAX_SLEEP_SECS,
        };

        std::time::Duration::from_secs(secs)
    }

    async fn job_lock(&self, id: &JobId) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Reserve a run slot, enforcing the job's overlap policy.
    ///
    /// The reservation must be followed by a spawn with no await in between,
    /// since only the spawned task releases it.
    async fn begin_run(&self, job: &JobDescriptor) -> Result<(), SchedulerError> {
        let mut states = self.inner.states.write().await;
        if !self.is_available() {
            return Err(SchedulerError::Unavailable);
        }

        let state = states
            .entry(job.id.clone())
            .or_insert_with(|| JobState::for_schedule(job.schedule));

        if job.overlap == OverlapPolicy::Reject && state.active_runs > 0 {
            return Err(SchedulerError::AlreadyRunning(job.id.to_string()));
        }

        state.active_runs += 1;
        state.status = JobStatus::Running;
        self.inner.in_flight.send_modify(|n| *n += 1);
        Ok(())
    }
}

impl Inner {
    /// Record the outcome of a run and reschedule interval jobs.
    async fn finish_run(&self, job: &JobId, schedule: JobSchedule, result: &Result<(), String>) {
        {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(job) {
                let now = Utc::now();
                state.active_runs = state.active_runs.saturating_sub(1);

                match result {
                    Ok(()) => {
                        state.last_run = Some(now);
                        state.failure_count = 0;
                        if let JobSchedule::Interval { seconds } = schedule {
                            state.next_run = Some(now + chrono::Duration::seconds(seconds as i64));
                        }
                        state.status = JobStatus::Succeeded;
                        info!(job = %job, "job run completed");
                    }
                    Err(e) => {
                        state.failure_count += 1;
                        if matches!(schedule, JobSchedule::Interval { .. }) {
                            state.next_run = Some(now + state.calculate_retry_delay());
                        }
                        state.status = JobStatus::Failed { error: e.clone() };
                        error!(
                            job = %job,
                            failure_count = state.failure_count,
                            error = %e,
                            "job run failed"
                        );
                    }
                }

                if state.active_runs > 0 {
                    state.status = JobStatus::Running;
                }
            }
        }

        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        self.finished.notify_one();
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn submit(
        &self,
        job: &JobDescriptor,
        payload: TriggerPayload,
    ) -> Result<Submission, SchedulerError> {
        if !self.is_available() {
            return Err(SchedulerError::Unavailable);
        }

        let lock = match job.overlap {
            OverlapPolicy::Queue => Some(self.job_lock(&job.id).await),
            OverlapPolicy::Concurrent | OverlapPolicy::Reject => None,
        };

        self.begin_run(job).await?;

        let run_id = RunId::new();
        let ctx = JobContext {
            job: job.id.clone(),
            payload,
            run_id,
        };
        let runner = Arc::clone(&job.runner);
        let schedule = job.schedule;
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = oneshot::channel();
        let span = info_span!("job_run", job = %job.id, run_id = %run_id);

        tokio::spawn(
            async move {
                let _guard = match lock {
                    Some(lock) => Some(lock.lock_owned().await),
                    None => None,
                };

                debug!(payload = ?ctx.payload, "job run starting");
                let id = ctx.job.clone();

                // Run the body in its own task so a panic is reported as a failure
                // instead of leaving the run counted as in flight.
                let result = match tokio::spawn(runner(ctx)).await {
                    Ok(result) => result,
                    Err(e) => Err(format!("job body panicked: {e}")),
                };

                inner.finish_run(&id, schedule, &result).await;
                let _ = tx.send(result);
            }
            .instrument(span),
        );

        Ok(Submission::new(run_id, rx))
    }
}
