//! Scheduler types.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, case-sensitive name of a schedulable job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifiers must be non-empty and free of whitespace.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for JobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immutable string parameters attached to a trigger request.
///
/// An empty payload means "run with defaults".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerPayload(BTreeMap<String, String>);

impl TriggerPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this payload with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Read a boolean flag.
    ///
    /// Returns `None` when the key is absent or the value is not a recognised
    /// boolean (`1/true/yes/on`, `0/false/no/off`, case-insensitive).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)?.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TriggerPayload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Whether a trigger returns on submission or waits for the run to finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    FireAndForget,
    AwaitCompletion,
}

/// What happens when a job is triggered while a previous run is still executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Runs execute in parallel.
    Concurrent,
    /// The new run waits for the active one to finish.
    #[default]
    Queue,
    /// The new run is refused.
    Reject,
}

/// How a job is scheduled to run besides explicit triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Only runs when triggered.
    #[default]
    Manual,
    /// Run every N seconds from the last run.
    Interval { seconds: u64 },
}

/// Identifier of a single run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything a job body receives for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobId,
    pub payload: TriggerPayload,
    pub run_id: RunId,
}

/// Future returned by a job body.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Type alias for the job body function.
pub type JobRunner = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// A registered job: its identifier, body, and declared behaviour.
#[derive(Clone)]
pub struct JobDescriptor {
    pub id: JobId,
    pub mode: ExecutionMode,
    pub overlap: OverlapPolicy,
    pub schedule: JobSchedule,
    pub runner: JobRunner,
}

impl JobDescriptor {
    /// Create a fire-and-forget, manually triggered, queueing job.
    pub fn new(id: impl Into<JobId>, runner: JobRunner) -> Self {
        Self {
            id: id.into(),
            mode: ExecutionMode::default(),
            overlap: OverlapPolicy::default(),
            schedule: JobSchedule::default(),
            runner,
        }
    }

    /// Create a job from an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<JobId>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self::new(id, Arc::new(move |ctx| Box::pin(f(ctx)) as JobFuture))
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_schedule(mut self, schedule: JobSchedule) -> Self {
        self.schedule = schedule;
        self
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("overlap", &self.overlap)
            .field("schedule", &self.schedule)
            .field("runner", &"JobRunner")
            .finish()
    }
}

/// Outcome of the most recent run of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobStatus {
    /// Never run since startup.
    #[default]
    Idle,
    /// At least one run is executing.
    Running,
    /// The last run succeeded.
    Succeeded,
    /// The last run failed with an error.
    Failed { error: String },
}

/// In-memory run state of a registered job.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    pub status: JobStatus,
    /// When this job last finished successfully.
    pub last_run: Option<DateTime<Utc>>,
    /// When an interval job should next fire.
    pub next_run: Option<DateTime<Utc>>,
    /// Number of consecutive failures (resets on success).
    pub failure_count: u32,
    /// Runs currently executing or queued behind the overlap lock.
    pub active_runs: u32,
}

impl JobState {
    /// Initial state for a job with the given schedule.
    pub fn for_schedule(schedule: JobSchedule) -> Self {
        Self {
            next_run: match schedule {
                JobSchedule::Manual => None,
                JobSchedule::Interval { .. } => Some(Utc::now()),
            },
            ..Self::default()
        }
    }

    /// Check if a recurring job is due to fire.
    ///
    /// Jobs with a run in progress are never due; the loop waits for it.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active_runs == 0 && self.next_run.is_some_and(|next| next <= now)
    }

    /// Calculate retry delay based on failure count.
    pub fn calculate_retry_delay(&self) -> Duration {
        // Exponential backoff: 5min, 10min, 20min, 40min, max 1hr
        let base_secs = 300i64;
        let max_secs = 3600i64;
        let backoff = base_secs * (1 << self.failure_count.saturating_sub(1).min(4));
        Duration::seconds(backoff.min(max_secs))
    }
}
