//! Named job dispatch for jobdesk.
//!
//! This crate provides:
//! - An immutable registry mapping stable job identifiers to descriptors
//! - A dispatcher that triggers jobs by identifier with an optional payload
//! - A `Scheduler` seam and an in-process tokio implementation with
//!   per-job overlap policies and recurring interval jobs

mod dispatcher;
mod error;
mod registry;
mod scheduler;
mod types;

pub use dispatcher::{JobDispatcher, TriggerOutcome};
pub use error::{DispatchError, SchedulerError};
pub use registry::{JobRegistry, JobRegistryBuilder};
pub use scheduler::{Scheduler, Submission, TokioScheduler};
pub use types::{
    ExecutionMode, JobContext, JobDescriptor, JobFuture, JobId, JobRunner, JobSchedule, JobState,
    JobStatus, OverlapPolicy, RunId, TriggerPayload,
};
