//! Job registry.
//!
//! Built once at startup and immutable afterwards, so lookups need no locking.

use std::collections::HashMap;

use tracing::debug;

use crate::{JobDescriptor, JobId, JobSchedule, SchedulerError};

/// Mapping from job identifier to descriptor, in registration order.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Vec<JobDescriptor>,
    index: HashMap<JobId, usize>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    /// Look up a job by exact, case-sensitive identifier.
    pub fn lookup(&self, id: &str) -> Option<&JobDescriptor> {
        self.index.get(id).map(|&position| &self.jobs[position])
    }

    /// Registered identifiers in registration order.
    pub fn enumerate(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter().map(|job| &job.id)
    }

    /// Registered descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &JobDescriptor> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Fail with the first identifier in `ids` that is not registered.
    ///
    /// Trigger surfaces call this at startup since identifiers are not checked
    /// at compile time.
    pub fn ensure_registered<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), SchedulerError> {
        for id in ids {
            if self.lookup(id).is_none() {
                return Err(SchedulerError::JobNotFound(id.to_string()));
            }
        }
        Ok(())
    }
}

/// Collects descriptors and validates them into a [`JobRegistry`].
#[derive(Debug, Default)]
pub struct JobRegistryBuilder {
    jobs: Vec<JobDescriptor>,
}

impl JobRegistryBuilder {
    pub fn register(mut self, job: JobDescriptor) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn build(self) -> Result<JobRegistry, SchedulerError> {
        let mut index = HashMap::with_capacity(self.jobs.len());

        for (position, job) in self.jobs.iter().enumerate() {
            if !job.id.is_valid() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "invalid job identifier {:?}",
                    job.id.as_str()
                )));
            }
            if let JobSchedule::Interval { seconds: 0 } = job.schedule {
                return Err(SchedulerError::InvalidConfig(format!(
                    "job {} has a zero-second interval",
                    job.id
                )));
            }
            if index.insert(job.id.clone(), position).is_some() {
                return Err(SchedulerError::DuplicateJob(job.id.to_string()));
            }
        }

        debug!(count = self.jobs.len(), "built job registry");
        Ok(JobRegistry {
            jobs: self.jobs,
            index,
        })
    }
}
