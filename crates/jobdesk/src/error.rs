//! Error types for update checks and job configuration.

use std::path::PathBuf;

use jobdesk_scheduler::SchedulerError;
use thiserror::Error;

/// Errors from checking the update feed.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("update feed returned {status}: {body}")]
    Feed { status: u16, body: String },

    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),
}

/// Errors from loading a job file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read job file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse job file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid job {id}: {reason}")]
    InvalidJob { id: String, reason: String },

    #[error(transparent)]
    Registry(#[from] SchedulerError),
}
