//! Job file loading.
//!
//! A job file is a JSON array of command-backed jobs:
//!
//! ```json
//! [
//!   { "id": "PlexContentSync", "command": ["./sync.sh", "--plex"],
//!     "overlap": "reject", "interval_seconds": 3600 }
//! ]
//! ```
//!
//! Each run spawns the command with the trigger payload exposed as
//! `JOBDESK_PARAM_<KEY>` environment variables.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use jobdesk_scheduler::{
    ExecutionMode, JobContext, JobDescriptor, JobId, JobRegistry, JobRunner, JobSchedule,
    OverlapPolicy,
};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Prefix of the environment variables carrying payload entries.
pub const PARAM_ENV_PREFIX: &str = "JOBDESK_PARAM_";

/// One entry of a job file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFileEntry {
    pub id: JobId,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl JobFileEntry {
    fn schedule(&self) -> JobSchedule {
        match self.interval_seconds {
            Some(seconds) => JobSchedule::Interval { seconds },
            None => JobSchedule::Manual,
        }
    }

    /// Turn this entry into a registrable descriptor.
    pub fn into_descriptor(self) -> Result<JobDescriptor, ConfigError> {
        let schedule = self.schedule();
        let mut command = self.command.into_iter();
        let Some(program) = command.next().filter(|p| !p.trim().is_empty()) else {
            return Err(ConfigError::InvalidJob {
                id: self.id.to_string(),
                reason: "command must name a program".to_string(),
            });
        };

        let runner = command_runner(program, command.collect(), self.working_dir);
        Ok(JobDescriptor::new(self.id, runner)
            .with_mode(self.mode)
            .with_overlap(self.overlap)
            .with_schedule(schedule))
    }
}

/// Parse job file contents.
pub fn parse_job_file(contents: &str) -> Result<Vec<JobFileEntry>, ConfigError> {
    Ok(serde_json::from_str(contents)?)
}

/// Read and parse a job file from disk.
pub async fn load_job_file(path: &Path) -> Result<Vec<JobFileEntry>, ConfigError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_job_file(&contents)
}

/// Validate entries into a registry.
pub fn build_registry(entries: Vec<JobFileEntry>) -> Result<JobRegistry, ConfigError> {
    entries
        .into_iter()
        .try_fold(JobRegistry::builder(), |builder, entry| {
            Ok::<_, ConfigError>(builder.register(entry.into_descriptor()?))
        })?
        .build()
        .map_err(ConfigError::from)
}

/// Load a job file straight into a registry.
pub async fn load_registry(path: &Path) -> Result<JobRegistry, ConfigError> {
    build_registry(load_job_file(path).await?)
}

/// Environment variable name for payload key `key`.
///
/// The key is upper-cased and anything outside `[A-Z0-9]` becomes `_`.
pub fn param_env_name(key: &str) -> String {
    let suffix: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{PARAM_ENV_PREFIX}{suffix}")
}

fn command_runner(program: String, args: Vec<String>, working_dir: Option<PathBuf>) -> JobRunner {
    let program = Arc::new(program);
    let args = Arc::new(args);
    let working_dir = working_dir.map(Arc::new);

    Arc::new(move |ctx: JobContext| {
        let program = Arc::clone(&program);
        let args = Arc::clone(&args);
        let working_dir = working_dir.clone();

        Box::pin(async move {
            let mut cmd = Command::new(program.as_str());
            cmd.args(args.iter())
                .env("JOBDESK_JOB", ctx.job.as_str())
                .env("JOBDESK_RUN_ID", ctx.run_id.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            for (key, value) in ctx.payload.iter() {
                cmd.env(param_env_name(key), value);
            }
            if let Some(dir) = working_dir.as_deref() {
                cmd.current_dir(dir);
            }

            let output = cmd
                .output()
                .await
                .map_err(|e| format!("failed to spawn {program}: {e}"))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!(job = %ctx.job, stdout = %stdout.trim(), "command output");
            }

            if output.status.success() {
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    job = %ctx.job,
                    status = %output.status,
                    stderr = %stderr.trim(),
                    "command failed"
                );
                Err(format!("{program} exited with {}: {}", output.status, stderr.trim()))
            }
        })
    })
}
