//! jobdesk: administrative job triggers and cached update checks.
//!
//! This crate wires the scheduler and cache crates into an operator surface:
//! - [`JobAdmin`] triggers well-known jobs by identifier
//! - [`UpdateService`] checks a release feed, optionally through a single-flight cache
//! - [`config`] loads command-backed jobs from a JSON file

pub mod admin;
pub mod config;
pub mod error;
pub mod jobs;
pub mod update;

pub use admin::JobAdmin;
pub use error::{ConfigError, UpdateError};
pub use update::{
    DEFAULT_UPDATE_TTL, HttpUpdateChecker, UPDATE_CHECK_KEY, UpdateChecker, UpdateService,
    VersionInfo, compare_versions,
};
