//! Update checks against a release feed, with a single-flight cached variant.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobdesk_cache::{CacheError, SingleFlightCache};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::UpdateError;

/// Cache key under which the update check result is stored.
pub const UPDATE_CHECK_KEY: &str = "update-check";

/// How long a cached update check stays fresh by default.
pub const DEFAULT_UPDATE_TTL: Duration = Duration::from_secs(10 * 60);

/// The running build: its version and the release branch it tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub branch: String,
}

impl VersionInfo {
    pub fn new(version: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            branch: branch.into(),
        }
    }
}

/// Source of truth for whether a newer release exists.
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    /// The version currently running.
    fn current_version(&self) -> VersionInfo;

    /// Whether `branch` has a release newer than `version`.
    async fn update_available(&self, branch: &str, version: &str) -> Result<bool, UpdateError>;
}

#[derive(Debug, Deserialize)]
struct FeedRelease {
    version: String,
}

/// Checks a JSON release feed over HTTP.
///
/// `GET {feed_url}/{branch}` must answer `{"version": "x.y.z"}`.
pub struct HttpUpdateChecker {
    client: reqwest::Client,
    feed_url: String,
    current: VersionInfo,
}

impl HttpUpdateChecker {
    pub fn new(
        feed_url: impl Into<String>,
        current: VersionInfo,
        timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            feed_url: feed_url.into().trim_end_matches('/').to_string(),
            current,
        })
    }
}

#[async_trait]
impl UpdateChecker for HttpUpdateChecker {
    fn current_version(&self) -> VersionInfo {
        self.current.clone()
    }

    async fn update_available(&self, branch: &str, version: &str) -> Result<bool, UpdateError> {
        let url = format!("{}/{}", self.feed_url, branch);
        debug!(%url, "fetching release feed");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpdateError::Feed { status, body });
        }

        let release: FeedRelease = response.json().await?;
        let newer = compare_versions(&release.version, version)? == Ordering::Greater;
        debug!(current = version, remote = %release.version, newer, "compared versions");
        Ok(newer)
    }
}

/// Compare two dotted numeric versions.
///
/// A leading `v` is ignored and missing components count as zero, so `1.2`
/// equals `v1.2.0`.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, UpdateError> {
    let a = parse_version(a)?;
    let b = parse_version(b)?;

    let len = a.len().max(b.len());
    let component = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);
    Ok((0..len)
        .map(|i| component(&a, i).cmp(&component(&b, i)))
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal))
}

fn parse_version(raw: &str) -> Result<Vec<u64>, UpdateError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if digits.is_empty() {
        return Err(UpdateError::InvalidVersion(raw.to_string()));
    }

    digits
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| UpdateError::InvalidVersion(raw.to_string()))
        })
        .collect()
}

/// Update checks, direct or through a shared single-flight cache.
pub struct UpdateService {
    checker: Arc<dyn UpdateChecker>,
    cache: SingleFlightCache<bool, UpdateError>,
    ttl: Option<Duration>,
}

impl UpdateService {
    /// Create a service whose cached checks stay fresh for [`DEFAULT_UPDATE_TTL`].
    pub fn new(checker: Arc<dyn UpdateChecker>) -> Self {
        Self {
            checker,
            cache: SingleFlightCache::new(),
            ttl: Some(DEFAULT_UPDATE_TTL),
        }
    }

    /// Override the cache TTL. `None` keeps the result until invalidated.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Ask the checker directly, bypassing the cache.
    pub async fn check(&self) -> Result<bool, UpdateError> {
        let current = self.checker.current_version();
        self.checker
            .update_available(&current.branch, &current.version)
            .await
    }

    /// Cached check: concurrent callers share one request to the checker.
    pub async fn check_cached(&self) -> Result<bool, CacheError<UpdateError>> {
        let checker = Arc::clone(&self.checker);
        self.cache
            .get_or_compute(UPDATE_CHECK_KEY, self.ttl, move || async move {
                let current = checker.current_version();
                let available = checker
                    .update_available(&current.branch, &current.version)
                    .await?;
                info!(
                    version = %current.version,
                    branch = %current.branch,
                    available,
                    "update check completed"
                );
                Ok(available)
            })
            .await
    }

    /// Forget the cached result so the next cached check asks again.
    pub fn invalidate(&self) {
        self.cache.invalidate(UPDATE_CHECK_KEY);
    }
}
