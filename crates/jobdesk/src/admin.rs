//! Administrative trigger surface.
//!
//! Each operation is a thin call into the dispatcher with a well-known job
//! identifier, or a direct or cached update check.

use std::sync::Arc;

use jobdesk_cache::CacheError;
use jobdesk_scheduler::{
    DispatchError, JobDispatcher, SchedulerError, TriggerOutcome, TriggerPayload,
};
use tracing::warn;

use crate::error::UpdateError;
use crate::jobs;
use crate::update::UpdateService;

/// Operator-facing job triggers and update checks.
#[derive(Clone)]
pub struct JobAdmin {
    dispatcher: JobDispatcher,
    updates: Arc<UpdateService>,
}

impl JobAdmin {
    pub fn new(dispatcher: JobDispatcher, updates: Arc<UpdateService>) -> Self {
        Self {
            dispatcher,
            updates,
        }
    }

    /// Fail if any well-known job is missing from the dispatcher's registry.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.dispatcher.registry().ensure_registered(jobs::ALL)
    }

    pub async fn force_update(&self) -> Result<TriggerOutcome, DispatchError> {
        self.dispatcher
            .trigger_by_name(jobs::AUTOMATIC_UPDATER, None)
            .await
    }

    pub async fn plex_user_importer(&self) -> Result<TriggerOutcome, DispatchError> {
        self.dispatcher
            .trigger_by_name(jobs::PLEX_USER_IMPORTER, None)
            .await
    }

    pub async fn emby_user_importer(&self) -> Result<TriggerOutcome, DispatchError> {
        self.dispatcher
            .trigger_by_name(jobs::EMBY_USER_IMPORTER, None)
            .await
    }

    /// Full content sync.
    pub async fn plex_content_cacher(&self) -> Result<TriggerOutcome, DispatchError> {
        self.plex_content_sync(false).await
    }

    /// Content sync limited to recently added items.
    pub async fn plex_recently_added(&self) -> Result<TriggerOutcome, DispatchError> {
        self.plex_content_sync(true).await
    }

    async fn plex_content_sync(
        &self,
        recently_added: bool,
    ) -> Result<TriggerOutcome, DispatchError> {
        let payload =
            TriggerPayload::new().with(jobs::RECENTLY_ADDED_SEARCH, recently_added.to_string());
        self.dispatcher
            .trigger_by_name(jobs::PLEX_CONTENT_SYNC, Some(payload))
            .await
    }

    pub async fn emby_content_cacher(&self) -> Result<TriggerOutcome, DispatchError> {
        self.dispatcher
            .trigger_by_name(jobs::EMBY_CONTENT_SYNC, None)
            .await
    }

    pub async fn newsletter(&self) -> Result<TriggerOutcome, DispatchError> {
        self.dispatcher.trigger_by_name(jobs::NEWSLETTER, None).await
    }

    /// Uncached update check. Failures are logged and reported as `false`.
    pub async fn check_for_update(&self) -> bool {
        match self.updates.check().await {
            Ok(available) => available,
            Err(e) => {
                warn!(error = %e, "update check failed");
                false
            }
        }
    }

    /// Cached update check. Failures propagate to the caller.
    pub async fn check_for_update_cached(&self) -> Result<bool, CacheError<UpdateError>> {
        self.updates.check_cached().await
    }
}
