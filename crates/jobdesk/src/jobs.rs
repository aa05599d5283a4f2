//! Well-known job identifiers used by the administrative surface.

pub const AUTOMATIC_UPDATER: &str = "IOmbiAutomaticUpdater";
pub const PLEX_USER_IMPORTER: &str = "IPlexUserImporter";
pub const EMBY_USER_IMPORTER: &str = "IEmbyUserImporter";
pub const PLEX_CONTENT_SYNC: &str = "PlexContentSync";
pub const EMBY_CONTENT_SYNC: &str = "IEmbyContentSync";
pub const NEWSLETTER: &str = "INewsletterJob";

/// Every identifier [`crate::JobAdmin`] may trigger.
pub const ALL: [&str; 6] = [
    AUTOMATIC_UPDATER,
    PLEX_USER_IMPORTER,
    EMBY_USER_IMPORTER,
    PLEX_CONTENT_SYNC,
    EMBY_CONTENT_SYNC,
    NEWSLETTER,
];

/// Payload key selecting a recently-added-only content sync.
pub const RECENTLY_ADDED_SEARCH: &str = "recentlyAddedSearch";
