//! Single-flight memoizing cache for jobdesk.
//!
//! Concurrent requests for the same key share one computation and all receive
//! its value or its error. Values may expire after a TTL; failures are not
//! cached unless a [`FailurePolicy`] says otherwise.

mod cache;
mod error;

pub use cache::{EntryState, FailurePolicy, SingleFlightCache};
pub use error::CacheError;
