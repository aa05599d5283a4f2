//! Error types for the cache.

use std::sync::Arc;

use thiserror::Error;

/// Errors delivered to every waiter of a computation.
#[derive(Debug, Error)]
pub enum CacheError<E> {
    /// The producer returned an error. All waiters share the same instance.
    #[error("{0}")]
    Producer(Arc<E>),

    /// The producer panicked or its task was cancelled before finishing.
    #[error("computation was abandoned before completing")]
    Abandoned,
}

impl<E> CacheError<E> {
    /// The producer's error, if that is what this is.
    pub fn producer_error(&self) -> Option<&E> {
        match self {
            Self::Producer(e) => Some(e),
            Self::Abandoned => None,
        }
    }
}

// Derived Clone would require `E: Clone`; the Arc makes that unnecessary.
impl<E> Clone for CacheError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Producer(e) => Self::Producer(Arc::clone(e)),
            Self::Abandoned => Self::Abandoned,
        }
    }
}
