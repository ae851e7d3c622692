use std::sync::Arc;

use thiserror::Error;

use crate::identity::LoaderIdentity;

/// Error type returned by batch functions and data sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A fetch error shared between every key of the batch it failed.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Failures that a [`Deferred`](crate::Deferred) can settle with.
///
/// A key that has no row and a value hidden by an authorization check are not failures; both
/// resolve successfully to `None`.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The identity or key of a request was malformed. Reported when the loader is built or
    /// bound to a context, before anything is queued.
    #[error("malformed load request: {0}")]
    MalformedRequest(String),

    /// The bulk fetch for a whole batch failed.
    #[error("batch fetch for {identity} failed: {source}")]
    BatchFetch { identity: LoaderIdentity, source: SharedError },

    /// An aligned batch result did not contain one entry per requested key.
    #[error("batch fetch for {identity} returned {returned} values for {requested} keys")]
    MisalignedBatch { identity: LoaderIdentity, requested: usize, returned: usize },

    /// The value being resolved can not settle: no batch is queued on this context.
    #[error("deferred value still pending after {ticks} dispatch ticks with no queued batches")]
    Stalled { ticks: u64 },

    /// The configured tick budget ran out before the work settled.
    #[error("dispatch tick limit of {limit} exceeded")]
    TickLimitExceeded { limit: u64 },

    /// A failure raised by a resolver continuation.
    #[error("{0}")]
    Custom(SharedError),
}

impl LoadError {
    pub fn custom<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        LoadError::Custom(Arc::from(error.into()))
    }

    pub(crate) fn batch_fetch(identity: &LoaderIdentity, source: BoxError) -> Self {
        LoadError::BatchFetch { identity: identity.clone(), source: Arc::from(source) }
    }

    /// The loader identity whose batch produced this error, if any.
    pub fn identity(&self) -> Option<&LoaderIdentity> {
        match self {
            LoadError::BatchFetch { identity, .. } | LoadError::MisalignedBatch { identity, .. } => {
                Some(identity)
            }
            _ => None,
        }
    }
}
