//! Error types for the sync engine.

use kiln_store::StoreError;
use kiln_types::{ErrorClass, RateLimitState};

/// Errors that can occur while syncing external metrics.
///
/// Insufficient quota is not an error: it yields
/// [`crate::SyncOutcome::Deferred`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The metrics API rejected the call for quota reasons (HTTP 429).
    #[error("Metrics API quota exhausted")]
    QuotaExhausted {
        /// Quota reported alongside the rejection, if any.
        quota: Option<RateLimitState>,
    },

    /// The metrics API call failed.
    #[error("Metrics API error: {0}")]
    Api(String),

    /// The metrics API rejected the credentials.
    #[error("Metrics API unauthorized: {0}")]
    Unauthorized(String),
}

impl SyncError {
    /// Map onto the cross-crate taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            Self::QuotaExhausted { .. } => ErrorClass::RateLimited,
            Self::Api(_) => ErrorClass::TransientIo,
            Self::Unauthorized(_) => ErrorClass::Unauthorized,
        }
    }
}
