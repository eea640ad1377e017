//! Error types for the analytics layer.

use chrono::{DateTime, Utc};
use kiln_store::StoreError;
use kiln_types::ErrorClass;

/// Errors that can occur while recording or aggregating events.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A custom window whose start is not before its end.
    #[error("Invalid window: start {start} is not before end {end}")]
    InvalidWindow {
        /// Requested start.
        start: DateTime<Utc>,
        /// Requested end.
        end: DateTime<Utc>,
    },

    /// A named window that cannot be resolved against `end`.
    #[error("Window out of range: {0}")]
    OutOfRange(String),

    /// A reporting zone offset outside `-23..=23` hours.
    #[error("Invalid UTC offset: {0} hours")]
    InvalidOffset(i32),

    /// The classifier endpoint failed. Never surfaced by `classify`, which
    /// degrades instead; kept for callers using the raw request.
    #[error("Classifier error: {0}")]
    Classifier(String),
}

impl AnalyticsError {
    /// Map onto the cross-crate taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            Self::InvalidWindow { .. } | Self::OutOfRange(_) | Self::InvalidOffset(_) => {
                ErrorClass::PermanentFailure
            }
            Self::Classifier(_) => ErrorClass::TransientIo,
        }
    }
}
