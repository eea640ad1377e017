//! Error types for the Kiln worker binary.
//!
//! [`EngineError`] wraps every failure mode of start-up and shutdown so
//! `main` can propagate with `?`.

use kiln_analytics::AnalyticsError;
use kiln_index::IndexError;
use kiln_notify::NotifyError;
use kiln_store::StoreError;
use kiln_sync::SyncError;
use kiln_types::ErrorClass;

use crate::config::ConfigError;

/// Top-level error for the worker binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The store could not be reached.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },

    /// A collection schema was rejected.
    #[error("index error: {source}")]
    Index {
        /// The underlying index error.
        #[from]
        source: IndexError,
    },

    /// Analytics setup failed.
    #[error("analytics error: {source}")]
    Analytics {
        /// The underlying analytics error.
        #[from]
        source: AnalyticsError,
    },

    /// Sync engine setup or shutdown failed.
    #[error("sync error: {source}")]
    Sync {
        /// The underlying sync error.
        #[from]
        source: SyncError,
    },

    /// Notification queue setup failed.
    #[error("notification error: {source}")]
    Notify {
        /// The underlying notification error.
        #[from]
        source: NotifyError,
    },

    /// Logging could not be initialized.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}

impl EngineError {
    /// Map onto the cross-crate taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config { .. } | Self::Logging { .. } => ErrorClass::PermanentFailure,
            Self::Store { source } => source.class(),
            Self::Index { source } => source.class(),
            Self::Analytics { source } => source.class(),
            Self::Sync { source } => source.class(),
            Self::Notify { source } => source.class(),
        }
    }
}
