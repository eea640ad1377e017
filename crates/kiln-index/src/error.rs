//! Error types for the index layer.

use kiln_store::StoreError;
use kiln_types::{ErrorClass, Role};

/// Errors that can occur in the index manager and query engine.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A store operation failed, or a document did not decode.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The document does not exist.
    #[error("Document {namespace}/{id} not found")]
    NotFound {
        /// Collection namespace.
        namespace: String,
        /// Document id.
        id: String,
    },

    /// The principal's role may not write to the collection.
    #[error("Principal {principal} ({role:?}) may not write to {namespace}")]
    Unauthorized {
        /// Principal id.
        principal: String,
        /// Principal role.
        role: Role,
        /// Collection namespace.
        namespace: String,
    },

    /// A collection schema would produce keys that overlap another
    /// collection's.
    #[error("Invalid collection schema {namespace:?}: {reason}")]
    InvalidSchema {
        /// Offending namespace.
        namespace: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl IndexError {
    /// Map onto the cross-crate taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Unauthorized { .. } => ErrorClass::Unauthorized,
            Self::InvalidSchema { .. } => ErrorClass::PermanentFailure,
        }
    }
}
