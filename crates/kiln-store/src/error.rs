//! Error types for the store layer.
//!
//! All errors are propagated via [`StoreError`], which wraps the underlying
//! [`fred`] and [`serde_json`] errors and carries the key involved whenever
//! a value could not be decoded.

use kiln_types::ErrorClass;

/// Errors that can occur in the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value did not decode as the requested type, after every
    /// fallback decode was tried.
    #[error("Type mismatch at {key}: {reason}")]
    TypeMismatch {
        /// Key holding the value.
        key: String,
        /// Decoder message from the canonical attempt.
        reason: String,
    },

    /// A key holds a value of the wrong primitive type (string vs set vs list).
    #[error("Wrong primitive type at {0}")]
    WrongType(String),

    /// A stored counter is not an integer, or would overflow.
    #[error("Counter at {0} is not a valid integer")]
    NotAnInteger(String),

    /// A configuration error (bad URL).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The in-memory store's lock was poisoned by a panicking writer.
    #[error("Memory store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Map onto the cross-crate taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Dragonfly(e) if e.details().contains("WRONGTYPE") => ErrorClass::TypeMismatch,
            Self::Dragonfly(_) => ErrorClass::TransientIo,
            Self::TypeMismatch { .. } | Self::WrongType(_) | Self::NotAnInteger(_) => {
                ErrorClass::TypeMismatch
            }
            Self::Serialization(_) | Self::Config(_) | Self::Poisoned => {
                ErrorClass::PermanentFailure
            }
        }
    }
}
