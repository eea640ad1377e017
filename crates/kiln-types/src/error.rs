//! Cross-crate error taxonomy.
//!
//! Every crate has its own `thiserror` enum; each maps onto one
//! [`ErrorClass`] so callers (workers, the binary) can decide whether to
//! retry without matching on another crate's variants.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The addressed record does not exist.
    NotFound,
    /// A stored value has an unexpected shape after every decode fallback.
    TypeMismatch,
    /// An external quota is exhausted.
    RateLimited,
    /// The principal may not perform the mutation.
    Unauthorized,
    /// Store or network failure that may succeed on retry.
    TransientIo,
    /// Failure that will not succeed on retry.
    PermanentFailure,
}

impl ErrorClass {
    /// Whether retrying the same operation later can succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientIo)
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::TypeMismatch => "type_mismatch",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::TransientIo => "transient_io",
            Self::PermanentFailure => "permanent_failure",
        };
        f.write_str(name)
    }
}
