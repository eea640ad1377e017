//! Error types for the notification queue.

use kiln_store::StoreError;
use kiln_types::ErrorClass;

/// Errors that can occur while queueing or delivering notifications.
///
/// A failed delivery attempt is not an error of the queue: it is recorded
/// on the notification and the sweep moves on. These variants surface
/// from the transport itself and from store I/O.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The mail API could not be reached or returned a server error.
    #[error("mail transport error: {0}")]
    Transport(String),

    /// The mail API rejected the request permanently.
    #[error("mail API rejected message: {0}")]
    Rejected(String),

    /// The mail API rejected the credentials.
    #[error("mail API unauthorized: {0}")]
    Unauthorized(String),

    /// The email body could not be rendered.
    #[error("template render error: {0}")]
    Template(String),
}

impl NotifyError {
    /// Map onto the cross-crate taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            Self::Transport(_) => ErrorClass::TransientIo,
            Self::Rejected(_) | Self::Template(_) => ErrorClass::PermanentFailure,
            Self::Unauthorized(_) => ErrorClass::Unauthorized,
        }
    }
}
