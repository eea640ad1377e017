//! Shared type definitions for Kiln.
//!
//! Every crate in the workspace speaks these types: identifiers, the stored
//! data model, the error taxonomy and the cancellation token used by batch
//! operations.
//!
//! # Modules
//!
//! - [`ids`] -- String-backed identifiers and the UUID v7 notification id
//! - [`enums`] -- Sentiment labels, notification states, priorities, roles
//! - [`structs`] -- Documents, events, rate-limit state, sync jobs, notifications
//! - [`error`] -- [`ErrorClass`], the taxonomy every crate error maps onto
//! - [`cancel`] -- [`CancelToken`] for chunk-granular cancellation

pub mod cancel;
pub mod enums;
pub mod error;
pub mod ids;
pub mod structs;

pub use cancel::CancelToken;
pub use enums::{NotificationKind, NotificationStatus, Priority, Role, SentimentLabel};
pub use error::ErrorClass;
pub use ids::{ActorId, ChannelId, DocumentId, EventId, NotificationId, SubjectId};
pub use structs::{
    Document, DocumentPatch, Event, Notification, NotificationDraft, Principal, RateLimitState,
    SyncJob,
};
