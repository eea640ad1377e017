//! Durable notifications for Kiln.
//!
//! Producers queue a [`NotificationDraft`](kiln_types::NotificationDraft)
//! in the [`RetryQueue`]; periodic sweeps render it to HTML and hand it to
//! a [`Transport`]. Failed attempts are retried up to a fixed ceiling and
//! then parked in the failed list. Delivery is at-least-once.
//!
//! # Modules
//!
//! - [`queue`] -- Retry queue, history, status and cleanup
//! - [`producers`] -- Notifications for platform events
//! - [`transport`] -- HTTP mail API and simulated transport
//! - [`template`] -- HTML rendering via `minijinja`
//! - [`error`] -- [`NotifyError`]

pub mod error;
pub mod producers;
pub mod queue;
pub mod template;
pub mod transport;

pub use error::NotifyError;
pub use producers::{PaymentDecision, Recipient};
pub use queue::{
    BatchReport, CleanupReport, EnqueueReceipt, HistoryFilter, QueueStatus, RetryQueue,
    RetryQueueConfig,
};
pub use template::EmailRenderer;
pub use transport::{HttpMailer, Mailer, MailerConfig, OutgoingMail, SimulatedMailer, Transport};
