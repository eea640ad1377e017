//! Notifications for platform events.
//!
//! Each producer builds the subject, message and metadata rows for one
//! kind of event and queues it. Recipients without an email address are
//! skipped and the producer returns `None`.

use std::collections::BTreeMap;

use chrono::Utc;
use rust_decimal::Decimal;

use kiln_types::{NotificationDraft, NotificationKind, Priority};

use crate::error::NotifyError;
use crate::queue::{EnqueueReceipt, RetryQueue};
use crate::transport::Transport;

/// Who a notification goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Social handle, used as the display name fallback.
    pub handle: String,
    /// Display name.
    pub name: Option<String>,
    /// Email address; nothing is sent without one.
    pub email: Option<String>,
}

impl Recipient {
    /// Name used in the greeting.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.handle)
    }

    fn address(&self) -> Option<&str> {
        self.email.as_deref().filter(|e| !e.is_empty())
    }
}

/// Outcome of a payment review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentDecision {
    /// Approved for `amount`.
    Approved {
        /// Amount in dollars.
        amount: Decimal,
    },
    /// Rejected, optionally with a reason.
    Rejected {
        /// Amount that was requested.
        amount: Decimal,
        /// Reviewer's reason.
        reason: Option<String>,
    },
}

fn rows<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

impl<T: Transport> RetryQueue<T> {
    async fn produce(
        &self,
        recipient: &Recipient,
        kind: NotificationKind,
        subject: String,
        message: String,
        metadata: BTreeMap<String, String>,
        priority: Priority,
    ) -> Result<Option<EnqueueReceipt>, NotifyError> {
        let Some(address) = recipient.address() else {
            tracing::debug!(
                handle = %recipient.handle,
                ?kind,
                "Recipient has no email, notification skipped"
            );
            return Ok(None);
        };
        let draft = NotificationDraft {
            kind,
            recipient: address.to_owned(),
            recipient_name: recipient.display_name().to_owned(),
            subject,
            message,
            metadata,
        };
        self.enqueue(draft, priority).await.map(Some)
    }

    /// A note was added to the recipient's profile.
    pub async fn notify_note_added(
        &self,
        recipient: &Recipient,
        author: &str,
        content: &str,
    ) -> Result<Option<EnqueueReceipt>, NotifyError> {
        self.produce(
            recipient,
            NotificationKind::NoteAdded,
            "New Note Added to Your Profile".to_owned(),
            format!("{author} has added a note to your profile: \"{content}\""),
            rows([("author", author.to_owned()), ("added_at", Utc::now().to_rfc3339())]),
            Priority::Normal,
        )
        .await
    }

    /// The recipient was assigned to a campaign. High priority.
    pub async fn notify_assignment(
        &self,
        recipient: &Recipient,
        campaign: &str,
        role: &str,
    ) -> Result<Option<EnqueueReceipt>, NotifyError> {
        self.produce(
            recipient,
            NotificationKind::CampaignAssigned,
            format!("You've been assigned to campaign: {campaign}"),
            format!(
                "You have been assigned as a {role} to the campaign \"{campaign}\". \
                 Please check the platform for more details."
            ),
            rows([
                ("campaign", campaign.to_owned()),
                ("role", role.to_owned()),
                ("assigned_at", Utc::now().to_rfc3339()),
            ]),
            Priority::High,
        )
        .await
    }

    /// A payment was reviewed. High priority.
    pub async fn notify_payment_status(
        &self,
        recipient: &Recipient,
        campaign: &str,
        decision: &PaymentDecision,
    ) -> Result<Option<EnqueueReceipt>, NotifyError> {
        let (kind, subject, message, metadata) = match decision {
            PaymentDecision::Approved { amount } => (
                NotificationKind::PaymentApproved,
                format!("Payment Approved - {campaign}"),
                format!(
                    "Your payment of ${amount} for campaign \"{campaign}\" has been approved \
                     and will be processed soon."
                ),
                rows([
                    ("campaign", campaign.to_owned()),
                    ("amount", format!("${amount}")),
                    ("status", "approved".to_owned()),
                ]),
            ),
            PaymentDecision::Rejected { amount, reason } => {
                let mut metadata = rows([
                    ("campaign", campaign.to_owned()),
                    ("amount", format!("${amount}")),
                    ("status", "rejected".to_owned()),
                ]);
                let mut message =
                    format!("Your payment request for campaign \"{campaign}\" has been rejected.");
                if let Some(reason) = reason.as_deref().filter(|r| !r.is_empty()) {
                    message.push_str(" Reason: ");
                    message.push_str(reason);
                    metadata.insert("reason".to_owned(), reason.to_owned());
                }
                (
                    NotificationKind::PaymentRejected,
                    format!("Payment Rejected - {campaign}"),
                    message,
                    metadata,
                )
            }
        };
        self.produce(recipient, kind, subject, message, metadata, Priority::High)
            .await
    }

    /// The recipient's campaign stage changed.
    pub async fn notify_stage_update(
        &self,
        recipient: &Recipient,
        campaign: &str,
        old_stage: &str,
        new_stage: &str,
    ) -> Result<Option<EnqueueReceipt>, NotifyError> {
        self.produce(
            recipient,
            NotificationKind::StageUpdated,
            format!("Campaign Stage Updated - {campaign}"),
            format!(
                "Your stage in campaign \"{campaign}\" has been updated \
                 from \"{old_stage}\" to \"{new_stage}\"."
            ),
            rows([
                ("campaign", campaign.to_owned()),
                ("old_stage", old_stage.to_owned()),
                ("new_stage", new_stage.to_owned()),
                ("updated_at", Utc::now().to_rfc3339()),
            ]),
            Priority::Normal,
        )
        .await
    }
}
