//! Enumeration types shared across the Kiln crates.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sentiment
// ---------------------------------------------------------------------------

/// Sentiment label assigned to an event by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    /// Constructive or approving tone.
    Positive,
    /// No discernible tone, or classification unavailable.
    Neutral,
    /// Hostile, critical, or toxic tone.
    Negative,
}

impl SentimentLabel {
    /// Numeric score on a `-1 / 0 / +1` scale, used for sentiment averages.
    pub const fn score(self) -> i64 {
        match self {
            Self::Positive => 1,
            Self::Neutral => 0,
            Self::Negative => -1,
        }
    }

    /// Parse a label leniently; anything unrecognized maps to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued notification.
///
/// ```text
/// pending -> sending -> sent
///               |-----> failed_retry  (attempts < max, back in the pending list)
///               +-----> failed_terminal (attempts == max, parked)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Waiting for its first delivery attempt.
    Pending,
    /// A delivery attempt is in flight.
    Sending,
    /// Delivered; archived in the sent history.
    Sent,
    /// Last attempt failed; waiting in the pending list for another attempt.
    FailedRetry,
    /// Retry ceiling reached; no further automatic transition.
    FailedTerminal,
}

impl NotificationStatus {
    /// Whether a sweep may pick this item up for delivery.
    ///
    /// `Sending` is included: an item left in that state was interrupted
    /// mid-delivery and is redelivered (at-least-once).
    pub const fn is_deliverable(self) -> bool {
        matches!(self, Self::Pending | Self::Sending | Self::FailedRetry)
    }
}

/// Business event a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A note was added to the recipient's profile.
    NoteAdded,
    /// The recipient was assigned to a campaign.
    CampaignAssigned,
    /// A payment was approved.
    PaymentApproved,
    /// A payment was rejected.
    PaymentRejected,
    /// The recipient's campaign stage changed.
    StageUpdated,
    /// The recipient's profile was updated.
    ProfileUpdated,
}

/// Delivery priority requested by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Deliver on the next sweep, no urgency.
    Low,
    /// Deliver on the next sweep.
    #[default]
    Normal,
    /// Attempt delivery synchronously at enqueue time as well.
    High,
}

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

/// Role of a principal performing a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Internal jobs (sync engine, reconciliation, migrations).
    System,
    /// Platform administrator.
    Admin,
    /// Core team member.
    Core,
    /// Regular member.
    Member,
    /// Read-only viewer.
    Viewer,
}
