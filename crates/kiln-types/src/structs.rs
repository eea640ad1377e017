//! Core data model structs.
//!
//! These types are serialized as JSON into the primitive store. Field names
//! use `camelCase` on the wire so documents written by other producers of
//! the same keyspace decode without translation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{NotificationKind, NotificationStatus, Priority, Role, SentimentLabel};
use crate::ids::{ActorId, ChannelId, DocumentId, EventId, NotificationId, SubjectId};

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// The canonical record for one entity in an indexed collection.
///
/// Only `facets` are indexed. `body` is opaque JSON and is never indexed,
/// although free-text search may scan selected body fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Immutable identity.
    pub id: DocumentId,
    /// Indexed attributes: facet name to one or more values.
    #[serde(default)]
    pub facets: BTreeMap<String, Vec<String>>,
    /// Opaque payload.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Principal id of the last writer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl Document {
    /// Create a new document with no facets and an empty object body.
    pub fn new(id: impl Into<DocumentId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            facets: BTreeMap::new(),
            body: serde_json::Value::Object(serde_json::Map::new()),
            created_at: now,
            updated_at: now,
            updated_by: None,
        }
    }

    /// Builder: set a single-valued facet.
    #[must_use]
    pub fn with_facet(mut self, name: &str, value: &str) -> Self {
        self.facets.insert(name.to_owned(), vec![value.to_owned()]);
        self
    }

    /// Builder: set a multi-valued facet.
    #[must_use]
    pub fn with_facet_values(mut self, name: &str, values: &[&str]) -> Self {
        self.facets.insert(
            name.to_owned(),
            values.iter().map(|v| (*v).to_owned()).collect(),
        );
        self
    }

    /// Builder: replace the body.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Builder: override the creation timestamp.
    #[must_use]
    pub const fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Values of a facet, empty when the facet is absent.
    pub fn facet(&self, name: &str) -> &[String] {
        self.facets.get(name).map_or(&[], Vec::as_slice)
    }
}

/// A partial update to a [`Document`].
///
/// Facets named in the patch replace the stored values for that facet (an
/// empty list clears the facet). Facets not named are left untouched. An
/// object body is merged key-by-key into the stored body; any other JSON
/// value replaces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    /// Facet replacements.
    #[serde(default)]
    pub facets: BTreeMap<String, Vec<String>>,
    /// Body merge or replacement.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl DocumentPatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: replace a facet with a single value.
    #[must_use]
    pub fn set_facet(mut self, name: &str, value: &str) -> Self {
        self.facets.insert(name.to_owned(), vec![value.to_owned()]);
        self
    }

    /// Builder: replace a facet with several values.
    #[must_use]
    pub fn set_facet_values(mut self, name: &str, values: &[&str]) -> Self {
        self.facets.insert(
            name.to_owned(),
            values.iter().map(|v| (*v).to_owned()).collect(),
        );
        self
    }

    /// Builder: clear a facet entirely.
    #[must_use]
    pub fn clear_facet(mut self, name: &str) -> Self {
        self.facets.insert(name.to_owned(), Vec::new());
        self
    }

    /// Builder: merge into the body.
    #[must_use]
    pub fn merge_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// The identity performing a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal id (user id or job name).
    pub id: String,
    /// Role used for write authorization.
    pub role: Role,
}

impl Principal {
    /// Create a principal.
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    /// The internal system principal; always authorized.
    pub fn system() -> Self {
        Self {
            id: "system".to_owned(),
            role: Role::System,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An immutable, append-only analytics record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event id.
    pub id: EventId,
    /// Subject the event belongs to.
    pub subject_id: SubjectId,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Optional category label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Classifier label, when classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_label: Option<SentimentLabel>,
    /// Classifier confidence in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_confidence: Option<f64>,
    /// Who produced the event.
    pub actor_id: ActorId,
    /// Where the event was observed.
    pub channel_id: ChannelId,
    /// Display name of the actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    /// Display name of the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// Raw text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Classifier tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Id of the event this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EventId>,
}

impl Event {
    /// Create an unclassified event.
    pub fn new(
        id: impl Into<EventId>,
        subject_id: impl Into<SubjectId>,
        actor_id: impl Into<ActorId>,
        channel_id: impl Into<ChannelId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            subject_id: subject_id.into(),
            timestamp,
            category: None,
            sentiment_label: None,
            sentiment_confidence: None,
            actor_id: actor_id.into(),
            channel_id: channel_id.into(),
            actor_name: None,
            channel_name: None,
            content: None,
            tags: Vec::new(),
            reply_to: None,
        }
    }

    /// Builder: attach a sentiment classification.
    #[must_use]
    pub const fn with_sentiment(mut self, label: SentimentLabel, confidence: f64) -> Self {
        self.sentiment_label = Some(label);
        self.sentiment_confidence = Some(confidence);
        self
    }

    /// Builder: attach a category.
    #[must_use]
    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_owned());
        self
    }

    /// Builder: attach text content.
    #[must_use]
    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Some(content.to_owned());
        self
    }

    /// Builder: mark as a reply to `parent`.
    #[must_use]
    pub fn with_reply_to(mut self, parent: impl Into<EventId>) -> Self {
        self.reply_to = Some(parent.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Rate limiting and sync
// ---------------------------------------------------------------------------

/// Quota state of one external resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    /// Calls (or ids) still available in the current window.
    pub remaining: u32,
    /// Window capacity.
    pub limit: u32,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitState {
    /// The state as seen at `now`: once `now >= reset_at` the full limit is
    /// available regardless of the stored `remaining`.
    pub fn effective_remaining(&self, now: DateTime<Utc>) -> u32 {
        if now >= self.reset_at {
            self.limit
        } else {
            self.remaining.min(self.limit)
        }
    }

    /// Whether `needed` units fit in the quota at `now`.
    pub fn can_proceed(&self, needed: u32, now: DateTime<Utc>) -> bool {
        self.effective_remaining(now) >= needed
    }
}

/// A request to refresh external metrics for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    /// Subject whose metrics are refreshed.
    pub subject_id: SubjectId,
    /// External item ids to look up.
    pub requested_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// The producer-supplied content of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDraft {
    /// Business event being reported.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Delivery address.
    pub recipient: String,
    /// Display name used in the greeting.
    pub recipient_name: String,
    /// Message subject line.
    pub subject: String,
    /// Plain-text message body.
    pub message: String,
    /// Extra key/value rows rendered under the message.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A notification as stored in the retry queue lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Unique id.
    pub id: NotificationId,
    /// Content.
    #[serde(flatten)]
    pub payload: NotificationDraft,
    /// Requested priority.
    #[serde(default)]
    pub priority: Priority,
    /// Lifecycle state.
    pub status: NotificationStatus,
    /// Delivery attempts started so far. Only ever increases.
    pub attempts: u32,
    /// When the notification was enqueued.
    pub created_at: DateTime<Utc>,
    /// Error message from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When delivery succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Wrap a draft as a fresh pending notification.
    pub fn pending(payload: NotificationDraft, priority: Priority, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::new(),
            payload,
            priority,
            status: NotificationStatus::Pending,
            attempts: 0,
            created_at: now,
            last_error: None,
            sent_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn quota_resets_after_reset_at() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap_or_default();
        let state = RateLimitState {
            remaining: 0,
            limit: 300,
            reset_at: now + Duration::minutes(5),
        };
        assert!(!state.can_proceed(1, now));
        assert!(state.can_proceed(300, now + Duration::minutes(5)));
        assert!(!state.can_proceed(301, now + Duration::minutes(6)));
    }

    #[test]
    fn notification_flattens_payload() {
        let draft = NotificationDraft {
            kind: NotificationKind::StageUpdated,
            recipient: "kol@example.com".to_owned(),
            recipient_name: "Kol".to_owned(),
            subject: "Stage".to_owned(),
            message: "moved".to_owned(),
            metadata: BTreeMap::new(),
        };
        let n = Notification::pending(draft, Priority::Normal, Utc::now());
        let json = serde_json::to_value(&n).unwrap_or_default();
        assert_eq!(json["type"], "stage_updated");
        assert_eq!(json["recipient"], "kol@example.com");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["attempts"], 0);
    }

    #[test]
    fn document_defaults_tolerate_missing_fields() {
        let raw = concat!(
            r#"{"id":"p1","createdAt":"2025-01-01T00:00:00Z","#,
            r#""updatedAt":"2025-01-01T00:00:00Z"}"#
        );
        let doc: Result<Document, _> = serde_json::from_str(raw);
        assert!(doc.is_ok());
        let doc = doc.ok();
        assert!(doc.is_some_and(|d| d.facets.is_empty() && d.body.is_null()));
    }
}
