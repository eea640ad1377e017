//! Append-only event log.
//!
//! An event is written once and never modified. Recording writes the body,
//! then adds the id to the subject, actor and channel sets and to the
//! subject's timeline (a sorted set scored by epoch milliseconds). The only
//! deletion path is [`EventLog::purge_before`], the bulk retention cleanup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kiln_store::{Store, keys};
use kiln_types::{ActorId, ChannelId, ErrorClass, Event, EventId, SubjectId};

use crate::classifier::{Classifier, SentimentClassifier};
use crate::error::AnalyticsError;

/// Whether [`EventLog::record`] wrote anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The event was new and is now stored.
    Recorded,
    /// An event with this id already exists; nothing was written.
    Duplicate,
}

/// A raw chat message before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Message id from the source platform.
    pub id: EventId,
    /// Tracked subject the channel belongs to.
    pub subject_id: SubjectId,
    /// Author.
    pub actor_id: ActorId,
    /// Author display name.
    #[serde(default)]
    pub actor_name: Option<String>,
    /// Channel.
    pub channel_id: ChannelId,
    /// Channel display name.
    #[serde(default)]
    pub channel_name: Option<String>,
    /// Text.
    pub content: String,
    /// When it was posted.
    pub timestamp: DateTime<Utc>,
    /// Message replied to.
    #[serde(default)]
    pub reply_to: Option<EventId>,
    /// Category label.
    #[serde(default)]
    pub category: Option<String>,
}

/// Event producer and reader. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventLog<C = SentimentClassifier> {
    store: Store,
    classifier: C,
}

#[allow(clippy::cast_precision_loss)]
fn score(ts: DateTime<Utc>) -> f64 {
    // Millisecond timestamps stay well inside f64's exact integer range.
    ts.timestamp_millis() as f64
}

impl<C: Classifier> EventLog<C> {
    /// Create an event log.
    pub const fn new(store: Store, classifier: C) -> Self {
        Self { store, classifier }
    }

    /// The classifier used by [`Self::ingest`].
    pub const fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Append an event. An existing id is never overwritten.
    pub async fn record(&self, event: &Event) -> Result<RecordOutcome, AnalyticsError> {
        let key = keys::event(event.id.as_str());
        if self.store.exists(&key).await? {
            debug!(id = %event.id, "Duplicate event ignored");
            return Ok(RecordOutcome::Duplicate);
        }

        self.store.set_json(&key, event).await?;

        let id = event.id.as_str();
        self.store.sadd(&keys::subject_events(event.subject_id.as_str()), id).await?;
        self.store.sadd(&keys::actor_events(event.actor_id.as_str()), id).await?;
        self.store.sadd(&keys::channel_events(event.channel_id.as_str()), id).await?;
        self.store
            .zadd(&keys::subject_timeline(event.subject_id.as_str()), score(event.timestamp), id)
            .await?;

        debug!(id, subject = %event.subject_id, "Event recorded");
        Ok(RecordOutcome::Recorded)
    }

    /// Classify a message's content, then record it as an event.
    pub async fn ingest(
        &self,
        message: IncomingMessage,
    ) -> Result<(Event, RecordOutcome), AnalyticsError> {
        let classification = if message.content.trim().is_empty() {
            crate::classifier::Classification::unavailable()
        } else {
            self.classifier.classify(&message.content).await
        };

        let mut event = Event::new(
            message.id,
            message.subject_id,
            message.actor_id,
            message.channel_id,
            message.timestamp,
        )
        .with_sentiment(classification.label, classification.confidence);
        event.tags = classification.tags;
        event.actor_name = message.actor_name;
        event.channel_name = message.channel_name;
        event.content = Some(message.content);
        event.reply_to = message.reply_to;
        event.category = message.category;

        let outcome = self.record(&event).await?;
        Ok((event, outcome))
    }

    /// Fetch one event.
    pub async fn get(&self, id: &EventId) -> Result<Option<Event>, AnalyticsError> {
        Ok(self.store.get_json(&keys::event(id.as_str())).await?)
    }

    /// Ids of every event of a subject.
    pub async fn subject_event_ids(
        &self,
        subject: &SubjectId,
    ) -> Result<Vec<String>, AnalyticsError> {
        Ok(self.store.smembers(&keys::subject_events(subject.as_str())).await?)
    }

    /// Every subject with a timeline. Scans the keyspace.
    pub async fn subjects(&self) -> Result<Vec<SubjectId>, AnalyticsError> {
        let prefix = keys::subject_events("");
        // `events:subject:{subject}:timeline` with an empty subject.
        let empty = keys::subject_timeline("");
        let suffix = empty.get(prefix.len()..).unwrap_or_default();
        let mut subjects: Vec<SubjectId> = self
            .store
            .keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str())?.strip_suffix(suffix))
            .map(SubjectId::from)
            .collect();
        subjects.sort();
        subjects.dedup();
        Ok(subjects)
    }

    /// Events of an actor, newest first, at most `limit`.
    pub async fn events_for_actor(
        &self,
        actor: &ActorId,
        limit: usize,
    ) -> Result<Vec<Event>, AnalyticsError> {
        self.load_set(&keys::actor_events(actor.as_str()), limit).await
    }

    /// Events seen in a channel, newest first, at most `limit`.
    pub async fn events_for_channel(
        &self,
        channel: &ChannelId,
        limit: usize,
    ) -> Result<Vec<Event>, AnalyticsError> {
        self.load_set(&keys::channel_events(channel.as_str()), limit).await
    }

    async fn load_set(&self, key: &str, limit: usize) -> Result<Vec<Event>, AnalyticsError> {
        let mut events = Vec::new();
        for id in self.store.smembers(key).await? {
            match self.get(&EventId::from(id)).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) if e.class() == ErrorClass::TypeMismatch => {
                    warn!(key, error = %e, "Skipping malformed event");
                }
                Err(e) => return Err(e),
            }
        }
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        events.truncate(limit);
        Ok(events)
    }

    /// Delete every event of `subject` older than `cutoff`. Returns how many
    /// were removed. Malformed events are left in place.
    pub async fn purge_before(
        &self,
        subject: &SubjectId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AnalyticsError> {
        let subject_key = keys::subject_events(subject.as_str());
        let timeline_key = keys::subject_timeline(subject.as_str());
        let mut purged: u64 = 0;

        for id in self.store.smembers(&subject_key).await? {
            let event = match self.get(&EventId::from(id.as_str())).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.store.srem(&subject_key, &id).await?;
                    self.store.zrem(&timeline_key, &id).await?;
                    continue;
                }
                Err(e) if e.class() == ErrorClass::TypeMismatch => {
                    warn!(%id, error = %e, "Retention skipping malformed event");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if event.timestamp >= cutoff {
                continue;
            }
            self.store.srem(&keys::actor_events(event.actor_id.as_str()), &id).await?;
            self.store.srem(&keys::channel_events(event.channel_id.as_str()), &id).await?;
            self.store.zrem(&timeline_key, &id).await?;
            self.store.srem(&subject_key, &id).await?;
            self.store.delete(&keys::event(&id)).await?;
            purged = purged.saturating_add(1);
        }

        info!(subject = %subject, purged, %cutoff, "Event retention cleanup complete");
        Ok(purged)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;
    use kiln_types::SentimentLabel;

    use super::*;
    use crate::classifier::{Classification, NeutralClassifier};

    struct Cheerful;

    impl Classifier for Cheerful {
        async fn classify(&self, _text: &str) -> Classification {
            Classification {
                label: SentimentLabel::Positive,
                confidence: 0.8,
                tags: vec!["valuable".to_owned()],
            }
        }
    }

    fn event(id: &str, ts: DateTime<Utc>) -> Event {
        Event::new(id, "campaign-1", "alice", "general", ts)
    }

    #[tokio::test]
    async fn subjects_are_discovered_from_timelines() {
        let log = EventLog::new(Store::memory(), NeutralClassifier);
        let now = Utc::now();
        log.record(&event("e1", now)).await.unwrap();
        log.record(&Event::new("e2", "campaign:2", "bob", "general", now)).await.unwrap();
        let subjects = log.subjects().await.unwrap();
        assert_eq!(subjects, vec![SubjectId::from("campaign-1"), SubjectId::from("campaign:2")]);
    }

    #[tokio::test]
    async fn record_is_append_only() {
        let log = EventLog::new(Store::memory(), NeutralClassifier);
        let now = Utc::now();
        assert_eq!(log.record(&event("e1", now)).await.unwrap(), RecordOutcome::Recorded);

        let altered = event("e1", now).with_category("spam");
        assert_eq!(log.record(&altered).await.unwrap(), RecordOutcome::Duplicate);
        let stored = log.get(&EventId::from("e1")).await.unwrap().unwrap();
        assert_eq!(stored.category, None);
    }

    #[tokio::test]
    async fn ingest_classifies_and_indexes() {
        let log = EventLog::new(Store::memory(), Cheerful);
        let message = IncomingMessage {
            id: EventId::from("m1"),
            subject_id: SubjectId::from("campaign-1"),
            actor_id: ActorId::from("bob"),
            actor_name: Some("Bob".to_owned()),
            channel_id: ChannelId::from("general"),
            channel_name: Some("general".to_owned()),
            content: "love this".to_owned(),
            timestamp: Utc::now(),
            reply_to: None,
            category: None,
        };
        let (event, outcome) = log.ingest(message).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Recorded);
        assert_eq!(event.sentiment_label, Some(SentimentLabel::Positive));
        assert_eq!(event.tags, vec!["valuable".to_owned()]);

        let by_actor = log.events_for_actor(&ActorId::from("bob"), 10).await.unwrap();
        assert_eq!(by_actor.len(), 1);
        let by_channel = log.events_for_channel(&ChannelId::from("general"), 10).await.unwrap();
        assert_eq!(by_channel.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_events() {
        let store = Store::memory();
        let log = EventLog::new(store.clone(), NeutralClassifier);
        let now = Utc::now();
        log.record(&event("old", now - Duration::days(40))).await.unwrap();
        log.record(&event("new", now)).await.unwrap();

        let purged = log
            .purge_before(&SubjectId::from("campaign-1"), now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(
            log.subject_event_ids(&SubjectId::from("campaign-1")).await.unwrap(),
            vec!["new"]
        );
        assert!(!store.exists(&keys::event("old")).await.unwrap());
        let timeline = store
            .zrange_with_scores(&keys::subject_timeline("campaign-1"), 0, -1)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 1);
    }
}
