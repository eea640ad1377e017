//! Reply threads and per-actor activity.
//!
//! [`Aggregator::engagement`] reads the `reply_to` links of a subject's
//! events: how many events are replies, which events drew the most
//! replies, and how many distinct events started a thread.
//! [`Aggregator::user_activity`] follows one actor across every subject
//! they posted in.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kiln_store::keys;
use kiln_types::{ActorId, CancelToken, ErrorClass, EventId, SubjectId};

use crate::aggregator::{Aggregator, Outcome, SentimentSum, ratio};
use crate::error::AnalyticsError;
use crate::window::Window;

/// Threads reported in [`EngagementMetrics::top_replied`].
pub const TOP_REPLIED: usize = 5;

/// Characters of content kept in a thread excerpt.
pub const EXCERPT_CHARS: usize = 100;

/// An event that drew replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyThread {
    /// The replied-to event.
    pub event_id: EventId,
    /// Its content, cut to [`EXCERPT_CHARS`] with a trailing `...`.
    pub excerpt: String,
    /// Replies in the window.
    pub reply_count: u64,
    /// Author of the replied-to event.
    pub actor_id: ActorId,
    /// Author display name.
    pub actor_name: Option<String>,
}

/// Reply engagement of one subject over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    /// Subject.
    pub subject_id: SubjectId,
    /// Window name.
    pub window: String,
    /// Events in the window.
    pub total_events: u64,
    /// Events in the window that reply to another event.
    pub replies: u64,
    /// `replies / total_events`.
    pub average_replies_per_event: f64,
    /// Most replied-to events, reply count desc then id asc. Parents that
    /// no longer exist are left out.
    pub top_replied: Vec<ReplyThread>,
    /// Distinct events replied to at least once.
    pub conversation_threads: u64,
    /// Events that could not be decoded.
    pub excluded_events: u64,
}

/// One actor's footprint in one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectActivity {
    /// Subject.
    pub subject_id: SubjectId,
    /// Events by the actor in this subject.
    pub events: u64,
    /// Earliest event.
    pub first_seen: DateTime<Utc>,
    /// Latest event.
    pub last_seen: DateTime<Utc>,
    /// Mean sentiment score over the actor's classified events here.
    pub average_sentiment: f64,
}

/// One actor's activity across every subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    /// Actor.
    pub actor_id: ActorId,
    /// Per-subject activity, events desc then subject id asc.
    pub subjects: Vec<SubjectActivity>,
    /// Events across all subjects.
    pub total_events: u64,
    /// Subjects with at least one event.
    pub total_subjects: u64,
    /// Events that could not be decoded.
    pub excluded_events: u64,
}

fn excerpt(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

struct Seen {
    events: u64,
    first: DateTime<Utc>,
    last: DateTime<Utc>,
    sentiment: SentimentSum,
}

impl Aggregator {
    /// Reply engagement of `subject` over `window` (ending now).
    pub async fn engagement(
        &self,
        subject: &SubjectId,
        window: Window,
        cancel: &CancelToken,
    ) -> Result<Outcome<EngagementMetrics>, AnalyticsError> {
        let resolved = window.resolve(Utc::now())?;
        let mut total: u64 = 0;
        let mut replies: u64 = 0;
        let mut by_parent: HashMap<EventId, u64> = HashMap::new();

        let scan = self
            .for_each_event(subject, &resolved, cancel, |event| {
                total = total.saturating_add(1);
                if let Some(parent) = &event.reply_to {
                    replies = replies.saturating_add(1);
                    let count = by_parent.entry(parent.clone()).or_default();
                    *count = count.saturating_add(1);
                }
            })
            .await?;
        let Outcome::Complete(excluded) = scan else {
            return Ok(Outcome::Cancelled);
        };

        let mut ranked: Vec<(EventId, u64)> = by_parent.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let conversation_threads = u64::try_from(ranked.len()).unwrap_or(u64::MAX);

        let mut top_replied = Vec::with_capacity(TOP_REPLIED);
        for (parent, reply_count) in ranked.into_iter().take(TOP_REPLIED) {
            match self.load_event(parent.as_str()).await {
                Ok(Some(event)) => top_replied.push(ReplyThread {
                    excerpt: excerpt(event.content.as_deref().unwrap_or_default()),
                    event_id: parent,
                    reply_count,
                    actor_id: event.actor_id,
                    actor_name: event.actor_name,
                }),
                Ok(None) => debug!(subject = %subject, %parent, "Replied-to event not stored"),
                Err(e) if e.class() == ErrorClass::TypeMismatch => {
                    debug!(subject = %subject, %parent, error = %e, "Replied-to event malformed");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            subject = %subject,
            window = resolved.window.name(),
            total,
            replies,
            threads = conversation_threads,
            "Engagement computed"
        );
        Ok(Outcome::Complete(EngagementMetrics {
            subject_id: subject.clone(),
            window: resolved.window.name().to_owned(),
            total_events: total,
            replies,
            average_replies_per_event: ratio(replies, total),
            top_replied,
            conversation_threads,
            excluded_events: excluded,
        }))
    }

    /// Everything `actor` has posted, grouped by subject.
    pub async fn user_activity(
        &self,
        actor: &ActorId,
        cancel: &CancelToken,
    ) -> Result<Outcome<UserActivity>, AnalyticsError> {
        let ids = self
            .store()
            .smembers(&keys::actor_events(actor.as_str()))
            .await?;
        let mut seen: BTreeMap<SubjectId, Seen> = BTreeMap::new();

        let scan = self
            .scan_events(&ids, cancel, |event| {
                let entry = seen.entry(event.subject_id.clone()).or_insert_with(|| Seen {
                    events: 0,
                    first: event.timestamp,
                    last: event.timestamp,
                    sentiment: SentimentSum::default(),
                });
                entry.events = entry.events.saturating_add(1);
                entry.first = entry.first.min(event.timestamp);
                entry.last = entry.last.max(event.timestamp);
                entry.sentiment.add(event.sentiment_label);
            })
            .await?;
        let Outcome::Complete(excluded) = scan else {
            return Ok(Outcome::Cancelled);
        };

        let mut subjects: Vec<SubjectActivity> = seen
            .into_iter()
            .map(|(subject_id, s)| SubjectActivity {
                subject_id,
                events: s.events,
                first_seen: s.first,
                last_seen: s.last,
                average_sentiment: s.sentiment.mean(),
            })
            .collect();
        subjects.sort_by(|a, b| {
            b.events
                .cmp(&a.events)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        let total_events = subjects
            .iter()
            .fold(0_u64, |acc, s| acc.saturating_add(s.events));

        Ok(Outcome::Complete(UserActivity {
            actor_id: actor.clone(),
            total_subjects: u64::try_from(subjects.len()).unwrap_or(u64::MAX),
            subjects,
            total_events,
            excluded_events: excluded,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpts_are_cut_on_characters() {
        assert_eq!(excerpt("short"), "short");
        let cut = excerpt(&"é".repeat(101));
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 103);
        assert_eq!(excerpt(&"x".repeat(100)), "x".repeat(100));
    }
}
