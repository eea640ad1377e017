//! Windowed analytics over a subject's events.
//!
//! The aggregator reads the subject's event-id set, loads events in
//! fixed-size batches, drops those outside the window and folds the rest
//! into one [`Aggregate`]. Hour and day buckets use the reporting zone.
//!
//! Guarantees on every result:
//! - `sum(hourly_histogram) == sum(daily_trend.events) == total_events`
//! - ratios and averages with a zero denominator are `0.0`
//! - `top_actors` is ordered by count desc, then actor id asc
//! - one malformed event never fails the aggregate; it is counted in
//!   `excluded_events`
//!
//! Every scan checks its [`CancelToken`] between batches. A cancelled scan
//! returns [`Outcome::Cancelled`] and nothing is cached.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kiln_store::{Store, keys};
use kiln_types::{
    ActorId, CancelToken, ChannelId, ErrorClass, Event, EventId, SentimentLabel, SubjectId,
};

use crate::cache::AggregateCache;
use crate::error::AnalyticsError;
use crate::window::{Resolved, Window};
use crate::zone::{DEFAULT_OFFSET_HOURS, ReportingZone};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Aggregator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Events loaded per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Length of `top_actors`.
    #[serde(default = "default_top_actors")]
    pub top_actors: usize,
    /// Cache TTL in seconds; `0` disables caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Reporting zone, hours east of UTC.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

const fn default_batch_size() -> usize {
    50
}

const fn default_top_actors() -> usize {
    10
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_utc_offset_hours() -> i32 {
    DEFAULT_OFFSET_HOURS
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            top_actors: default_top_actors(),
            cache_ttl_secs: default_cache_ttl_secs(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoint {
    /// Local date in the reporting zone.
    pub date: NaiveDate,
    /// Events on that date.
    pub events: u64,
    /// Mean sentiment score (`+1/0/-1`) over classified events.
    pub average_sentiment: f64,
}

/// One actor's share of the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorActivity {
    /// Actor.
    pub actor_id: ActorId,
    /// Last seen display name.
    pub actor_name: Option<String>,
    /// Events by this actor.
    pub events: u64,
    /// Mean sentiment score over the actor's classified events.
    pub average_sentiment: f64,
}

/// One channel's share of the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelActivity {
    /// Channel.
    pub channel_id: ChannelId,
    /// Last seen display name.
    pub channel_name: Option<String>,
    /// Events in this channel.
    pub events: u64,
}

/// Counts per sentiment label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentBreakdown {
    /// Positive events.
    pub positive: u64,
    /// Neutral events.
    pub neutral: u64,
    /// Negative events.
    pub negative: u64,
    /// Events without a label.
    pub unclassified: u64,
}

/// Share of each label among classified events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentRatios {
    /// Positive share.
    pub positive: f64,
    /// Neutral share.
    pub neutral: f64,
    /// Negative share.
    pub negative: f64,
}

/// Metrics for one subject over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    /// Subject.
    pub subject_id: SubjectId,
    /// Window name.
    pub window: String,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Events in the window.
    pub total_events: u64,
    /// Distinct actors.
    pub unique_actors: u64,
    /// `total_events / unique_actors`.
    pub average_events_per_actor: f64,
    /// Events per local hour of day; always 24 entries.
    pub hourly_histogram: Vec<u64>,
    /// Events per local day, ascending.
    pub daily_trend: Vec<DailyPoint>,
    /// Most active actors.
    pub top_actors: Vec<ActorActivity>,
    /// Events per channel, count desc then id asc.
    pub channel_activity: Vec<ChannelActivity>,
    /// Events per category; missing categories count as `uncategorized`.
    pub category_breakdown: BTreeMap<String, u64>,
    /// Events per sentiment label.
    pub sentiment_breakdown: SentimentBreakdown,
    /// Label shares among classified events.
    pub sentiment_ratios: SentimentRatios,
    /// Events that could not be decoded.
    pub excluded_events: u64,
}

/// Category bucket for events without one.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Result of a cancellable scan.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The scan visited every batch.
    Complete(T),
    /// The token was cancelled between batches; partial work was dropped.
    Cancelled,
}

impl<T> Outcome<T> {
    /// The completed value, if any.
    pub fn complete(self) -> Option<T> {
        match self {
            Self::Complete(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    /// Whether the scan was cancelled.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Arithmetic helpers
// ---------------------------------------------------------------------------

/// `numerator / denominator`, or `0.0` when the denominator is zero.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    // Event counts stay far below 2^52.
    numerator as f64 / denominator as f64
}

/// Signed mean, or `0.0` when there are no samples.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn mean(sum: i64, samples: u64) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    sum as f64 / samples as f64
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SentimentSum {
    pub(crate) sum: i64,
    pub(crate) classified: u64,
}

impl SentimentSum {
    pub(crate) fn add(&mut self, label: Option<SentimentLabel>) {
        if let Some(label) = label {
            self.sum = self.sum.saturating_add(label.score());
            self.classified = self.classified.saturating_add(1);
        }
    }

    pub(crate) fn mean(self) -> f64 {
        mean(self.sum, self.classified)
    }
}

#[derive(Debug, Default)]
struct DayTally {
    events: u64,
    sentiment: SentimentSum,
}

#[derive(Debug, Default)]
struct ActorTally {
    events: u64,
    name: Option<String>,
    sentiment: SentimentSum,
}

#[derive(Debug, Default)]
struct ChannelTally {
    events: u64,
    name: Option<String>,
}

struct Tally {
    zone: ReportingZone,
    total: u64,
    hourly: [u64; 24],
    daily: BTreeMap<NaiveDate, DayTally>,
    actors: HashMap<ActorId, ActorTally>,
    channels: HashMap<ChannelId, ChannelTally>,
    categories: BTreeMap<String, u64>,
    sentiment: SentimentBreakdown,
}

fn bump(counter: &mut u64) {
    *counter = counter.saturating_add(1);
}

impl Tally {
    fn new(zone: ReportingZone) -> Self {
        Self {
            zone,
            total: 0,
            hourly: [0; 24],
            daily: BTreeMap::new(),
            actors: HashMap::new(),
            channels: HashMap::new(),
            categories: BTreeMap::new(),
            sentiment: SentimentBreakdown::default(),
        }
    }

    fn add(&mut self, event: &Event) {
        bump(&mut self.total);

        if let Some(slot) = self.hourly.get_mut(self.zone.hour(event.timestamp)) {
            bump(slot);
        }

        let day = self.daily.entry(self.zone.day(event.timestamp)).or_default();
        bump(&mut day.events);
        day.sentiment.add(event.sentiment_label);

        let actor = self.actors.entry(event.actor_id.clone()).or_default();
        bump(&mut actor.events);
        actor.sentiment.add(event.sentiment_label);
        if event.actor_name.is_some() {
            actor.name.clone_from(&event.actor_name);
        }

        let channel = self.channels.entry(event.channel_id.clone()).or_default();
        bump(&mut channel.events);
        if event.channel_name.is_some() {
            channel.name.clone_from(&event.channel_name);
        }

        let category = event.category.as_deref().unwrap_or(UNCATEGORIZED);
        bump(self.categories.entry(category.to_owned()).or_default());

        match event.sentiment_label {
            Some(SentimentLabel::Positive) => bump(&mut self.sentiment.positive),
            Some(SentimentLabel::Neutral) => bump(&mut self.sentiment.neutral),
            Some(SentimentLabel::Negative) => bump(&mut self.sentiment.negative),
            None => bump(&mut self.sentiment.unclassified),
        }
    }

    fn finish(
        self,
        subject: &SubjectId,
        resolved: &Resolved,
        top_n: usize,
        excluded: u64,
    ) -> Aggregate {
        let unique_actors = u64::try_from(self.actors.len()).unwrap_or(u64::MAX);

        let mut top_actors: Vec<ActorActivity> = self
            .actors
            .into_iter()
            .map(|(actor_id, tally)| ActorActivity {
                actor_id,
                actor_name: tally.name,
                events: tally.events,
                average_sentiment: tally.sentiment.mean(),
            })
            .collect();
        top_actors.sort_by(|a, b| {
            b.events
                .cmp(&a.events)
                .then_with(|| a.actor_id.cmp(&b.actor_id))
        });
        top_actors.truncate(top_n);

        let mut channel_activity: Vec<ChannelActivity> = self
            .channels
            .into_iter()
            .map(|(channel_id, tally)| ChannelActivity {
                channel_id,
                channel_name: tally.name,
                events: tally.events,
            })
            .collect();
        channel_activity.sort_by(|a, b| {
            b.events
                .cmp(&a.events)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });

        let daily_trend = self
            .daily
            .into_iter()
            .map(|(date, day)| DailyPoint {
                date,
                events: day.events,
                average_sentiment: day.sentiment.mean(),
            })
            .collect();

        let s = self.sentiment;
        let classified = s.positive.saturating_add(s.neutral).saturating_add(s.negative);

        Aggregate {
            subject_id: subject.clone(),
            window: resolved.window.name().to_owned(),
            start: resolved.start,
            end: resolved.end,
            total_events: self.total,
            unique_actors,
            average_events_per_actor: ratio(self.total, unique_actors),
            hourly_histogram: self.hourly.to_vec(),
            daily_trend,
            top_actors,
            channel_activity,
            category_breakdown: self.categories,
            sentiment_breakdown: s,
            sentiment_ratios: SentimentRatios {
                positive: ratio(s.positive, classified),
                neutral: ratio(s.neutral, classified),
                negative: ratio(s.negative, classified),
            },
            excluded_events: excluded,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Computes and caches [`Aggregate`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Aggregator {
    store: Store,
    cache: AggregateCache,
    zone: ReportingZone,
    config: AggregatorConfig,
}

impl Aggregator {
    /// Create an aggregator.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::InvalidOffset`] if the configured zone is
    /// out of range.
    pub fn new(store: Store, config: AggregatorConfig) -> Result<Self, AnalyticsError> {
        let zone = ReportingZone::from_hours(config.utc_offset_hours)?;
        Ok(Self {
            cache: AggregateCache::new(store.clone(), config.cache_ttl_secs),
            store,
            zone,
            config,
        })
    }

    /// The reporting zone.
    pub const fn zone(&self) -> ReportingZone {
        self.zone
    }

    /// Aggregate a window ending now.
    pub async fn aggregate(
        &self,
        subject: &SubjectId,
        window: Window,
        cancel: &CancelToken,
    ) -> Result<Outcome<Aggregate>, AnalyticsError> {
        self.aggregate_ending(subject, window, Utc::now(), cancel).await
    }

    /// Aggregate a window ending at `end` (ignored for custom windows).
    pub async fn aggregate_ending(
        &self,
        subject: &SubjectId,
        window: Window,
        end: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<Outcome<Aggregate>, AnalyticsError> {
        let resolved = window.resolve(end)?;
        let signature = resolved.signature();

        if let Some(cached) = self.cache.get::<Aggregate>(subject.as_str(), &signature).await? {
            return Ok(Outcome::Complete(cached));
        }

        let Outcome::Complete(aggregate) = self.compute(subject, &resolved, cancel).await? else {
            info!(subject = %subject, window = resolved.window.name(), "Aggregation cancelled");
            return Ok(Outcome::Cancelled);
        };
        self.cache.put(subject.as_str(), &signature, &aggregate).await?;
        Ok(Outcome::Complete(aggregate))
    }

    /// Compute without touching the cache.
    pub async fn compute(
        &self,
        subject: &SubjectId,
        resolved: &Resolved,
        cancel: &CancelToken,
    ) -> Result<Outcome<Aggregate>, AnalyticsError> {
        let mut tally = Tally::new(self.zone);
        let scan = self
            .for_each_event(subject, resolved, cancel, |event| tally.add(event))
            .await?;
        let Outcome::Complete(excluded) = scan else {
            return Ok(Outcome::Cancelled);
        };
        let aggregate = tally.finish(subject, resolved, self.config.top_actors, excluded);

        info!(
            subject = %subject,
            window = %aggregate.window,
            total = aggregate.total_events,
            actors = aggregate.unique_actors,
            excluded,
            "Aggregate computed"
        );
        Ok(Outcome::Complete(aggregate))
    }

    /// Visit every decodable event of `subject` inside the window.
    /// Completes with how many events were excluded as malformed.
    pub(crate) async fn for_each_event(
        &self,
        subject: &SubjectId,
        resolved: &Resolved,
        cancel: &CancelToken,
        mut visit: impl FnMut(&Event),
    ) -> Result<Outcome<u64>, AnalyticsError> {
        let ids = self.store.smembers(&keys::subject_events(subject.as_str())).await?;
        self.scan_events(&ids, cancel, |event| {
            if resolved.contains(event.timestamp) {
                visit(event);
            }
        })
        .await
    }

    /// Load `ids` in batches and visit each decodable event. Missing events
    /// are ignored; malformed ones are counted.
    pub(crate) async fn scan_events(
        &self,
        ids: &[String],
        cancel: &CancelToken,
        mut visit: impl FnMut(&Event),
    ) -> Result<Outcome<u64>, AnalyticsError> {
        let mut excluded: u64 = 0;

        for (n, batch) in ids.chunks(self.config.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                debug!(batch = n, "Event scan cancelled");
                return Ok(Outcome::Cancelled);
            }
            let mut loaded: usize = 0;
            for id in batch {
                match self.load_event(id).await {
                    Ok(Some(event)) => {
                        loaded = loaded.saturating_add(1);
                        visit(&event);
                    }
                    Ok(None) => {}
                    Err(e) if e.class() == ErrorClass::TypeMismatch => {
                        warn!(
                            id = %EventId::from(id.as_str()),
                            error = %e,
                            "Excluding malformed event"
                        );
                        bump(&mut excluded);
                    }
                    Err(e) => return Err(e),
                }
            }
            debug!(batch = n, size = batch.len(), loaded, "Event batch processed");
        }
        Ok(Outcome::Complete(excluded))
    }

    pub(crate) async fn load_event(&self, id: &str) -> Result<Option<Event>, AnalyticsError> {
        Ok(self.store.get_json::<Event>(&keys::event(id)).await?)
    }

    pub(crate) const fn store(&self) -> &Store {
        &self.store
    }
}
