//! Event analytics for Kiln.
//!
//! Chat messages arrive through the [`EventLog`], are labelled by a
//! sentiment [`Classifier`], and are stored as immutable events grouped by
//! subject, actor and channel. The [`Aggregator`] turns a subject's events
//! into windowed metrics bucketed in a fixed reporting zone.
//!
//! # Modules
//!
//! - [`event_log`] -- Append-only producer, listing and retention cleanup
//! - [`classifier`] -- Sentiment classification (HTTP model or neutral)
//! - [`window`] -- Named and custom time windows
//! - [`zone`] -- Fixed-offset reporting zone
//! - [`aggregator`] -- Windowed aggregate computation
//! - [`cache`] -- TTL cache for aggregates
//! - [`engagement`] -- Reply threads and per-actor activity
//! - [`terms`] -- Trending terms
//! - [`error`] -- [`AnalyticsError`]

pub mod aggregator;
pub mod cache;
pub mod classifier;
pub mod engagement;
pub mod error;
pub mod event_log;
pub mod terms;
pub mod window;
pub mod zone;

pub use aggregator::{
    ActorActivity, Aggregate, Aggregator, AggregatorConfig, ChannelActivity, DailyPoint, Outcome,
    SentimentBreakdown, SentimentRatios,
};
pub use cache::AggregateCache;
pub use classifier::{
    Classification, Classifier, ClassifierConfig, HttpClassifier, NeutralClassifier,
    SentimentClassifier,
};
pub use engagement::{EngagementMetrics, ReplyThread, SubjectActivity, UserActivity};
pub use error::AnalyticsError;
pub use event_log::{EventLog, IncomingMessage, RecordOutcome};
pub use terms::{TermCount, tokenize};
pub use window::{Resolved, Window};
pub use zone::ReportingZone;
