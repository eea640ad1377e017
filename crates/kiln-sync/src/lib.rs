//! Rate-limited external metrics sync for Kiln.
//!
//! A [`SyncJob`](kiln_types::SyncJob) names a subject and the post ids whose
//! public counters should be refreshed. The [`SyncEngine`] checks the whole
//! job against the [`RateLimiter`] before any call, fetches in fixed-size
//! chunks, and writes per-item and per-subject metrics. Jobs that do not fit
//! the quota wait in the deferred set until [`SyncEngine::process_deferred`]
//! picks them up.
//!
//! # Modules
//!
//! - [`rate_limit`] -- Quota state object
//! - [`metrics_api`] -- External API trait and HTTP client
//! - [`engine`] -- Sync, deferral and status
//! - [`links`] -- Post-link parsing
//! - [`error`] -- [`SyncError`]

pub mod engine;
pub mod error;
pub mod links;
pub mod metrics_api;
pub mod rate_limit;

pub use engine::{DeferredReport, SubjectMetrics, SyncConfig, SyncEngine, SyncOutcome, SyncStatus};
pub use error::SyncError;
pub use links::{job_from_links, post_id_from_link};
pub use metrics_api::{BatchLookup, HttpMetricsApi, ItemMetrics, MetricsApi, MetricsApiConfig};
pub use rate_limit::{RateLimitConfig, RateLimiter, Reservation};
