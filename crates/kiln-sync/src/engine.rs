//! The sync engine.
//!
//! A sync job refreshes one subject's metrics from the external API. The
//! whole job is checked against the quota before any call is made: either
//! every id is fetched or the job is parked in the deferred set and nothing
//! is written.
//!
//! # Store layout
//!
//! | Key | Contents |
//! |-----|----------|
//! | `sync:deferred` | sorted set of subjects, scored by first deferral (ms) |
//! | `sync:deferred:job:{subject}` | the deferred [`SyncJob`] |
//! | `sync:last:{subject}` | last successful sync time, expires |
//! | `metrics:subject:{subject}` | [`SubjectMetrics`] |
//! | `metrics:item:{id}` | [`ItemMetrics`] |

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kiln_store::{Store, keys};
use kiln_types::{CancelToken, RateLimitState, SubjectId, SyncJob};

use crate::error::SyncError;
use crate::metrics_api::{HttpMetricsApi, ItemMetrics, MetricsApi, MetricsApiConfig};
use crate::rate_limit::{RateLimitConfig, RateLimiter, Reservation};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sync engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Ids per API call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between consecutive calls of one job, in milliseconds.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Lifetime of the `sync:last` marker, in seconds.
    #[serde(default = "default_last_sync_ttl_secs")]
    pub last_sync_ttl_secs: u64,
    /// Resource class the quota is tracked under.
    #[serde(default = "default_class")]
    pub class: String,
    /// Quota defaults for a class with no persisted state.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Remote endpoint.
    #[serde(default)]
    pub api: MetricsApiConfig,
}

const fn default_batch_size() -> usize {
    100
}

const fn default_batch_delay_ms() -> u64 {
    1000
}

const fn default_last_sync_ttl_secs() -> u64 {
    3600
}

fn default_class() -> String {
    "social-metrics".to_owned()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            last_sync_ttl_secs: default_last_sync_ttl_secs(),
            class: default_class(),
            rate_limit: RateLimitConfig::default(),
            api: MetricsApiConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Aggregated metrics of one subject after a completed sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMetrics {
    /// Subject.
    pub subject_id: SubjectId,
    /// Total impressions.
    pub views: u64,
    /// Total likes.
    pub likes: u64,
    /// Total reposts.
    pub reposts: u64,
    /// Total replies.
    pub replies: u64,
    /// Total quote posts.
    pub quotes: u64,
    /// `likes + reposts + replies`.
    pub engagement: u64,
    /// `engagement / views * 100`, 0 when there are no views.
    pub engagement_rate: f64,
    /// Ids the API returned.
    pub items_found: usize,
    /// Ids the API was asked for but did not return.
    pub items_missing: usize,
    /// Ids in chunks whose call failed.
    #[serde(default)]
    pub failed_ids: Vec<String>,
    /// When the sync completed.
    pub synced_at: DateTime<Utc>,
}

impl SubjectMetrics {
    /// Totals over `items`.
    pub fn from_items(
        subject_id: SubjectId,
        items: &[ItemMetrics],
        items_missing: usize,
        failed_ids: Vec<String>,
        synced_at: DateTime<Utc>,
    ) -> Self {
        let sum = |f: fn(&ItemMetrics) -> u64| items.iter().map(f).fold(0_u64, u64::saturating_add);
        let views = sum(|i| i.views);
        let engagement = sum(ItemMetrics::engagement);
        Self {
            subject_id,
            views,
            likes: sum(|i| i.likes),
            reposts: sum(|i| i.reposts),
            replies: sum(|i| i.replies),
            quotes: sum(|i| i.quotes),
            engagement,
            engagement_rate: engagement_rate(engagement, views),
            items_found: items.len(),
            items_missing,
            failed_ids,
            synced_at,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn engagement_rate(engagement: u64, views: u64) -> f64 {
    if views == 0 {
        return 0.0;
    }
    // Counters stay far below 2^53.
    engagement as f64 / views as f64 * 100.0
}

/// What [`SyncEngine::sync_subject`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Metrics were fetched and written.
    Synced(SubjectMetrics),
    /// Not enough quota; the job is in the deferred set.
    Deferred {
        /// Quota available when the job was checked.
        remaining: u32,
        /// When the quota window resets.
        reset_at: DateTime<Utc>,
    },
    /// The job had no ids.
    Empty,
    /// Cancelled between chunks; nothing was written.
    Cancelled,
}

/// Summary of one [`SyncEngine::process_deferred`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredReport {
    /// Subjects taken from the deferred set.
    pub attempted: usize,
    /// Subjects synced and removed.
    pub synced: usize,
    /// Subjects removed because their job was missing or empty.
    pub dropped: usize,
    /// Subjects whose sync returned an error; they stay deferred.
    pub failed: usize,
    /// The sweep stopped at a subject that is still rate-limited.
    pub stopped_on_limit: bool,
}

/// Sync state of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Last successful sync, if within the marker's lifetime.
    pub last_sync: Option<DateTime<Utc>>,
    /// Whether a job for the subject is waiting for quota.
    pub deferred: bool,
    /// Current quota of the engine's class.
    pub rate_limit: RateLimitState,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Rate-limited metrics sync. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncEngine<A = HttpMetricsApi> {
    store: Store,
    api: A,
    limiter: RateLimiter,
    config: SyncConfig,
}

enum Fetched {
    Complete {
        items: Vec<ItemMetrics>,
        failed_ids: Vec<String>,
    },
    QuotaExhausted,
    Cancelled,
}

/// Keep the first occurrence of each id.
fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

#[allow(clippy::cast_precision_loss)]
fn deferral_score(at: DateTime<Utc>) -> f64 {
    // Millisecond timestamps stay well inside f64's exact integer range.
    at.timestamp_millis() as f64
}

impl<A: MetricsApi> SyncEngine<A> {
    /// Create an engine, loading the class's persisted quota.
    pub async fn new(store: Store, api: A, config: SyncConfig) -> Result<Self, SyncError> {
        let limiter = RateLimiter::load(store.clone(), &config.class, config.rate_limit).await?;
        Ok(Self {
            store,
            api,
            limiter,
            config,
        })
    }

    /// The engine's quota.
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Refresh one subject's metrics, or defer the job.
    ///
    /// Requested ids are de-duplicated first. The quota check covers the
    /// whole job; a denied job is deferred and nothing is fetched. A chunk
    /// whose call fails is recorded in `failed_ids`. A quota rejection
    /// from the remote mid-job defers the job like a local denial.
    pub async fn sync_subject(
        &self,
        job: &SyncJob,
        cancel: &CancelToken,
    ) -> Result<SyncOutcome, SyncError> {
        let subject = &job.subject_id;
        let ids = dedupe(&job.requested_ids);
        if ids.is_empty() {
            debug!(subject = %subject, "Sync job has no ids");
            return Ok(SyncOutcome::Empty);
        }

        let needed = u32::try_from(ids.len()).unwrap_or(u32::MAX);
        if let Reservation::Denied { remaining, reset_at } = self.limiter.try_reserve(needed) {
            self.defer(job).await?;
            info!(
                subject = %subject,
                needed,
                remaining,
                reset_at = %reset_at,
                "Sync deferred, quota insufficient"
            );
            return Ok(SyncOutcome::Deferred { remaining, reset_at });
        }

        let (items, failed_ids) = match self.fetch_all(subject, &ids, needed, cancel).await? {
            Fetched::Complete { items, failed_ids } => (items, failed_ids),
            Fetched::Cancelled => {
                info!(subject = %subject, "Sync cancelled, nothing written");
                return Ok(SyncOutcome::Cancelled);
            }
            Fetched::QuotaExhausted => {
                self.defer(job).await?;
                let state = self.limiter.snapshot();
                warn!(
                    subject = %subject,
                    remaining = state.remaining,
                    "Remote rejected quota, sync deferred"
                );
                return Ok(SyncOutcome::Deferred {
                    remaining: state.remaining,
                    reset_at: state.reset_at,
                });
            }
        };

        let found: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
        let failed: HashSet<&str> = failed_ids.iter().map(String::as_str).collect();
        let items_missing = ids
            .iter()
            .filter(|id| !found.contains(id.as_str()) && !failed.contains(id.as_str()))
            .count();

        let synced_at = Utc::now();
        let metrics = SubjectMetrics::from_items(
            subject.clone(),
            &items,
            items_missing,
            failed_ids,
            synced_at,
        );
        self.write(&metrics, &items).await?;

        info!(
            subject = %subject,
            found = metrics.items_found,
            missing = metrics.items_missing,
            failed = metrics.failed_ids.len(),
            engagement = metrics.engagement,
            "Subject synced"
        );
        Ok(SyncOutcome::Synced(metrics))
    }

    /// Fetch every chunk of `ids`, against a reservation of `reserved`
    /// units. Each chunk's units are settled once its call returns; units
    /// of chunks never sent are released.
    async fn fetch_all(
        &self,
        subject: &SubjectId,
        ids: &[String],
        reserved: u32,
        cancel: &CancelToken,
    ) -> Result<Fetched, SyncError> {
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        let mut items = Vec::with_capacity(ids.len());
        let mut failed_ids = Vec::new();
        let mut unspent = reserved;

        for (index, chunk) in ids.chunks(self.config.batch_size.max(1)).enumerate() {
            if cancel.is_cancelled() {
                self.limiter.release(unspent, None);
                return Ok(Fetched::Cancelled);
            }
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        self.limiter.release(unspent, None);
                        return Ok(Fetched::Cancelled);
                    }
                }
            }

            let units = u32::try_from(chunk.len()).unwrap_or(u32::MAX).min(unspent);
            match self.api.batch_lookup(chunk).await {
                Ok(batch) => {
                    self.limiter.settle(units, batch.quota);
                    unspent = unspent.saturating_sub(units);
                    debug!(
                        subject = %subject,
                        chunk = index,
                        found = batch.items.len(),
                        "Chunk fetched"
                    );
                    items.extend(batch.items);
                }
                Err(SyncError::QuotaExhausted { quota }) => {
                    self.limiter.release(unspent, quota);
                    return Ok(Fetched::QuotaExhausted);
                }
                Err(e @ SyncError::Unauthorized(_)) => {
                    self.limiter.release(unspent, None);
                    return Err(e);
                }
                Err(e) => {
                    self.limiter.settle(units, None);
                    unspent = unspent.saturating_sub(units);
                    warn!(
                        subject = %subject,
                        chunk = index,
                        ids = chunk.len(),
                        error = %e,
                        "Chunk failed"
                    );
                    failed_ids.extend(chunk.iter().cloned());
                }
            }
        }
        self.limiter.release(unspent, None);
        Ok(Fetched::Complete { items, failed_ids })
    }

    async fn write(
        &self,
        metrics: &SubjectMetrics,
        items: &[ItemMetrics],
    ) -> Result<(), SyncError> {
        for item in items {
            self.store.set_json(&keys::item_metrics(&item.id), item).await?;
        }
        let subject = metrics.subject_id.as_str();
        self.store.set_json(&keys::subject_metrics(subject), metrics).await?;
        self.store
            .set_json_ex(
                &keys::last_sync(subject),
                &metrics.synced_at,
                self.config.last_sync_ttl_secs,
            )
            .await?;
        self.store.zrem(keys::DEFERRED_SET, subject).await?;
        self.store.delete(&keys::deferred_job(subject)).await?;
        self.limiter.persist().await
    }

    /// Park a job in the deferred set.
    ///
    /// A subject already deferred keeps its original position; its stored
    /// job is replaced.
    pub async fn defer(&self, job: &SyncJob) -> Result<(), SyncError> {
        let subject = job.subject_id.as_str();
        self.store.set_json(&keys::deferred_job(subject), job).await?;
        if !self.is_deferred(subject).await? {
            self.store
                .zadd(keys::DEFERRED_SET, deferral_score(Utc::now()), subject)
                .await?;
        }
        Ok(())
    }

    async fn is_deferred(&self, subject: &str) -> Result<bool, SyncError> {
        let members = self.store.zrange_with_scores(keys::DEFERRED_SET, 0, -1).await?;
        Ok(members.iter().any(|(member, _)| member == subject))
    }

    /// Deferred subjects, oldest first.
    pub async fn deferred(&self) -> Result<Vec<SubjectId>, SyncError> {
        let members = self.store.zrange_with_scores(keys::DEFERRED_SET, 0, -1).await?;
        Ok(members.into_iter().map(|(member, _)| SubjectId::new(member)).collect())
    }

    /// Retry up to `limit` deferred subjects, oldest first.
    ///
    /// Stops at the first subject that is still rate-limited; it and every
    /// later subject keep their position.
    pub async fn process_deferred(
        &self,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<DeferredReport, SyncError> {
        let mut report = DeferredReport::default();
        let Some(stop) = limit.checked_sub(1).and_then(|n| i64::try_from(n).ok()) else {
            return Ok(report);
        };
        let entries = self.store.zrange_with_scores(keys::DEFERRED_SET, 0, stop).await?;

        for (subject, _) in entries {
            if cancel.is_cancelled() {
                break;
            }
            report.attempted = report.attempted.saturating_add(1);

            let Some(job) = self
                .store
                .get_json::<SyncJob>(&keys::deferred_job(&subject))
                .await?
            else {
                warn!(subject = %subject, "Deferred subject has no stored job, dropping");
                self.store.zrem(keys::DEFERRED_SET, &subject).await?;
                report.dropped = report.dropped.saturating_add(1);
                continue;
            };

            match self.sync_subject(&job, cancel).await {
                Ok(SyncOutcome::Synced(_)) => report.synced = report.synced.saturating_add(1),
                Ok(SyncOutcome::Empty) => {
                    self.store.zrem(keys::DEFERRED_SET, &subject).await?;
                    self.store.delete(&keys::deferred_job(&subject)).await?;
                    report.dropped = report.dropped.saturating_add(1);
                }
                Ok(SyncOutcome::Deferred { .. }) => {
                    report.stopped_on_limit = true;
                    break;
                }
                Ok(SyncOutcome::Cancelled) => break,
                Err(e) => {
                    warn!(
                        subject = %subject,
                        error = %e,
                        class = %e.class(),
                        "Deferred sync failed"
                    );
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                dropped = report.dropped,
                failed = report.failed,
                stopped_on_limit = report.stopped_on_limit,
                "Deferred sweep complete"
            );
        }
        Ok(report)
    }

    /// Sync state of a subject.
    pub async fn status(&self, subject: &SubjectId) -> Result<SyncStatus, SyncError> {
        let last_sync = self
            .store
            .get_json::<DateTime<Utc>>(&keys::last_sync(subject.as_str()))
            .await?;
        Ok(SyncStatus {
            last_sync,
            deferred: self.is_deferred(subject.as_str()).await?,
            rate_limit: self.limiter.snapshot(),
        })
    }

    /// Stored metrics of a subject.
    pub async fn subject_metrics(
        &self,
        subject: &SubjectId,
    ) -> Result<Option<SubjectMetrics>, SyncError> {
        Ok(self.store.get_json(&keys::subject_metrics(subject.as_str())).await?)
    }

    /// Stored metrics of one item.
    pub async fn item_metrics(&self, id: &str) -> Result<Option<ItemMetrics>, SyncError> {
        Ok(self.store.get_json(&keys::item_metrics(id)).await?)
    }

    /// Write the quota state back to the store.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.limiter.persist().await
    }
}

impl SyncEngine<HttpMetricsApi> {
    /// Engine backed by the HTTP API, or `None` without a bearer token.
    pub async fn from_config(store: Store, config: SyncConfig) -> Result<Option<Self>, SyncError> {
        match HttpMetricsApi::from_config(&config.api) {
            Some(api) => Ok(Some(Self::new(store, api, config).await?)),
            None => Ok(None),
        }
    }
}
