//! The external metrics API.
//!
//! One call looks up at most one batch of post ids and reports the quota
//! left afterwards. [`HttpMetricsApi`] talks to the social platform's
//! `GET /tweets` endpoint and reads quota from its `x-rate-limit-*`
//! headers.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kiln_types::RateLimitState;

use crate::error::SyncError;

/// Public counters of one post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetrics {
    /// Post id.
    pub id: String,
    /// Impressions.
    pub views: u64,
    /// Likes.
    pub likes: u64,
    /// Reposts.
    pub reposts: u64,
    /// Replies.
    pub replies: u64,
    /// Quote posts.
    pub quotes: u64,
}

impl ItemMetrics {
    /// `likes + reposts + replies`.
    pub const fn engagement(&self) -> u64 {
        self.likes.saturating_add(self.reposts).saturating_add(self.replies)
    }
}

/// Result of one batch lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLookup {
    /// Posts found. Ids not found are simply absent.
    pub items: Vec<ItemMetrics>,
    /// Quota after the call, when the remote reported it.
    pub quota: Option<RateLimitState>,
}

/// A quota-limited metrics source.
pub trait MetricsApi: Send + Sync {
    /// Look up one batch of ids.
    fn batch_lookup(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<BatchLookup, SyncError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Metrics API endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsApiConfig {
    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token; sync is disabled without one.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_base_url() -> String {
    "https://api.twitter.com/2".to_owned()
}

impl Default for MetricsApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bearer_token: None,
        }
    }
}

/// HTTP client for the social platform's post lookup endpoint.
#[derive(Debug, Clone)]
pub struct HttpMetricsApi {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    data: Vec<LookupPost>,
}

#[derive(Debug, Deserialize)]
struct LookupPost {
    id: String,
    #[serde(default)]
    public_metrics: PublicMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    impression_count: u64,
    #[serde(default)]
    like_count: u64,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    reply_count: u64,
    #[serde(default)]
    quote_count: u64,
}

impl HttpMetricsApi {
    /// Create a client with an explicit bearer token.
    pub fn new(config: &MetricsApiConfig, bearer_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            bearer_token: bearer_token.to_owned(),
        }
    }

    /// Client from config, or `None` without a bearer token.
    pub fn from_config(config: &MetricsApiConfig) -> Option<Self> {
        config
            .bearer_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|token| Self::new(config, token))
    }
}

/// Read `x-rate-limit-{remaining,limit,reset}`; `reset` is epoch seconds.
pub fn quota_from_headers(headers: &reqwest::header::HeaderMap) -> Option<RateLimitState> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    let remaining = u32::try_from(read("x-rate-limit-remaining")?.max(0)).ok()?;
    let limit = u32::try_from(read("x-rate-limit-limit")?.max(0)).ok()?;
    let reset_at: DateTime<Utc> = DateTime::from_timestamp(read("x-rate-limit-reset")?, 0)?;
    Some(RateLimitState {
        remaining: remaining.min(limit),
        limit,
        reset_at,
    })
}

impl MetricsApi for HttpMetricsApi {
    async fn batch_lookup(&self, ids: &[String]) -> Result<BatchLookup, SyncError> {
        let url = format!("{}/tweets", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .query(&[("ids", ids.join(",").as_str()), ("tweet.fields", "public_metrics")])
            .send()
            .await
            .map_err(|e| SyncError::Api(format!("request failed: {e}")))?;

        let quota = quota_from_headers(response.headers());
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::QuotaExhausted { quota });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Unauthorized(status.to_string()));
        }
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(SyncError::Api(format!("returned {status}: {error_body}")));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Api(format!("response parse failed: {e}")))?;

        let items: Vec<ItemMetrics> = body
            .data
            .into_iter()
            .map(|post| ItemMetrics {
                id: post.id,
                views: post.public_metrics.impression_count,
                likes: post.public_metrics.like_count,
                reposts: post.public_metrics.retweet_count,
                replies: post.public_metrics.reply_count,
                quotes: post.public_metrics.quote_count,
            })
            .collect();
        debug!(requested = ids.len(), found = items.len(), "Metrics batch fetched");
        Ok(BatchLookup { items, quota })
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    #[test]
    fn quota_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-remaining", HeaderValue::from_static("12"));
        headers.insert("x-rate-limit-limit", HeaderValue::from_static("300"));
        headers.insert("x-rate-limit-reset", HeaderValue::from_static("1735689600"));
        let quota = quota_from_headers(&headers);
        assert_eq!(quota.map(|q| (q.remaining, q.limit)), Some((12, 300)));
        assert_eq!(quota.map(|q| q.reset_at.timestamp()), Some(1_735_689_600));

        headers.remove("x-rate-limit-limit");
        assert_eq!(quota_from_headers(&headers), None);
    }

    #[test]
    fn engagement_excludes_views_and_quotes() {
        let item = ItemMetrics {
            id: "1".to_owned(),
            views: 1000,
            likes: 10,
            reposts: 5,
            replies: 3,
            quotes: 2,
        };
        assert_eq!(item.engagement(), 18);
    }

    #[test]
    fn missing_token_disables_client() {
        assert!(HttpMetricsApi::from_config(&MetricsApiConfig::default()).is_none());
    }
}
