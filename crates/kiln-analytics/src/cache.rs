//! Aggregate cache.
//!
//! Results are cached per `(subject, window signature)` with a TTL. Two
//! callers missing at once both recompute and both write; the values are
//! identical, so the race is harmless.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use kiln_store::{Store, keys};

use crate::error::AnalyticsError;

/// TTL cache over the store.
#[derive(Debug, Clone)]
pub struct AggregateCache {
    store: Store,
    ttl_secs: u64,
}

impl AggregateCache {
    /// Create a cache with the given TTL. A zero TTL disables caching.
    pub const fn new(store: Store, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Cached value, or `None` on miss. An undecodable entry counts as a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        subject: &str,
        signature: &str,
    ) -> Result<Option<T>, AnalyticsError> {
        if self.ttl_secs == 0 {
            return Ok(None);
        }
        let key = keys::analytics_cache(subject, signature);
        match self.store.get_json(&key).await {
            Ok(hit) => {
                debug!(%key, hit = hit.is_some(), "Aggregate cache lookup");
                Ok(hit)
            }
            Err(e) if e.class() == kiln_types::ErrorClass::TypeMismatch => {
                warn!(%key, error = %e, "Discarding unreadable cache entry");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store a value under the TTL.
    pub async fn put<T: Serialize + Sync>(
        &self,
        subject: &str,
        signature: &str,
        value: &T,
    ) -> Result<(), AnalyticsError> {
        if self.ttl_secs == 0 {
            return Ok(());
        }
        let key = keys::analytics_cache(subject, signature);
        self.store.set_json_ex(&key, value, self.ttl_secs).await?;
        Ok(())
    }
}
