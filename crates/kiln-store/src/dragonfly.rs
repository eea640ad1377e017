//! `Dragonfly` (Redis-compatible) implementation of the primitive contract.
//!
//! A thin typed layer over [`fred`]: every method is one round trip, and
//! nothing here knows about documents, events or notifications. Key patterns
//! live in [`crate::keys`].

use fred::prelude::*;
use fred::types::{ClusterHash, CustomCommand, Expiration};

use crate::error::StoreError;

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct DragonflyStore {
    client: Client,
}

impl core::fmt::Debug for DragonflyStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DragonflyStore").finish_non_exhaustive()
    }
}

fn seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl DragonflyStore {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL follows the Redis URL scheme: `redis://host:port` or
    /// `redis://host:port/db`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if the URL cannot be parsed.
    /// Returns [`StoreError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = Config::from_url(url)
            .map_err(|e| StoreError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    /// Close the connection.
    pub async fn quit(&self) -> Result<(), StoreError> {
        self.client.quit().await?;
        Ok(())
    }

    // =========================================================================
    // Strings
    // =========================================================================

    /// `GET`
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.client.get(key).await?)
    }

    /// `SET`
    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: () = self.client.set(key, value, None, None, false).await?;
        Ok(())
    }

    /// `SET ... EX seconds`
    pub async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> Result<(), StoreError> {
        let _: () = self
            .client
            .set(key, value, Some(Expiration::EX(seconds(ttl))), None, false)
            .await?;
        Ok(())
    }

    /// `DEL`
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: u32 = self.client.del(key).await?;
        Ok(removed > 0)
    }

    /// `EXISTS`
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let count: u32 = self.client.exists(key).await?;
        Ok(count > 0)
    }

    /// `KEYS {prefix}*`. Blocks the server while it walks the keyspace;
    /// only used by rebuild and reconciliation paths.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let cmd = CustomCommand::new_static("KEYS", ClusterHash::FirstKey, false);
        let mut keys: Vec<String> = self.client.custom(cmd, vec![format!("{prefix}*")]).await?;
        keys.sort();
        Ok(keys)
    }

    /// `INCR`
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.client.incr(key).await?)
    }

    /// `EXPIRE`
    pub async fn expire(&self, key: &str, ttl: u64) -> Result<bool, StoreError> {
        let applied: u32 = self.client.expire(key, seconds(ttl), None).await?;
        Ok(applied > 0)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// `SADD`
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let added: u32 = self.client.sadd(key, member).await?;
        Ok(added > 0)
    }

    /// `SREM`
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: u32 = self.client.srem(key, member).await?;
        Ok(removed > 0)
    }

    /// `SMEMBERS`, sorted for deterministic iteration.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut members: Vec<String> = self.client.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    /// `SISMEMBER`
    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.client.sismember(key, member).await?)
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    /// `ZADD`
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, StoreError> {
        let added: u32 = self
            .client
            .zadd(key, None, None, false, false, (score, member))
            .await?;
        Ok(added > 0)
    }

    /// `ZREM`
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: u32 = self.client.zrem(key, member).await?;
        Ok(removed > 0)
    }

    /// `ZRANGE key start stop WITHSCORES`
    pub async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        Ok(self
            .client
            .zrange(key, start, stop, None, false, None, true)
            .await?)
    }

    // =========================================================================
    // Lists
    // =========================================================================

    /// `LPUSH`
    pub async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        Ok(self.client.lpush(key, value).await?)
    }

    /// `LRANGE`
    pub async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.client.lrange(key, start, stop).await?)
    }

    /// `LREM`
    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, StoreError> {
        Ok(self.client.lrem(key, count, value).await?)
    }

    /// `LTRIM`
    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let _: () = self.client.ltrim(key, start, stop).await?;
        Ok(())
    }

    /// `LLEN`
    pub async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.client.llen(key).await?)
    }

    /// `FLUSHALL`
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        let _: () = self.client.flushall(false).await?;
        Ok(())
    }
}
