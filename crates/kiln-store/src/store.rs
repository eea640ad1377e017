//! The [`Store`] handle every Kiln service is built on.
//!
//! Dispatches each primitive to either [`DragonflyStore`] or
//! [`MemoryStore`]. Both honour the same contract; services never know
//! which one they hold. Typed JSON helpers route every read through
//! [`codec::decode`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::dragonfly::DragonflyStore;
use crate::error::StoreError;
use crate::memory::MemoryStore;

/// Primitive key-value store handle. Cheap to clone.
#[derive(Debug, Clone)]
pub enum Store {
    /// Networked `Dragonfly`/Redis.
    Dragonfly(DragonflyStore),
    /// In-process keyspace.
    Memory(MemoryStore),
}

macro_rules! dispatch {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            Self::Dragonfly(store) => store.$method($($arg),*).await,
            Self::Memory(store) => store.$method($($arg),*),
        }
    };
}

impl Store {
    /// Connect to `Dragonfly` at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::Dragonfly(DragonflyStore::connect(url).await?))
    }

    /// A fresh, empty in-memory store.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// Human-readable backend name for logging.
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Dragonfly(_) => "dragonfly",
            Self::Memory(_) => "memory",
        }
    }

    // -------------------------------------------------------------------------
    // Primitives
    // -------------------------------------------------------------------------

    /// Read a string value.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        dispatch!(self.get(key))
    }

    /// Write a string value without expiry.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        dispatch!(self.set(key, value))
    }

    /// Write a string value that expires after `ttl` seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> Result<(), StoreError> {
        dispatch!(self.set_ex(key, value, ttl))
    }

    /// Delete a key; returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        dispatch!(self.delete(key))
    }

    /// Whether a key exists.
    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        dispatch!(self.exists(key))
    }

    /// Every key starting with `prefix`. Walks the whole keyspace.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        dispatch!(self.keys(prefix))
    }

    /// Increment an integer counter.
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        dispatch!(self.incr(key))
    }

    /// Set a TTL on an existing key.
    pub async fn expire(&self, key: &str, ttl: u64) -> Result<bool, StoreError> {
        dispatch!(self.expire(key, ttl))
    }

    /// Add a set member; returns whether it was new.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        dispatch!(self.sadd(key, member))
    }

    /// Remove a set member; returns whether it was present.
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        dispatch!(self.srem(key, member))
    }

    /// All set members, sorted.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        dispatch!(self.smembers(key))
    }

    /// Set membership test.
    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        dispatch!(self.sismember(key, member))
    }

    /// Add or re-score a sorted-set member.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, StoreError> {
        dispatch!(self.zadd(key, score, member))
    }

    /// Remove a sorted-set member.
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        dispatch!(self.zrem(key, member))
    }

    /// Members by rank with their scores, lowest score first.
    pub async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        dispatch!(self.zrange_with_scores(key, start, stop))
    }

    /// Push onto the head of a list; returns the new length.
    pub async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        dispatch!(self.lpush(key, value))
    }

    /// List slice, head first.
    pub async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        dispatch!(self.lrange(key, start, stop))
    }

    /// Remove list elements equal to `value`.
    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, StoreError> {
        dispatch!(self.lrem(key, count, value))
    }

    /// Trim a list to `start..=stop`.
    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        dispatch!(self.ltrim(key, start, stop))
    }

    /// List length.
    pub async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        dispatch!(self.llen(key))
    }

    /// Drop every key. Tests only.
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        dispatch!(self.flush_all())
    }

    // -------------------------------------------------------------------------
    // Typed JSON
    // -------------------------------------------------------------------------

    /// Read and decode the JSON value at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TypeMismatch`] if the value does not decode, and
    /// [`StoreError::WrongType`]/[`StoreError::Dragonfly`] if the key is not
    /// a string.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(codec::decode(key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Encode `value` as canonical JSON and store it at `key`.
    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = codec::encode(value)?;
        self.set(key, &raw).await
    }

    /// Encode `value` as canonical JSON and store it at `key` with a TTL.
    pub async fn set_json_ex<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: u64,
    ) -> Result<(), StoreError> {
        let raw = codec::encode(value)?;
        self.set_ex(key, &raw, ttl).await
    }
}

impl From<MemoryStore> for Store {
    fn from(store: MemoryStore) -> Self {
        Self::Memory(store)
    }
}

impl From<DragonflyStore> for Store {
    fn from(store: DragonflyStore) -> Self {
        Self::Dragonfly(store)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Quota {
        remaining: u32,
    }

    #[tokio::test]
    async fn json_helpers_use_codec() {
        let store = Store::memory();
        store.set_json("q", &Quota { remaining: 4 }).await.unwrap();
        assert_eq!(store.get_json::<Quota>("q").await.unwrap(), Some(Quota { remaining: 4 }));
        assert_eq!(store.get_json::<Quota>("missing").await.unwrap(), None);

        store.set("legacy", "\"{\\\"remaining\\\":9}\"").await.unwrap();
        assert_eq!(store.get_json::<Quota>("legacy").await.unwrap(), Some(Quota { remaining: 9 }));

        store.set("broken", "{").await.unwrap();
        assert!(matches!(
            store.get_json::<Quota>("broken").await,
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn clones_share_the_keyspace() {
        let store = Store::memory();
        let other = store.clone();
        store.sadd("s", "a").await.unwrap();
        assert!(other.sismember("s", "a").await.unwrap());
        assert_eq!(other.backend(), "memory");
    }
}
