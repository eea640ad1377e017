//! In-process substitute for `Dragonfly`.
//!
//! Implements the same primitive contract with the same semantics that Kiln
//! relies on: head-first lists, score-ordered sorted sets with member
//! tie-break, lazy TTL expiry, and `WRONGTYPE` errors when a key is used as
//! the wrong primitive type. Used by every unit and scenario test, and by
//! the binary when no store URL is configured.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Keyspace = HashMap<String, Entry>;

/// Shared in-memory keyspace. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Keyspace>>,
    faults: Arc<Mutex<BTreeSet<String>>>,
}

/// Resolve Redis-style inclusive `start..=stop` (negative = from the end)
/// against a collection of `len` items.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let first = if start < 0 {
        len.saturating_add(start).max(0)
    } else {
        start
    };
    let last = if stop < 0 {
        len.saturating_add(stop)
    } else {
        stop.min(len.saturating_sub(1))
    };
    if first > last || first >= len || last < 0 {
        return None;
    }
    Some((usize::try_from(first).ok()?, usize::try_from(last).ok()?))
}

fn deadline(seconds: u64) -> Option<Instant> {
    Instant::now().checked_add(Duration::from_secs(seconds))
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the live keyspace, with expired keys already evicted.
    fn with<R>(
        &self,
        f: impl FnOnce(&mut Keyspace) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let Ok(mut keyspace) = self.inner.lock() else {
            return Err(StoreError::Poisoned);
        };
        let now = Instant::now();
        keyspace.retain(|_, entry| !entry.is_expired(now));
        f(&mut keyspace)
    }

    /// Make every `GET` of `key` fail with a connection error until
    /// [`Self::clear_fault`] is called.
    pub fn inject_fault(&self, key: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(key.to_owned());
        }
    }

    /// Undo [`Self::inject_fault`].
    pub fn clear_fault(&self, key: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.remove(key);
        }
    }

    fn check_fault(&self, key: &str) -> Result<(), StoreError> {
        let Ok(faults) = self.faults.lock() else {
            return Err(StoreError::Poisoned);
        };
        if faults.contains(key) {
            return Err(StoreError::Dragonfly(fred::error::Error::new(
                fred::error::ErrorKind::IO,
                "connection reset by peer",
            )));
        }
        Ok(())
    }

    // -- strings ------------------------------------------------------------

    /// `GET`
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_fault(key)?;
        self.with(|ks| match ks.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    /// `SET`, clearing any TTL.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with(|ks| {
            ks.insert(key.to_owned(), Entry::new(Value::Str(value.to_owned())));
            Ok(())
        })
    }

    /// `SET ... EX seconds`
    pub fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), StoreError> {
        self.with(|ks| {
            let mut entry = Entry::new(Value::Str(value.to_owned()));
            entry.expires_at = deadline(seconds);
            ks.insert(key.to_owned(), entry);
            Ok(())
        })
    }

    /// `DEL`; returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with(|ks| Ok(ks.remove(key).is_some()))
    }

    /// `EXISTS`
    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with(|ks| Ok(ks.contains_key(key)))
    }

    /// Every live key starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.with(|ks| {
            let mut keys: Vec<String> =
                ks.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }

    /// `INCR`
    pub fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.with(|ks| {
            let current = match ks.get(key).map(|e| &e.value) {
                None => 0,
                Some(Value::Str(s)) => s
                    .parse::<i64>()
                    .map_err(|_| StoreError::NotAnInteger(key.to_owned()))?,
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            let next = current
                .checked_add(1)
                .ok_or_else(|| StoreError::NotAnInteger(key.to_owned()))?;
            let expires_at = ks.get(key).and_then(|e| e.expires_at);
            ks.insert(
                key.to_owned(),
                Entry {
                    value: Value::Str(next.to_string()),
                    expires_at,
                },
            );
            Ok(next)
        })
    }

    /// `EXPIRE`; returns whether the key exists.
    pub fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        self.with(|ks| {
            Ok(ks.get_mut(key).is_some_and(|entry| {
                entry.expires_at = deadline(seconds);
                true
            }))
        })
    }

    // -- sets ---------------------------------------------------------------

    fn set_mut<'a>(
        ks: &'a mut Keyspace,
        key: &str,
    ) -> Result<&'a mut BTreeSet<String>, StoreError> {
        let entry = ks
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    /// `SADD`; returns whether the member was newly added.
    pub fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with(|ks| Ok(Self::set_mut(ks, key)?.insert(member.to_owned())))
    }

    /// `SREM`; returns whether the member was present. Empty sets are deleted.
    pub fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with(|ks| {
            let removed = match ks.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(false),
                Some(Value::Set(set)) => (set.remove(member), set.is_empty()),
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            if removed.1 {
                ks.remove(key);
            }
            Ok(removed.0)
        })
    }

    /// `SMEMBERS`, sorted.
    pub fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with(|ks| match ks.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    /// `SISMEMBER`
    pub fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with(|ks| match ks.get(key).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    // -- sorted sets --------------------------------------------------------

    /// `ZADD`; replaces the score of an existing member.
    pub fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, StoreError> {
        self.with(|ks| {
            let entry = ks
                .entry(key.to_owned())
                .or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
            match &mut entry.value {
                Value::ZSet(zset) => Ok(zset.insert(member.to_owned(), score).is_none()),
                _ => Err(StoreError::WrongType(key.to_owned())),
            }
        })
    }

    /// `ZREM`
    pub fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with(|ks| {
            let (removed, empty) = match ks.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(false),
                Some(Value::ZSet(zset)) => (zset.remove(member).is_some(), zset.is_empty()),
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            if empty {
                ks.remove(key);
            }
            Ok(removed)
        })
    }

    /// `ZRANGE key start stop WITHSCORES`, ascending by score then member.
    pub fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.with(|ks| {
            let mut members: Vec<(String, f64)> = match ks.get(key).map(|e| &e.value) {
                None => return Ok(Vec::new()),
                Some(Value::ZSet(zset)) => zset.iter().map(|(m, s)| (m.clone(), *s)).collect(),
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let Some((first, last)) = resolve_range(members.len(), start, stop) else {
                return Ok(Vec::new());
            };
            Ok(members
                .into_iter()
                .skip(first)
                .take(last.saturating_sub(first).saturating_add(1))
                .collect())
        })
    }

    // -- lists --------------------------------------------------------------

    /// `LPUSH`; returns the new length.
    pub fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.with(|ks| {
            let entry = ks
                .entry(key.to_owned())
                .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
            match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value.to_owned());
                    Ok(u64::try_from(list.len()).unwrap_or(u64::MAX))
                }
                _ => Err(StoreError::WrongType(key.to_owned())),
            }
        })
    }

    /// `LRANGE key start stop`, head first.
    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.with(|ks| match ks.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => {
                let Some((first, last)) = resolve_range(list.len(), start, stop) else {
                    return Ok(Vec::new());
                };
                Ok(list
                    .iter()
                    .skip(first)
                    .take(last.saturating_sub(first).saturating_add(1))
                    .cloned()
                    .collect())
            }
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    /// `LREM key count value`: `0` removes all matches, positive counts
    /// remove from the head, negative counts from the tail.
    pub fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, StoreError> {
        self.with(|ks| {
            let (removed, empty) = match ks.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(0),
                Some(Value::List(list)) => {
                    let limit = if count == 0 {
                        usize::MAX
                    } else {
                        usize::try_from(count.unsigned_abs()).unwrap_or(usize::MAX)
                    };
                    let mut removed: usize = 0;
                    let mut kept: VecDeque<String> = VecDeque::with_capacity(list.len());
                    if count >= 0 {
                        for item in list.drain(..) {
                            if removed < limit && item == value {
                                removed = removed.saturating_add(1);
                            } else {
                                kept.push_back(item);
                            }
                        }
                    } else {
                        for item in list.drain(..).rev() {
                            if removed < limit && item == value {
                                removed = removed.saturating_add(1);
                            } else {
                                kept.push_front(item);
                            }
                        }
                    }
                    *list = kept;
                    (removed, list.is_empty())
                }
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            if empty {
                ks.remove(key);
            }
            Ok(u64::try_from(removed).unwrap_or(u64::MAX))
        })
    }

    /// `LTRIM key start stop`
    pub fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.with(|ks| {
            let empty = match ks.get_mut(key).map(|e| &mut e.value) {
                None => return Ok(()),
                Some(Value::List(list)) => {
                    match resolve_range(list.len(), start, stop) {
                        Some((first, last)) => {
                            list.truncate(last.saturating_add(1));
                            list.drain(..first);
                        }
                        None => list.clear(),
                    }
                    list.is_empty()
                }
                Some(_) => return Err(StoreError::WrongType(key.to_owned())),
            };
            if empty {
                ks.remove(key);
            }
            Ok(())
        })
    }

    /// `LLEN`
    pub fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.with(|ks| match ks.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(u64::try_from(list.len()).unwrap_or(u64::MAX)),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
        })
    }

    /// `FLUSHALL`
    pub fn flush_all(&self) -> Result<(), StoreError> {
        self.with(|ks| {
            ks.clear();
            Ok(())
        })
    }
}
