//! Key layout.
//!
//! Every key Kiln reads or writes is built here.
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `doc:{ns}:{id}` | JSON | Document |
//! | `{ns}:all` | Set | All document ids of a collection |
//! | `idx:{ns}:{facet}:{value}` | Set | Index set |
//! | `idx:{ns}:_sets` | Set | Every index-set key ever written |
//! | `idx:{ns}:_facets` | Set | Every facet name ever indexed |
//! | `event:{id}` | JSON | Event |
//! | `events:subject:{id}` | Set | Event ids of a subject |
//! | `events:subject:{id}:timeline` | Sorted set | Event ids scored by epoch ms |
//! | `events:actor:{id}` | Set | Event ids of an actor |
//! | `events:channel:{id}` | Set | Event ids of a channel |
//! | `analytics:cache:{subject}:{sig}` | JSON, TTL | Cached aggregate |
//! | `sync:ratelimit:{class}` | JSON | Rate-limit state |
//! | `sync:deferred` | Sorted set | Deferred subjects by first deferral |
//! | `sync:deferred:job:{subject}` | JSON | Deferred sync job |
//! | `sync:last:{subject}` | String, TTL | Last successful sync |
//! | `metrics:subject:{subject}` | JSON | Subject metric totals |
//! | `metrics:item:{id}` | JSON | Per-item metrics |
//! | `notifications:queue` | List | Pending notifications |
//! | `notifications:sent` | List | Sent history |
//! | `notifications:failed` | List | Terminal failures |

// ---------------------------------------------------------------------------
// Documents and indexes
// ---------------------------------------------------------------------------

/// `doc:{ns}:{id}`
pub fn document(ns: &str, id: &str) -> String {
    format!("doc:{ns}:{id}")
}

/// `doc:{ns}:` -- prefix of every document key in a collection.
pub fn document_prefix(ns: &str) -> String {
    format!("doc:{ns}:")
}

/// `{ns}:all`
pub fn all_ids(ns: &str) -> String {
    format!("{ns}:all")
}

/// `idx:{ns}:{facet}:{value}`
pub fn index_set(ns: &str, facet: &str, value: &str) -> String {
    format!("idx:{ns}:{facet}:{value}")
}

/// `idx:{ns}:_sets`
pub fn index_registry(ns: &str) -> String {
    format!("idx:{ns}:_sets")
}

/// `idx:{ns}:_facets`
pub fn facet_registry(ns: &str) -> String {
    format!("idx:{ns}:_facets")
}

/// Split an index-set key back into `(facet, value)`.
///
/// Facet names never contain `:`; values may.
pub fn parse_index_set<'a>(ns: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix("idx:")?.strip_prefix(ns)?.strip_prefix(':')?;
    rest.split_once(':')
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// `event:{id}`
pub fn event(id: &str) -> String {
    format!("event:{id}")
}

/// `events:subject:{id}`
pub fn subject_events(subject: &str) -> String {
    format!("events:subject:{subject}")
}

/// `events:subject:{id}:timeline`
pub fn subject_timeline(subject: &str) -> String {
    format!("events:subject:{subject}:timeline")
}

/// `events:actor:{id}`
pub fn actor_events(actor: &str) -> String {
    format!("events:actor:{actor}")
}

/// `events:channel:{id}`
pub fn channel_events(channel: &str) -> String {
    format!("events:channel:{channel}")
}

/// `analytics:cache:{subject}:{signature}`
pub fn analytics_cache(subject: &str, signature: &str) -> String {
    format!("analytics:cache:{subject}:{signature}")
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Deferred subjects, scored by first deferral time.
pub const DEFERRED_SET: &str = "sync:deferred";

/// `sync:ratelimit:{class}`
pub fn rate_limit(class: &str) -> String {
    format!("sync:ratelimit:{class}")
}

/// `sync:deferred:job:{subject}`
pub fn deferred_job(subject: &str) -> String {
    format!("sync:deferred:job:{subject}")
}

/// `sync:last:{subject}`
pub fn last_sync(subject: &str) -> String {
    format!("sync:last:{subject}")
}

/// `metrics:subject:{subject}`
pub fn subject_metrics(subject: &str) -> String {
    format!("metrics:subject:{subject}")
}

/// `metrics:item:{id}`
pub fn item_metrics(id: &str) -> String {
    format!("metrics:item:{id}")
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Pending notifications; newest at the head.
pub const NOTIFICATION_QUEUE: &str = "notifications:queue";

/// Sent history; newest at the head.
pub const NOTIFICATION_SENT: &str = "notifications:sent";

/// Terminal failures; newest at the head.
pub const NOTIFICATION_FAILED: &str = "notifications:failed";
