//! Faceted search over one collection.
//!
//! Filters on indexed facets are resolved through index sets: OR within a
//! facet (set union), AND across facets (intersection). A filter value with
//! no entries empties the result without touching any further set.
//! Candidates are then fetched and re-checked against the document itself,
//! because index sets may lag behind the bodies.
//!
//! Filters on facets the collection has never indexed, and free-text terms,
//! are evaluated in process over the candidates (or over every document when
//! no indexed filter applies).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use kiln_store::keys;
use kiln_types::{Document, DocumentId};

use crate::collection::facets_of;
use crate::error::IndexError;
use crate::manager::{IndexManager, is_skippable};

/// Accepted values for one filtered facet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    /// Exactly this value.
    One(String),
    /// Any of these values.
    Any(Vec<String>),
}

impl FilterValue {
    fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Any(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

/// A search over one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    /// Facet filters, AND-ed together.
    pub filters: BTreeMap<String, FilterValue>,
    /// Case-insensitive substring matched against searchable body fields.
    pub free_text: Option<String>,
    /// Maximum documents returned.
    pub limit: Option<usize>,
}

impl SearchRequest {
    /// Empty request: every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: require `facet = value`.
    #[must_use]
    pub fn filter(mut self, facet: &str, value: &str) -> Self {
        self.filters.insert(facet.to_owned(), FilterValue::One(value.to_owned()));
        self
    }

    /// Builder: require `facet` to be any of `values`.
    #[must_use]
    pub fn any_of(mut self, facet: &str, values: &[&str]) -> Self {
        self.filters.insert(
            facet.to_owned(),
            FilterValue::Any(values.iter().map(|v| (*v).to_owned()).collect()),
        );
        self
    }

    /// Builder: free-text term.
    #[must_use]
    pub fn text(mut self, term: &str) -> Self {
        self.free_text = Some(term.to_owned());
        self
    }

    /// Builder: cap the result size.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Matching documents, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    /// Matching documents sorted by `created_at` desc, then id asc.
    pub documents: Vec<Document>,
    /// Candidate ids that could not be read.
    pub skipped: Vec<DocumentId>,
}

/// Query engine over one collection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    index: IndexManager,
}

impl QueryEngine {
    /// Create a query engine over the manager's collection.
    pub const fn new(index: IndexManager) -> Self {
        Self { index }
    }

    /// Run a search.
    ///
    /// # Errors
    ///
    /// Only unexpected store failures propagate; unreadable candidates are
    /// reported in [`SearchResult::skipped`].
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResult, IndexError> {
        let spec = self.index.spec();
        let ns = spec.namespace.as_str();
        let indexed_facets = self.index.indexed_facets().await?;

        let mut structural: Vec<(&str, BTreeSet<String>)> = Vec::new();
        let mut scanned: Vec<(&str, Vec<&str>)> = Vec::new();
        for (facet, filter) in &request.filters {
            if indexed_facets.contains(facet) {
                let values: BTreeSet<String> = filter
                    .values()
                    .into_iter()
                    .filter_map(|v| spec.normalize(facet, v))
                    .collect();
                structural.push((facet.as_str(), values));
            } else {
                scanned.push((facet.as_str(), filter.values()));
            }
        }

        let mut result = SearchResult::default();
        let candidates = if structural.is_empty() {
            let loaded = self.index.load_all().await?;
            result.skipped = loaded.skipped;
            loaded.documents
        } else {
            let Some(ids) = self.intersect(ns, &structural).await? else {
                return Ok(result);
            };
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                let id = DocumentId::from(id);
                match self.index.get(&id).await {
                    Ok(Some(doc)) => docs.push(doc),
                    Ok(None) => debug!(namespace = ns, %id, "Index entry without document"),
                    Err(e) if is_skippable(&e) => {
                        warn!(
                            namespace = ns,
                            %id,
                            error = %e,
                            "Skipping unreadable search candidate"
                        );
                        result.skipped.push(id);
                    }
                    Err(e) => return Err(e),
                }
            }
            docs
        };

        let needle = request
            .free_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        let mut documents: Vec<Document> = candidates
            .into_iter()
            .filter(|doc| {
                let facets = facets_of(spec, doc);
                structural.iter().all(|(facet, values)| {
                    facets
                        .get(*facet)
                        .is_some_and(|have| have.iter().any(|v| values.contains(v)))
                })
            })
            .filter(|doc| {
                scanned
                    .iter()
                    .all(|(field, values)| matches_unindexed(doc, field, values))
            })
            .filter(|doc| {
                needle
                    .as_deref()
                    .is_none_or(|n| matches_text(doc, &spec.searchable, n))
            })
            .collect();

        documents.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = request.limit {
            documents.truncate(limit);
        }

        debug!(
            namespace = ns,
            filters = request.filters.len(),
            matched = documents.len(),
            skipped = result.skipped.len(),
            "Search complete"
        );
        result.documents = documents;
        Ok(result)
    }

    /// Union within each facet, intersection across facets. `None` when
    /// the intersection is empty.
    async fn intersect(
        &self,
        ns: &str,
        structural: &[(&str, BTreeSet<String>)],
    ) -> Result<Option<BTreeSet<String>>, IndexError> {
        let store = self.index.store();
        let mut acc: Option<BTreeSet<String>> = None;
        for (facet, values) in structural {
            let mut union = BTreeSet::new();
            for value in values {
                union.extend(store.smembers(&keys::index_set(ns, facet, value)).await?);
            }
            let next = match acc {
                None => union,
                Some(prev) => prev.intersection(&union).cloned().collect(),
            };
            if next.is_empty() {
                return Ok(None);
            }
            acc = Some(next);
        }
        Ok(acc)
    }
}

/// An un-indexed filter matches a facet value or a body field of the same name.
fn matches_unindexed(doc: &Document, field: &str, values: &[&str]) -> bool {
    if doc.facet(field).iter().any(|v| values.contains(&v.as_str())) {
        return true;
    }
    match doc.body.get(field) {
        Some(Value::String(s)) => values.contains(&s.as_str()),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|s| values.contains(&s)),
        Some(Value::Number(n)) => values.contains(&n.to_string().as_str()),
        Some(Value::Bool(b)) => values.contains(&if *b { "true" } else { "false" }),
        _ => false,
    }
}

/// Case-insensitive substring over the searchable fields; every top-level
/// string field when none are declared.
fn matches_text(doc: &Document, searchable: &[String], needle: &str) -> bool {
    let Some(body) = doc.body.as_object() else {
        return false;
    };
    let contains = |value: &Value| match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|s| s.to_lowercase().contains(needle)),
        _ => false,
    };
    if searchable.is_empty() {
        body.values().any(contains)
    } else {
        searchable
            .iter()
            .filter_map(|field| body.get(field))
            .any(contains)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, Utc};
    use kiln_store::{MemoryStore, Store, keys};
    use kiln_types::Principal;
    use serde_json::json;

    use super::*;
    use crate::collection::CollectionSpec;

    async fn seeded() -> QueryEngine {
        seeded_on(Store::memory()).await
    }

    async fn seeded_on(store: Store) -> QueryEngine {
        let mgr = IndexManager::new(store, CollectionSpec::projects()).unwrap();
        let base = Utc::now();
        let docs = [
            Document::new("p1")
                .with_facet("stage", "active")
                .with_facet("priority", "high")
                .with_body(json!({"name": "Lunar Launch", "chain": "sol"}))
                .created(base - Duration::hours(3)),
            Document::new("p2")
                .with_facet("stage", "active")
                .with_facet("priority", "low")
                .with_body(json!({"name": "Orbit Drop", "chain": "eth"}))
                .created(base - Duration::hours(1)),
            Document::new("p3")
                .with_facet("stage", "done")
                .with_facet("priority", "high")
                .with_body(json!({"name": "Lunar Pass", "chain": "sol"}))
                .created(base - Duration::hours(2)),
        ];
        for doc in docs {
            mgr.put(&Principal::system(), doc).await.unwrap();
        }
        QueryEngine::new(mgr)
    }

    fn ids(result: &SearchResult) -> Vec<&str> {
        result.documents.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn empty_request_returns_all_newest_first() {
        let engine = seeded().await;
        let result = engine.search(&SearchRequest::new()).await.unwrap();
        assert_eq!(ids(&result), vec!["p2", "p3", "p1"]);
    }

    #[tokio::test]
    async fn failing_reads_are_skipped_with_and_without_filters() {
        let memory = MemoryStore::new();
        let engine = seeded_on(Store::from(memory.clone())).await;
        memory.inject_fault(&keys::document("project", "p2"));

        let all = engine.search(&SearchRequest::new()).await.unwrap();
        assert_eq!(ids(&all), vec!["p3", "p1"]);
        assert_eq!(all.skipped, vec![DocumentId::from("p2")]);

        let active = engine
            .search(&SearchRequest::new().filter("stage", "active"))
            .await
            .unwrap();
        assert_eq!(ids(&active), vec!["p1"]);
        assert_eq!(active.skipped, vec![DocumentId::from("p2")]);
    }

    #[tokio::test]
    async fn or_within_and_across() {
        let engine = seeded().await;
        let request = SearchRequest::new()
            .any_of("stage", &["active", "done"])
            .filter("priority", "HIGH");
        let result = engine.search(&request).await.unwrap();
        assert_eq!(ids(&result), vec!["p3", "p1"]);
    }

    #[tokio::test]
    async fn unknown_value_short_circuits() {
        let engine = seeded().await;
        let result = engine
            .search(&SearchRequest::new().filter("stage", "archived").filter("priority", "high"))
            .await
            .unwrap();
        assert!(result.documents.is_empty());
    }

    #[tokio::test]
    async fn unindexed_filter_scans_body() {
        let engine = seeded().await;
        let result = engine
            .search(&SearchRequest::new().filter("chain", "sol").limit(1))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec!["p3"]);
    }

    #[tokio::test]
    async fn free_text_is_case_insensitive() {
        let engine = seeded().await;
        let result = engine
            .search(&SearchRequest::new().filter("stage", "active").text("LUNAR"))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec!["p1"]);
    }
}
