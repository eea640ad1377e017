//! The index manager.
//!
//! Keeps `idx:{ns}:{facet}:{value}` sets consistent with the documents of
//! one collection. The store has no transactions, so every mutation is a
//! fixed sequence of single-key writes:
//!
//! | Operation | Order |
//! |-----------|-------|
//! | `put` | stale removals (if replacing), body write, index additions |
//! | `update` | facet diff, removals, additions, body overwrite |
//! | `remove` | index removals, body delete, all-set removal |
//!
//! An interruption part-way leaves index sets that disagree with the body.
//! Index sets are never authoritative: the query engine re-checks fetched
//! documents, and [`IndexManager::rebuild_indexes`] repairs the sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use kiln_store::{Store, StoreError, keys};
use kiln_types::{Document, DocumentId, DocumentPatch, ErrorClass, Principal};

use crate::collection::{CollectionSpec, FacetValues, facets_of, into_raw};
use crate::error::IndexError;

/// Documents loaded by a full scan, plus how many could not be decoded.
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    /// Decoded documents, in id order.
    pub documents: Vec<Document>,
    /// Ids whose value did not decode.
    pub skipped: Vec<DocumentId>,
}

/// Index manager for one collection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IndexManager {
    pub(crate) store: Store,
    pub(crate) spec: Arc<CollectionSpec>,
}

impl IndexManager {
    /// Create a manager for `spec` on `store`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidSchema`] if the namespace or a facet
    /// name is not a single key segment.
    pub fn new(store: Store, spec: CollectionSpec) -> Result<Self, IndexError> {
        spec.validate()?;
        Ok(Self {
            store,
            spec: Arc::new(spec),
        })
    }

    /// The collection schema.
    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    /// The underlying store handle.
    pub const fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn ns(&self) -> &str {
        &self.spec.namespace
    }

    fn doc_key(&self, id: &str) -> String {
        keys::document(self.ns(), id)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch a document.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Store`] with a `TypeMismatch` class if the value
    /// does not decode.
    pub async fn get(&self, id: &DocumentId) -> Result<Option<Document>, IndexError> {
        Ok(self.store.get_json(&self.doc_key(id.as_str())).await?)
    }

    /// Whether any document is indexed under `facet = value`.
    pub async fn exists_with(&self, facet: &str, value: &str) -> Result<bool, IndexError> {
        let Some(value) = self.spec.normalize(facet, value) else {
            return Ok(false);
        };
        Ok(self.store.exists(&keys::index_set(self.ns(), facet, &value)).await?)
    }

    /// Ids indexed under `facet = value`.
    pub async fn ids_for(&self, facet: &str, value: &str) -> Result<Vec<DocumentId>, IndexError> {
        let Some(value) = self.spec.normalize(facet, value) else {
            return Ok(Vec::new());
        };
        let members = self
            .store
            .smembers(&keys::index_set(self.ns(), facet, &value))
            .await?;
        Ok(members.into_iter().map(DocumentId::from).collect())
    }

    /// Facet names that have ever been indexed in this collection.
    pub async fn indexed_facets(&self) -> Result<BTreeSet<String>, IndexError> {
        let mut facets: BTreeSet<String> = self
            .store
            .smembers(&keys::facet_registry(self.ns()))
            .await?
            .into_iter()
            .collect();
        facets.extend(self.spec.facets.iter().map(|f| f.name.clone()));
        Ok(facets)
    }

    /// Every document in the collection.
    ///
    /// Reads the all-ids set; if it is empty, falls back to a scan of the
    /// document namespace and repairs the all-ids set from what it finds.
    /// Documents that do not decode, or whose read fails transiently, are
    /// logged and skipped.
    pub async fn get_all(&self) -> Result<Vec<Document>, IndexError> {
        Ok(self.load_all().await?.documents)
    }

    /// [`Self::get_all`], also reporting which ids were skipped.
    pub async fn load_all(&self) -> Result<Loaded, IndexError> {
        let all_key = keys::all_ids(self.ns());
        let mut ids = self.store.smembers(&all_key).await?;

        if ids.is_empty() {
            ids = self.scan_ids().await?;
            if !ids.is_empty() {
                warn!(
                    namespace = self.ns(),
                    count = ids.len(),
                    "All-ids set empty, rebuilt from namespace scan"
                );
                for id in &ids {
                    self.store.sadd(&all_key, id).await?;
                }
            }
        }

        let mut loaded = Loaded::default();
        for id in ids {
            let id = DocumentId::from(id);
            match self.get(&id).await {
                Ok(Some(doc)) => loaded.documents.push(doc),
                Ok(None) => debug!(namespace = self.ns(), %id, "All-ids entry without document"),
                Err(IndexError::Store(StoreError::TypeMismatch { key, reason })) => {
                    warn!(namespace = self.ns(), %key, %reason, "Skipping undecodable document");
                    loaded.skipped.push(id);
                }
                Err(e) if is_skippable(&e) => {
                    warn!(
                        namespace = self.ns(),
                        %id,
                        error = %e,
                        class = %e.class(),
                        "Skipping unreadable document"
                    );
                    loaded.skipped.push(id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }

    /// Ids of every document key in the namespace. Walks the keyspace.
    pub(crate) async fn scan_ids(&self) -> Result<Vec<String>, IndexError> {
        let prefix = keys::document_prefix(self.ns());
        let found = self.store.keys(&prefix).await?;
        Ok(found
            .iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()))
            .map(str::to_owned)
            .collect())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a document and index its facets.
    ///
    /// Facet values are normalized per the schema before being stored. If a
    /// document with the same id exists, index entries for values it no
    /// longer carries are removed first.
    pub async fn put(
        &self,
        principal: &Principal,
        mut doc: Document,
    ) -> Result<Document, IndexError> {
        self.spec.authorize(principal)?;

        let facets = facets_of(&self.spec, &doc);
        doc.facets = into_raw(&facets);
        doc.updated_at = Utc::now();
        doc.updated_by = Some(principal.id.clone());

        let previous = match self.get(&doc.id).await {
            Ok(prev) => prev.map(|p| facets_of(&self.spec, &p)),
            Err(e) if e.class() == ErrorClass::TypeMismatch => {
                warn!(namespace = self.ns(), id = %doc.id, "Replacing undecodable document");
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(previous) = &previous {
            self.remove_entries(&doc.id, previous, &facets).await?;
        }

        self.store.set_json(&self.doc_key(doc.id.as_str()), &doc).await?;
        self.add_entries(&doc.id, &facets).await?;
        self.store.sadd(&keys::all_ids(self.ns()), doc.id.as_str()).await?;

        debug!(namespace = self.ns(), id = %doc.id, facets = facets.len(), "Document stored");
        Ok(doc)
    }

    /// Apply a patch to an existing document.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotFound`] if the document does not exist.
    pub async fn update(
        &self,
        principal: &Principal,
        id: &DocumentId,
        patch: DocumentPatch,
    ) -> Result<Document, IndexError> {
        self.spec.authorize(principal)?;

        let mut doc = self.get(id).await?.ok_or_else(|| IndexError::NotFound {
            namespace: self.ns().to_owned(),
            id: id.to_string(),
        })?;

        let old = facets_of(&self.spec, &doc);
        let mut raw = into_raw(&old);
        for (facet, values) in patch.facets {
            if values.is_empty() {
                raw.remove(&facet);
            } else {
                raw.insert(facet, values);
            }
        }
        let new = self.spec.normalize_facets(&raw);

        self.remove_entries(id, &old, &new).await?;
        self.add_entries(id, &new).await?;

        doc.facets = into_raw(&new);
        if let Some(body) = patch.body {
            merge_body(&mut doc.body, body);
        }
        doc.updated_at = Utc::now();
        doc.updated_by = Some(principal.id.clone());
        self.store.set_json(&self.doc_key(id.as_str()), &doc).await?;

        debug!(namespace = self.ns(), %id, "Document updated");
        Ok(doc)
    }

    /// Delete a document and its index entries. Returns whether it existed.
    pub async fn remove(&self, principal: &Principal, id: &DocumentId) -> Result<bool, IndexError> {
        self.spec.authorize(principal)?;

        let all_key = keys::all_ids(self.ns());
        let Some(doc) = self.get(id).await? else {
            self.store.srem(&all_key, id.as_str()).await?;
            return Ok(false);
        };

        let facets = facets_of(&self.spec, &doc);
        self.remove_entries(id, &facets, &FacetValues::new()).await?;
        self.store.delete(&self.doc_key(id.as_str())).await?;
        self.store.srem(&all_key, id.as_str()).await?;

        debug!(namespace = self.ns(), %id, "Document removed");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Index entries
    // -------------------------------------------------------------------------

    /// Remove `id` from every set in `old` whose value is absent from `new`.
    async fn remove_entries(
        &self,
        id: &DocumentId,
        old: &FacetValues,
        new: &FacetValues,
    ) -> Result<(), IndexError> {
        for (facet, values) in old {
            let keep = new.get(facet);
            for value in values {
                if keep.is_some_and(|k| k.contains(value)) {
                    continue;
                }
                let key = keys::index_set(self.ns(), facet, value);
                self.store.srem(&key, id.as_str()).await?;
            }
        }
        Ok(())
    }

    /// Add `id` to the set of every value in `facets`, registering the
    /// set and the facet name.
    pub(crate) async fn add_entries(
        &self,
        id: &DocumentId,
        facets: &FacetValues,
    ) -> Result<u64, IndexError> {
        let mut added: u64 = 0;
        for (facet, values) in facets {
            self.store.sadd(&keys::facet_registry(self.ns()), facet).await?;
            for value in values {
                let key = keys::index_set(self.ns(), facet, value);
                self.store.sadd(&keys::index_registry(self.ns()), &key).await?;
                if self.store.sadd(&key, id.as_str()).await? {
                    added = added.saturating_add(1);
                }
            }
        }
        Ok(added)
    }
}

/// Whether a per-document read failure during a bulk read is skipped
/// rather than failing the whole read.
pub(crate) fn is_skippable(error: &IndexError) -> bool {
    let class = error.class();
    class == ErrorClass::TypeMismatch || class.is_retryable()
}

/// Merge `patch` into `body`: object keys are merged one level deep, any
/// other shape replaces the body.
fn merge_body(body: &mut serde_json::Value, patch: serde_json::Value) {
    match (body, patch) {
        (serde_json::Value::Object(existing), serde_json::Value::Object(incoming)) => {
            existing.extend(incoming);
        }
        (body, patch) => *body = patch,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kiln_store::MemoryStore;
    use kiln_types::Role;
    use serde_json::json;

    use super::*;

    fn manager() -> IndexManager {
        IndexManager::new(Store::memory(), CollectionSpec::projects()).unwrap()
    }

    #[tokio::test]
    async fn put_normalizes_and_indexes() {
        let mgr = manager();
        let doc = Document::new("p1")
            .with_facet("stage", "Active")
            .with_facet("twitter", "@Kiln");
        let stored = mgr.put(&Principal::system(), doc).await.unwrap();
        assert_eq!(stored.facet("stage").to_vec(), vec!["active".to_owned()]);
        assert!(mgr.exists_with("twitter", "@KILN").await.unwrap());
        assert_eq!(mgr.ids_for("stage", "ACTIVE").await.unwrap(), vec![DocumentId::from("p1")]);
        assert_eq!(stored.updated_by.as_deref(), Some("system"));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let mgr = manager();
        let err = mgr
            .update(&Principal::system(), &DocumentId::from("nope"), DocumentPatch::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn update_clears_facets_and_merges_body() {
        let mgr = manager();
        let doc = Document::new("p2")
            .with_facet("priority", "high")
            .with_body(json!({"name": "Alpha", "budget": 10}));
        mgr.put(&Principal::system(), doc).await.unwrap();

        let patch = DocumentPatch::new()
            .clear_facet("priority")
            .merge_body(json!({"budget": 20}));
        let updated = mgr
            .update(&Principal::system(), &DocumentId::from("p2"), patch)
            .await
            .unwrap();

        assert!(updated.facet("priority").is_empty());
        assert!(!mgr.exists_with("priority", "high").await.unwrap());
        assert_eq!(updated.body, json!({"name": "Alpha", "budget": 20}));
    }

    #[tokio::test]
    async fn remove_absent_is_noop() {
        let mgr = manager();
        assert!(!mgr.remove(&Principal::system(), &DocumentId::from("ghost")).await.unwrap());
    }

    #[tokio::test]
    async fn viewer_cannot_write() {
        let mgr = manager();
        let err = mgr
            .put(&Principal::new("v", Role::Viewer), Document::new("p3"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Unauthorized);
        assert!(mgr.get(&DocumentId::from("p3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_all_rebuilds_empty_all_set() {
        let mgr = manager();
        mgr.put(&Principal::system(), Document::new("a")).await.unwrap();
        mgr.put(&Principal::system(), Document::new("b")).await.unwrap();
        mgr.store().delete(&keys::all_ids("project")).await.unwrap();

        let all = mgr.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(mgr.store().sismember(&keys::all_ids("project"), "a").await.unwrap());
    }

    #[tokio::test]
    async fn get_all_skips_documents_whose_read_fails() {
        let memory = MemoryStore::new();
        let store = Store::from(memory.clone());
        let mgr = IndexManager::new(store, CollectionSpec::projects()).unwrap();
        mgr.put(&Principal::system(), Document::new("ok")).await.unwrap();
        mgr.put(&Principal::system(), Document::new("flaky")).await.unwrap();
        memory.inject_fault(&keys::document("project", "flaky"));

        let loaded = mgr.load_all().await.unwrap();
        assert_eq!(loaded.documents.len(), 1);
        assert_eq!(loaded.skipped, vec![DocumentId::from("flaky")]);

        memory.clear_fault(&keys::document("project", "flaky"));
        assert_eq!(mgr.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn overlapping_namespace_is_rejected() {
        let spec = CollectionSpec::new("project:archive");
        let err = IndexManager::new(Store::memory(), spec).unwrap_err();
        assert_eq!(err.class(), ErrorClass::PermanentFailure);
    }

    #[tokio::test]
    async fn get_all_skips_undecodable_documents() {
        let mgr = manager();
        mgr.put(&Principal::system(), Document::new("good")).await.unwrap();
        mgr.store().set(&keys::document("project", "bad"), "<html>").await.unwrap();
        mgr.store().sadd(&keys::all_ids("project"), "bad").await.unwrap();

        let loaded = mgr.load_all().await.unwrap();
        assert_eq!(loaded.documents.len(), 1);
        assert_eq!(loaded.skipped, vec![DocumentId::from("bad")]);
    }
}
