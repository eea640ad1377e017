//! Index reconciliation.
//!
//! A sweep recomputes every index set of a collection from the documents
//! and repairs the difference. It runs alongside live traffic:
//!
//! 1. Scan the document namespace and load every document, chunk by chunk.
//! 2. Repair the all-ids set (add live ids, drop ids with no document).
//! 3. Remove index entries that no document backs. Each removal re-reads
//!    the document first and is skipped if a concurrent write made the
//!    entry valid again.
//! 4. Add missing index entries.
//!
//! Additions run last so an entry wrongly removed by a race in step 3 is
//! restored within the same sweep. A write landing after its document was
//! loaded in step 1 can still leave one stale entry until the next sweep.
//! Entries of documents that fail to decode are left untouched.
//!
//! Cancellation is checked between chunks; a cancelled sweep leaves only
//! confirmed removals and valid additions behind.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kiln_store::keys;
use kiln_types::{CancelToken, DocumentId, ErrorClass};

use crate::collection::{FacetValues, facets_of};
use crate::error::IndexError;
use crate::manager::IndexManager;

/// Tuning for reconciliation sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Documents (or index sets) handled between cancellation checks.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

const fn default_chunk_size() -> usize {
    100
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// What a sweep found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Documents loaded.
    pub scanned: u64,
    /// Index entries added.
    pub entries_added: u64,
    /// Stale index entries removed.
    pub entries_removed: u64,
    /// All-ids set members added or removed.
    pub all_set_repaired: u64,
    /// Documents skipped because they did not decode.
    pub skipped: u64,
    /// Whether the sweep stopped early.
    pub cancelled: bool,
}

/// Expected index state computed from one pass over the documents.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    /// Index-set key to the ids the loaded documents put in it.
    expected: BTreeMap<String, BTreeSet<String>>,
    /// Normalized facets of every loaded document.
    facets_by_doc: Vec<(DocumentId, FacetValues)>,
    /// Ids whose document did not decode.
    undecodable: BTreeSet<String>,
    /// Ids whose document loaded.
    live: BTreeSet<String>,
}

impl IndexManager {
    /// Rebuild every index set of the collection from its documents.
    ///
    /// Idempotent, and safe to run while other tasks mutate the collection.
    pub async fn rebuild_indexes(
        &self,
        config: ReconcileConfig,
        cancel: &CancelToken,
    ) -> Result<ReconcileReport, IndexError> {
        let chunk = config.chunk_size.max(1);
        let mut report = ReconcileReport::default();

        let Some(snapshot) = self.load_snapshot(chunk, cancel, &mut report).await? else {
            return Ok(report);
        };
        self.repair_all_set(&snapshot, &mut report).await?;
        if !self.remove_stale(&snapshot, chunk, cancel, &mut report).await? {
            return Ok(report);
        }
        if !self.add_missing(&snapshot, chunk, cancel, &mut report).await? {
            return Ok(report);
        }

        info!(
            namespace = self.ns(),
            scanned = report.scanned,
            added = report.entries_added,
            removed = report.entries_removed,
            all_set_repaired = report.all_set_repaired,
            skipped = report.skipped,
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Step 1: load every document. `None` if cancelled.
    pub(crate) async fn load_snapshot(
        &self,
        chunk: usize,
        cancel: &CancelToken,
        report: &mut ReconcileReport,
    ) -> Result<Option<Snapshot>, IndexError> {
        let ns = self.ns();
        let ids = self.scan_ids().await?;
        let mut snapshot = Snapshot::default();

        for batch in ids.chunks(chunk) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(namespace = ns, "Reconciliation cancelled while loading");
                return Ok(None);
            }
            for id in batch {
                let doc_id = DocumentId::from(id.as_str());
                match self.get(&doc_id).await {
                    Ok(Some(doc)) => {
                        report.scanned = report.scanned.saturating_add(1);
                        let facets = facets_of(&self.spec, &doc);
                        for (facet, values) in &facets {
                            for value in values {
                                snapshot
                                    .expected
                                    .entry(keys::index_set(ns, facet, value))
                                    .or_default()
                                    .insert(id.clone());
                            }
                        }
                        snapshot.live.insert(id.clone());
                        snapshot.facets_by_doc.push((doc_id, facets));
                    }
                    Ok(None) => {}
                    Err(e) if e.class() == ErrorClass::TypeMismatch => {
                        warn!(
                            namespace = ns,
                            %id,
                            error = %e,
                            "Reconciliation skipping undecodable document"
                        );
                        report.skipped = report.skipped.saturating_add(1);
                        snapshot.undecodable.insert(id.clone());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(Some(snapshot))
    }

    /// Step 2: add live ids to the all-ids set and drop ids with no document.
    async fn repair_all_set(
        &self,
        snapshot: &Snapshot,
        report: &mut ReconcileReport,
    ) -> Result<(), IndexError> {
        let ns = self.ns();
        let all_key = keys::all_ids(ns);
        let listed: BTreeSet<String> = self.store.smembers(&all_key).await?.into_iter().collect();
        for id in snapshot.live.iter().chain(snapshot.undecodable.iter()) {
            if !listed.contains(id) && self.store.sadd(&all_key, id).await? {
                report.all_set_repaired = report.all_set_repaired.saturating_add(1);
            }
        }
        for id in listed.difference(&snapshot.live) {
            if snapshot.undecodable.contains(id) {
                continue;
            }
            if !self.store.exists(&keys::document(ns, id)).await?
                && self.store.srem(&all_key, id).await?
            {
                report.all_set_repaired = report.all_set_repaired.saturating_add(1);
            }
        }
        Ok(())
    }

    /// Step 3: remove entries the snapshot does not back, unless a re-read
    /// shows a concurrent write made them valid. `false` if cancelled.
    pub(crate) async fn remove_stale(
        &self,
        snapshot: &Snapshot,
        chunk: usize,
        cancel: &CancelToken,
        report: &mut ReconcileReport,
    ) -> Result<bool, IndexError> {
        let ns = self.ns();
        let mut index_sets: BTreeSet<String> = self
            .store
            .smembers(&keys::index_registry(ns))
            .await?
            .into_iter()
            .collect();
        index_sets.extend(
            self.store
                .keys(&format!("idx:{ns}:"))
                .await?
                .into_iter()
                .filter(|k| keys::parse_index_set(ns, k).is_some()),
        );
        let index_sets: Vec<String> = index_sets.into_iter().collect();

        for batch in index_sets.chunks(chunk) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(
                    namespace = ns,
                    removed = report.entries_removed,
                    "Reconciliation cancelled while removing"
                );
                return Ok(false);
            }
            for set_key in batch {
                let Some((facet, value)) = keys::parse_index_set(ns, set_key) else {
                    continue;
                };
                let wanted = snapshot.expected.get(set_key);
                for member in self.store.smembers(set_key).await? {
                    if wanted.is_some_and(|w| w.contains(&member))
                        || snapshot.undecodable.contains(&member)
                    {
                        continue;
                    }
                    if self.still_backed(&member, facet, value).await? {
                        debug!(
                            namespace = ns,
                            %member,
                            key = %set_key,
                            "Entry became valid during sweep"
                        );
                        continue;
                    }
                    if self.store.srem(set_key, &member).await? {
                        report.entries_removed = report.entries_removed.saturating_add(1);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Step 4: add every entry the snapshot expects. `false` if cancelled.
    pub(crate) async fn add_missing(
        &self,
        snapshot: &Snapshot,
        chunk: usize,
        cancel: &CancelToken,
        report: &mut ReconcileReport,
    ) -> Result<bool, IndexError> {
        for batch in snapshot.facets_by_doc.chunks(chunk) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(
                    namespace = self.ns(),
                    added = report.entries_added,
                    "Reconciliation cancelled while adding"
                );
                return Ok(false);
            }
            for (id, facets) in batch {
                let added = self.add_entries(id, facets).await?;
                report.entries_added = report.entries_added.saturating_add(added);
            }
        }
        Ok(true)
    }

    /// Re-read `id` and report whether it now carries `facet = value`.
    async fn still_backed(&self, id: &str, facet: &str, value: &str) -> Result<bool, IndexError> {
        match self.get(&DocumentId::from(id)).await {
            Ok(Some(doc)) => Ok(facets_of(&self.spec, &doc)
                .get(facet)
                .is_some_and(|values| values.contains(value))),
            Ok(None) => Ok(false),
            Err(e) if e.class() == ErrorClass::TypeMismatch => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kiln_store::Store;
    use kiln_types::{Document, DocumentPatch, Principal};

    use super::*;
    use crate::collection::CollectionSpec;

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let mgr = IndexManager::new(Store::memory(), CollectionSpec::projects()).unwrap();
        mgr.put(&Principal::system(), Document::new("a").with_facet("stage", "live"))
            .await
            .unwrap();

        let cancel = CancelToken::new();
        let first = mgr.rebuild_indexes(ReconcileConfig::default(), &cancel).await.unwrap();
        let second = mgr.rebuild_indexes(ReconcileConfig::default(), &cancel).await.unwrap();
        assert_eq!(first.entries_added, 0);
        assert_eq!(first.entries_removed, 0);
        assert_eq!(second, first);
        assert_eq!(second.scanned, 1);
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_before_work() {
        let mgr = IndexManager::new(Store::memory(), CollectionSpec::projects()).unwrap();
        mgr.put(&Principal::system(), Document::new("a")).await.unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = mgr.rebuild_indexes(ReconcileConfig::default(), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn write_between_load_and_removal_keeps_its_entry() {
        let mgr = IndexManager::new(Store::memory(), CollectionSpec::projects()).unwrap();
        let store = mgr.store().clone();
        let id = DocumentId::from("p1");
        mgr.put(&Principal::system(), Document::new("p1").with_facet("stage", "draft"))
            .await
            .unwrap();

        let cancel = CancelToken::new();
        let mut report = ReconcileReport::default();
        let snapshot = mgr.load_snapshot(1, &cancel, &mut report).await.unwrap().unwrap();

        let patch = DocumentPatch::new().set_facet("stage", "live");
        mgr.update(&Principal::system(), &id, patch).await.unwrap();

        assert!(mgr.remove_stale(&snapshot, 1, &cancel, &mut report).await.unwrap());
        assert!(mgr.add_missing(&snapshot, 1, &cancel, &mut report).await.unwrap());
        let live = keys::index_set("project", "stage", "live");
        assert!(store.sismember(&live, "p1").await.unwrap());
        assert_eq!(report.entries_removed, 0);

        // The snapshot still said "draft"; the next sweep clears it.
        let draft = keys::index_set("project", "stage", "draft");
        assert!(store.sismember(&draft, "p1").await.unwrap());
        let next = mgr.rebuild_indexes(ReconcileConfig::default(), &cancel).await.unwrap();
        assert_eq!(next.entries_removed, 1);
        assert!(!store.sismember(&draft, "p1").await.unwrap());
        assert!(store.sismember(&live, "p1").await.unwrap());
    }

    #[tokio::test]
    async fn undecodable_documents_keep_their_entries() {
        let mgr = IndexManager::new(Store::memory(), CollectionSpec::projects()).unwrap();
        let store = mgr.store().clone();
        store.set(&keys::document("project", "legacy"), "{oops").await.unwrap();
        store.sadd(&keys::index_set("project", "stage", "live"), "legacy").await.unwrap();

        let report = mgr
            .rebuild_indexes(ReconcileConfig::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert!(
            store
                .sismember(&keys::index_set("project", "stage", "live"), "legacy")
                .await
                .unwrap()
        );
    }
}
