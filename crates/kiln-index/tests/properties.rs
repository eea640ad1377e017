//! Consistency properties of the index manager and query engine, run
//! against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

use std::collections::BTreeSet;

use kiln_index::{
    CollectionSpec, IndexManager, Normalize, QueryEngine, ReconcileConfig, SearchRequest,
};
use kiln_store::{Store, keys};
use kiln_types::{CancelToken, Document, DocumentId, DocumentPatch, Principal};

const NS: &str = "project";

fn manager() -> IndexManager {
    IndexManager::new(Store::memory(), CollectionSpec::projects()).unwrap()
}

/// Snapshot of every index set: `(key, sorted members)`.
async fn index_snapshot(store: &Store) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    for key in store.keys(&format!("idx:{NS}:")).await.unwrap() {
        if keys::parse_index_set(NS, &key).is_some() {
            out.push((key.clone(), store.smembers(&key).await.unwrap()));
        }
    }
    out
}

/// id ∈ idx(F, v) ⟺ document(id).facets[F] contains v.
async fn assert_bidirectional(mgr: &IndexManager) {
    let store = mgr.store();
    let docs = mgr.get_all().await.unwrap();

    for doc in &docs {
        for (facet, values) in &doc.facets {
            for value in values {
                let key = keys::index_set(NS, facet, value);
                assert!(
                    store.sismember(&key, doc.id.as_str()).await.unwrap(),
                    "{} missing from {key}",
                    doc.id
                );
            }
        }
    }

    for (key, members) in index_snapshot(store).await {
        let (facet, value) = keys::parse_index_set(NS, &key).unwrap();
        for member in members {
            let doc = mgr
                .get(&DocumentId::from(member.as_str()))
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("{key} references missing document {member}"));
            assert!(
                doc.facet(facet).iter().any(|v| v == value),
                "{key} holds {member} but document has {:?}",
                doc.facet(facet)
            );
        }
    }
}

#[tokio::test]
async fn put_remove_put_equals_single_put() {
    let once = manager();
    let doc = Document::new("p1")
        .with_facet("stage", "active")
        .with_facet_values("assignee", &["@Ana", "@bo"]);
    once.put(&Principal::system(), doc.clone()).await.unwrap();

    let thrice = manager();
    thrice.put(&Principal::system(), doc.clone()).await.unwrap();
    thrice.remove(&Principal::system(), &doc.id).await.unwrap();
    thrice.put(&Principal::system(), doc).await.unwrap();

    assert_eq!(index_snapshot(once.store()).await, index_snapshot(thrice.store()).await);
}

#[tokio::test]
async fn bidirectional_after_mixed_mutations() {
    let mgr = manager();
    let system = Principal::system();

    for (i, stage) in ["draft", "active", "active", "done", "draft"].iter().enumerate() {
        let doc = Document::new(format!("p{i}"))
            .with_facet("stage", stage)
            .with_facet("priority", if i % 2 == 0 { "high" } else { "low" });
        mgr.put(&system, doc).await.unwrap();
    }
    mgr.update(&system, &DocumentId::from("p0"), DocumentPatch::new().set_facet("stage", "active"))
        .await
        .unwrap();
    mgr.update(
        &system,
        &DocumentId::from("p1"),
        DocumentPatch::new().set_facet_values("assignee", &["@x", "@y"]).clear_facet("priority"),
    )
    .await
    .unwrap();
    mgr.remove(&system, &DocumentId::from("p3")).await.unwrap();
    mgr.put(&system, Document::new("p2").with_facet("stage", "paused")).await.unwrap();

    assert_bidirectional(&mgr).await;
    assert!(!mgr.exists_with("stage", "done").await.unwrap());
}

#[tokio::test]
async fn search_equals_index_intersection() {
    let mgr = manager();
    let system = Principal::system();
    let stages = ["a", "b", "a", "b", "a", "a"];
    let priorities = ["x", "x", "y", "y", "x", "y"];
    for i in 0..stages.len() {
        mgr.put(
            &system,
            Document::new(format!("d{i}"))
                .with_facet("stage", stages[i])
                .with_facet("priority", priorities[i]),
        )
        .await
        .unwrap();
    }

    let store = mgr.store().clone();
    let left: BTreeSet<String> = store
        .smembers(&keys::index_set(NS, "stage", "a"))
        .await
        .unwrap()
        .into_iter()
        .collect();
    let right: BTreeSet<String> = store
        .smembers(&keys::index_set(NS, "priority", "x"))
        .await
        .unwrap()
        .into_iter()
        .collect();
    let expected: BTreeSet<String> = left.intersection(&right).cloned().collect();

    let engine = QueryEngine::new(mgr);
    let result = engine
        .search(&SearchRequest::new().filter("stage", "a").filter("priority", "x"))
        .await
        .unwrap();
    let got: BTreeSet<String> = result.documents.iter().map(|d| d.id.to_string()).collect();
    assert_eq!(got, expected);
    assert_eq!(got.len(), 2);
}

/// A document moves from `draft` to `active`.
#[tokio::test]
async fn facet_update_moves_document_between_sets() {
    let mgr = manager();
    let system = Principal::system();
    mgr.put(&system, Document::new("p1").with_facet("stage", "draft")).await.unwrap();

    mgr.update(&system, &DocumentId::from("p1"), DocumentPatch::new().set_facet("stage", "active"))
        .await
        .unwrap();

    let store = mgr.store().clone();
    assert!(!store.sismember(&keys::index_set(NS, "stage", "draft"), "p1").await.unwrap());
    assert!(store.sismember(&keys::index_set(NS, "stage", "active"), "p1").await.unwrap());

    let engine = QueryEngine::new(mgr);
    let active = engine.search(&SearchRequest::new().filter("stage", "active")).await.unwrap();
    let draft = engine.search(&SearchRequest::new().filter("stage", "draft")).await.unwrap();
    assert_eq!(active.documents.len(), 1);
    assert!(draft.documents.is_empty());
}

#[tokio::test]
async fn reconcile_repairs_interrupted_writes() {
    let mgr = manager();
    let system = Principal::system();
    let store = mgr.store().clone();
    mgr.put(&system, Document::new("p1").with_facet("stage", "draft")).await.unwrap();
    mgr.put(&system, Document::new("p2").with_facet("stage", "draft")).await.unwrap();

    // Update of p1 interrupted after the body write: index still says draft.
    let mut moved = mgr.get(&DocumentId::from("p1")).await.unwrap().unwrap();
    moved.facets.insert("stage".to_owned(), vec!["active".to_owned()]);
    store.set_json(&keys::document(NS, "p1"), &moved).await.unwrap();

    // Removal of p2 interrupted after the body delete.
    store.delete(&keys::document(NS, "p2")).await.unwrap();

    // A put of p3 interrupted before any index write.
    store
        .set_json(&keys::document(NS, "p3"), &Document::new("p3").with_facet("stage", "done"))
        .await
        .unwrap();

    let report = mgr
        .rebuild_indexes(ReconcileConfig { chunk_size: 1 }, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.entries_removed, 2);
    assert_eq!(report.entries_added, 2);
    assert_eq!(report.all_set_repaired, 2);
    assert!(!report.cancelled);
    assert_bidirectional(&mgr).await;

    let again = mgr
        .rebuild_indexes(ReconcileConfig::default(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!((again.entries_added, again.entries_removed, again.all_set_repaired), (0, 0, 0));
}

/// Collections whose names share a string prefix keep separate documents and
/// index sets. A name that would nest under another collection is refused.
#[tokio::test]
async fn prefix_sharing_collections_stay_isolated() {
    let store = Store::memory();
    let system = Principal::system();
    let user = CollectionSpec::new("user").facet("role", Normalize::Exact);
    let users = CollectionSpec::new("users").facet("tier", Normalize::Exact);
    let user = IndexManager::new(store.clone(), user).unwrap();
    let users = IndexManager::new(store.clone(), users).unwrap();
    user.put(&system, Document::new("u1").with_facet("role", "admin")).await.unwrap();
    users.put(&system, Document::new("p1").with_facet("tier", "gold")).await.unwrap();

    let report = user
        .rebuild_indexes(ReconcileConfig::default(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!((report.entries_added, report.entries_removed), (0, 0));
    assert_eq!(
        store.smembers(&keys::index_set("users", "tier", "gold")).await.unwrap(),
        vec!["p1"]
    );
    let ids: Vec<DocumentId> = user.get_all().await.unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![DocumentId::from("u1")]);

    assert!(IndexManager::new(store, CollectionSpec::new("user:profile")).is_err());
}
