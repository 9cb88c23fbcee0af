//! Bulk write integration tests

use revstore_core::schema::BY_SEQ_STORE;
use revstore_core::{
    ChangesOptions, DocStore, Error, ErrorKind, Executor, GetOptions, RevId, SqliteBackend,
    StoreConfig, WriteOutcome,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn open_store() -> (DocStore, Arc<SqliteBackend>) {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let store = DocStore::open(backend.clone(), StoreConfig::new("bulk"));
    (store, backend)
}

async fn stored_revisions(backend: &SqliteBackend, id: &str) -> usize {
    backend
        .query(
            &format!("SELECT seq FROM {} WHERE doc_id = ?", BY_SEQ_STORE),
            &revstore_core::sql_params![id],
        )
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_single_insert_scenario() {
    let (store, _) = open_store();
    let results = store.bulk_docs(vec![json!({"_id": "a", "foo": 1})], true).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(results[0].id(), "a");

    let rev: RevId = results[0].rev().unwrap().parse().unwrap();
    assert_eq!(rev.generation, 1);
    assert_eq!(rev.hash.len(), 32);

    let doc = store.get("a", GetOptions::default()).await.unwrap();
    assert_eq!(doc, json!({"_id": "a", "_rev": rev.to_string(), "foo": 1}));
}

#[tokio::test]
async fn test_round_trip_preserves_body() {
    let (store, _) = open_store();
    let body = json!({
        "title": "nested",
        "tags": ["x", "y"],
        "meta": {"count": 3, "ratio": 0.5, "none": null},
        "flag": true
    });
    let mut input = body.clone();
    input["_id"] = json!("doc");
    let (id, rev) = store.put(input).await.unwrap();

    let mut expected = body;
    expected["_id"] = json!(id);
    expected["_rev"] = json!(rev);
    assert_eq!(store.get("doc", GetOptions::default()).await.unwrap(), expected);
}

#[tokio::test]
async fn test_update_increments_generation() {
    let (store, _) = open_store();
    let (_, mut rev) = store.put(json!({"_id": "a", "n": 0})).await.unwrap();
    for n in 1..5 {
        let parent: RevId = rev.parse().unwrap();
        let (_, next) = store.put(json!({"_id": "a", "_rev": rev, "n": n})).await.unwrap();
        let next_rev: RevId = next.parse().unwrap();
        assert_eq!(next_rev.generation, parent.generation + 1);
        rev = next;
    }
    let doc = store.get("a", GetOptions::default()).await.unwrap();
    assert_eq!(doc["_rev"], json!(rev));
    assert_eq!(doc["n"], json!(4));
}

#[tokio::test]
async fn test_stale_parent_conflicts_only_its_slot() {
    let (store, _) = open_store();
    let (_, rev1) = store.put(json!({"_id": "a", "v": 1})).await.unwrap();
    store.put(json!({"_id": "a", "_rev": rev1, "v": 2})).await.unwrap();

    let results = store
        .bulk_docs(
            vec![
                json!({"_id": "a", "_rev": rev1, "v": 3}),
                json!({"_id": "b", "v": 1}),
            ],
            true,
        )
        .await
        .unwrap();
    assert_eq!(results[0].error_kind(), Some(ErrorKind::RevisionConflict));
    assert!(results[1].is_ok());
    assert_eq!(store.get("a", GetOptions::default()).await.unwrap()["v"], json!(2));
    assert_eq!(store.get("b", GetOptions::default()).await.unwrap()["v"], json!(1));
}

#[tokio::test]
async fn test_insert_over_existing_doc_conflicts() {
    let (store, _) = open_store();
    store.put(json!({"_id": "a", "v": 1})).await.unwrap();
    let err = store.put(json!({"_id": "a", "v": 2})).await.unwrap_err();
    assert!(matches!(err, Error::RevisionConflict(_)));
}

#[tokio::test]
async fn test_unknown_parent_conflicts() {
    let (store, _) = open_store();
    let err = store.put(json!({"_id": "new", "_rev": "3-abc", "v": 1})).await.unwrap_err();
    assert!(matches!(err, Error::RevisionConflict(_)));
}

#[tokio::test]
async fn test_malformed_entry_aborts_batch() {
    let (store, _) = open_store();
    let err = store
        .bulk_docs(vec![json!({"_id": "ok", "v": 1}), json!({"_id": "bad", "_secret": 1})], true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedDocument(_)));
    assert!(matches!(
        store.get("ok", GetOptions::default()).await,
        Err(Error::MissingDocument(_))
    ));
}

#[tokio::test]
async fn test_missing_id_gets_generated() {
    let (store, _) = open_store();
    let results = store.bulk_docs(vec![json!({"v": 1})], true).await.unwrap();
    assert!(results[0].is_ok());
    assert_eq!(results[0].id().len(), 36);

    let err = store.bulk_docs(vec![json!({"_rev": "1-a", "v": 1})], false).await.unwrap_err();
    assert!(matches!(err, Error::MalformedDocument(_)));
}

#[tokio::test]
async fn test_replicated_replay_is_idempotent() {
    let (store, backend) = open_store();
    let docs = vec![json!({
        "_id": "r",
        "_rev": "3-ccc",
        "_revisions": {"start": 3, "ids": ["ccc", "bbb", "aaa"]},
        "v": 3
    })];
    let first = store.bulk_docs(docs.clone(), false).await.unwrap();
    assert_eq!(first[0], WriteOutcome::Ok { id: "r".into(), rev: "3-ccc".into() });
    let winner = store.get("r", GetOptions::default()).await.unwrap()["_rev"].clone();
    let seq = store.info().await.unwrap().update_seq;

    let replay = store.bulk_docs(docs, false).await.unwrap();
    assert!(replay[0].is_ok());
    assert_eq!(stored_revisions(&backend, "r").await, 1);
    assert_eq!(store.info().await.unwrap().update_seq, seq);
    assert_eq!(store.get("r", GetOptions::default()).await.unwrap()["_rev"], winner);

    let tree = store.get_revision_tree("r").await.unwrap();
    assert!(tree.contains(&RevId::new(1, "aaa")));
    assert_eq!(tree.winning_rev(), Some(RevId::new(3, "ccc")));
}

#[tokio::test]
async fn test_replicated_branches_pick_winner() {
    let (store, _) = open_store();
    store
        .bulk_docs(
            vec![
                json!({"_id": "c", "_rev": "1-aaa", "v": "a"}),
                json!({"_id": "c", "_rev": "1-bbb", "v": "b"}),
            ],
            false,
        )
        .await
        .unwrap();
    let opts = GetOptions {
        conflicts: true,
        ..GetOptions::default()
    };
    let doc = store.get("c", opts).await.unwrap();
    assert_eq!(doc["_rev"], json!("1-bbb"));
    assert_eq!(doc["_conflicts"], json!(["1-aaa"]));

    // A non-deleted edit must build on the winner.
    let err = store.put(json!({"_id": "c", "_rev": "1-aaa", "v": "x"})).await.unwrap_err();
    assert!(matches!(err, Error::RevisionConflict(_)));

    // Deleting the losing leaf resolves the conflict.
    store.put(json!({"_id": "c", "_rev": "1-aaa", "_deleted": true})).await.unwrap();
    let doc = store.get("c", GetOptions { conflicts: true, ..GetOptions::default() }).await.unwrap();
    assert_eq!(doc["_rev"], json!("1-bbb"));
    assert!(doc.get("_conflicts").is_none());
}

#[tokio::test]
async fn test_delete_and_recreate() {
    let (store, _) = open_store();
    let (_, rev1) = store.put(json!({"_id": "a", "v": 1})).await.unwrap();
    let (_, rev2) = store.put(json!({"_id": "a", "_rev": rev1, "_deleted": true})).await.unwrap();

    assert!(matches!(
        store.get("a", GetOptions::default()).await,
        Err(Error::DocumentDeleted(_))
    ));
    let tombstone = store.get("a", GetOptions::rev(rev2.parse().unwrap())).await.unwrap();
    assert_eq!(tombstone["_deleted"], json!(true));

    let (_, rev3) = store.put(json!({"_id": "a", "v": 2})).await.unwrap();
    assert!(rev3.starts_with("3-"));
    assert_eq!(store.get("a", GetOptions::default()).await.unwrap()["v"], json!(2));
}

#[tokio::test]
async fn test_local_docs_in_batch() {
    let (store, _) = open_store();
    let results = store
        .bulk_docs(
            vec![
                json!({"_id": "_local/cp", "seq": 1}),
                json!({"_id": "doc", "v": 1}),
            ],
            true,
        )
        .await
        .unwrap();
    assert_eq!(results[0], WriteOutcome::Ok { id: "_local/cp".into(), rev: "0-1".into() });
    assert!(results[1].is_ok());

    let results = store
        .bulk_docs(
            vec![
                json!({"_id": "_local/cp", "_rev": "0-1", "seq": 2}),
                json!({"_id": "_local/other", "_deleted": true}),
            ],
            true,
        )
        .await
        .unwrap();
    assert_eq!(results[0].rev(), Some("0-2"));
    assert_eq!(results[1].error_kind(), Some(ErrorKind::MissingDocument));

    let local = store.get("_local/cp", GetOptions::default()).await.unwrap();
    assert_eq!(local, json!({"_id": "_local/cp", "_rev": "0-2", "seq": 2}));

    // Local documents never show up in the change feed.
    let changes = store.changes(ChangesOptions::default()).await.unwrap();
    let ids: Vec<&str> = changes.results.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["doc"]);
}

#[tokio::test]
async fn test_revs_limit_stems_history() {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let mut cfg = StoreConfig::new("stem");
    cfg.revs_limit = Some(2);
    let store = DocStore::open(backend.clone(), cfg);

    let (_, mut rev) = store.put(json!({"_id": "a", "n": 0})).await.unwrap();
    let first: RevId = rev.parse().unwrap();
    for n in 1..4 {
        rev = store.put(json!({"_id": "a", "_rev": rev, "n": n})).await.unwrap().1;
    }
    let tree = store.get_revision_tree("a").await.unwrap();
    assert!(!tree.contains(&first));
    assert_eq!(stored_revisions(&backend, "a").await, 2);
    assert!(matches!(
        store.get("a", GetOptions::rev(first)).await,
        Err(Error::MissingDocument(_))
    ));
}

#[tokio::test]
async fn test_auto_compaction_drops_superseded_bodies() {
    let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let mut cfg = StoreConfig::new("auto");
    cfg.auto_compaction = true;
    let store = DocStore::open(backend.clone(), cfg);

    let (_, rev1) = store.put(json!({"_id": "a", "v": 1})).await.unwrap();
    store.put(json!({"_id": "a", "_rev": rev1, "v": 2})).await.unwrap();
    assert_eq!(stored_revisions(&backend, "a").await, 1);
    let tree = store.get_revision_tree("a").await.unwrap();
    assert!(tree.contains(&rev1.parse().unwrap()));
}

#[tokio::test]
async fn test_empty_batch() {
    let (store, _) = open_store();
    assert!(store.bulk_docs(Vec::<Value>::new(), true).await.unwrap().is_empty());
}
