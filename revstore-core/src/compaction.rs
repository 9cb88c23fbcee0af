//! Compaction
//!
//! Purged revisions stay in the tree as `missing` nodes; only their stored
//! bodies (and attachments nobody else references) are removed.

use crate::attachments;
use crate::backend::{BackingStore, Executor};
use crate::document::DocMetadata;
use crate::error::{Error, Result};
use crate::rev_tree::{RevStatus, RevTree};
use crate::revision::RevId;
use crate::schema::DOC_STORE;
use crate::sql_params;
use tracing::{debug, info, warn};

/// Purge the given revisions of `doc_id`. Returns the revisions purged.
pub async fn do_compaction(db: &dyn BackingStore, doc_id: &str, revs: &[RevId]) -> Result<Vec<RevId>> {
    if revs.is_empty() {
        return Ok(Vec::new());
    }
    compact_with(db, doc_id, |tree, winner| {
        revs.iter()
            .filter(|rev| {
                if *rev == winner {
                    warn!("Refusing to compact winning revision {} of {}", rev, doc_id);
                    return false;
                }
                tree.contains(rev)
            })
            .cloned()
            .collect()
    })
    .await
}

/// Purge every non-leaf revision of `doc_id` that still has a body.
pub async fn compact_document(db: &dyn BackingStore, doc_id: &str) -> Result<Vec<RevId>> {
    compact_with(db, doc_id, |tree, _| {
        tree.nodes()
            .into_iter()
            .filter(|e| !e.is_leaf && e.node.status == RevStatus::Available)
            .map(|e| e.rev)
            .collect()
    })
    .await
}

/// Compact every document. Returns the number of revisions purged.
pub async fn compact(db: &dyn BackingStore) -> Result<usize> {
    let rows = db.query(&format!("SELECT id FROM {}", DOC_STORE), &[]).await?;
    let mut purged = 0;
    for row in rows {
        purged += compact_document(db, row.get_str("id")?).await?.len();
    }
    info!("Compaction purged {} revisions", purged);
    Ok(purged)
}

async fn compact_with<F>(db: &dyn BackingStore, doc_id: &str, select: F) -> Result<Vec<RevId>>
where
    F: FnOnce(&RevTree, &RevId) -> Vec<RevId> + Send,
{
    let tx = db.begin().await?;
    let purged = purge(tx.as_executor(), doc_id, select).await;
    match purged {
        Ok(revs) => {
            tx.commit().await?;
            Ok(revs)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!("Rollback after failed compaction also failed: {}", rb);
            }
            Err(e)
        }
    }
}

async fn purge<F>(db: &dyn Executor, doc_id: &str, select: F) -> Result<Vec<RevId>>
where
    F: FnOnce(&RevTree, &RevId) -> Vec<RevId> + Send,
{
    let rows = db
        .query(
            &format!("SELECT json FROM {} WHERE id = ?", DOC_STORE),
            &sql_params![doc_id],
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| Error::MissingDocument(doc_id.to_string()))?;
    let mut metadata = DocMetadata::from_json(row.get_str("json")?)?;

    let revs = select(&metadata.rev_tree, &metadata.winning_rev);
    if revs.is_empty() {
        return Ok(revs);
    }
    metadata.rev_tree.mark_missing(&revs);
    db.execute(
        &format!("UPDATE {} SET json = ? WHERE id = ?", DOC_STORE),
        &sql_params![metadata.to_json()?, doc_id],
    )
    .await?;

    let rev_strings: Vec<String> = revs.iter().map(RevId::to_string).collect();
    let seqs = attachments::remove_old_revisions(db, doc_id, &rev_strings).await?;
    debug!("Compacted {} revisions ({} stored) of {}", revs.len(), seqs.len(), doc_id);
    Ok(revs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::bulk_docs::bulk_docs;
    use crate::config::StoreConfig;
    use crate::schema::BY_SEQ_STORE;
    use serde_json::json;

    async fn two_revs(db: &SqliteBackend) -> (RevId, RevId) {
        let cfg = StoreConfig::new("c");
        let r1 = bulk_docs(db, &cfg, vec![json!({"_id": "a", "v": 1})], true).await.unwrap();
        let rev1: RevId = r1[0].rev().unwrap().parse().unwrap();
        let r2 = bulk_docs(db, &cfg, vec![json!({"_id": "a", "_rev": rev1.to_string(), "v": 2})], true)
            .await
            .unwrap();
        (rev1, r2[0].rev().unwrap().parse().unwrap())
    }

    async fn stored_revs(db: &SqliteBackend) -> usize {
        db.query(&format!("SELECT seq FROM {}", BY_SEQ_STORE), &[])
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_empty_list_is_noop() {
        let db = SqliteBackend::open_in_memory().unwrap();
        assert!(do_compaction(&db, "nope", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_winner_is_never_purged() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let (rev1, rev2) = two_revs(&db).await;
        let purged = do_compaction(&db, "a", &[rev1.clone(), rev2]).await.unwrap();
        assert_eq!(purged, vec![rev1]);
        assert_eq!(stored_revs(&db).await, 1);
    }

    #[tokio::test]
    async fn test_compact_document_marks_missing() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let (rev1, _) = two_revs(&db).await;
        assert_eq!(compact_document(&db, "a").await.unwrap(), vec![rev1.clone()]);
        assert!(compact_document(&db, "a").await.unwrap().is_empty());

        let rows = db
            .query(&format!("SELECT json FROM {} WHERE id='a'", DOC_STORE), &[])
            .await
            .unwrap();
        let meta = DocMetadata::from_json(rows[0].get_str("json").unwrap()).unwrap();
        assert_eq!(meta.rev_tree.node(&rev1).unwrap().status, RevStatus::Missing);
    }

    #[tokio::test]
    async fn test_compact_all() {
        let db = SqliteBackend::open_in_memory().unwrap();
        two_revs(&db).await;
        assert_eq!(compact(&db).await.unwrap(), 1);
        assert_eq!(stored_revs(&db).await, 1);
    }
}
