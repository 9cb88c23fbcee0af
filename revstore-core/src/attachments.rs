//! Content-addressed attachment storage
//!
//! Bodies live once per digest in the attach store. The digest/sequence
//! mapping records which revisions reference which body; a body is removed
//! only once no mapping row names its digest.

use crate::backend::{Executor, SqlValue};
use crate::document::Attachment;
use crate::error::{Error, Result};
use crate::query::question_marks;
use crate::schema::{ATTACH_AND_SEQ_STORE, ATTACH_STORE, BY_SEQ_STORE};
use crate::sql_params;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Length of the stored body for `digest`, or `None` when unknown.
pub async fn stored_length(db: &dyn Executor, digest: &str) -> Result<Option<u64>> {
    let rows = db
        .query(
            &format!("SELECT length(body) AS len FROM {} WHERE digest=?", ATTACH_STORE),
            &sql_params![digest],
        )
        .await?;
    match rows.first() {
        Some(row) => Ok(Some(row.get_opt_i64("len")?.unwrap_or(0) as u64)),
        None => Ok(None),
    }
}

/// Fail with `MissingStub` unless the stub names stored content. A missing
/// length is filled from the stored body.
pub async fn verify_stub(db: &dyn Executor, att: &mut Attachment) -> Result<()> {
    debug!("Verifying stub attachment {}", att.digest);
    match stored_length(db, &att.digest).await? {
        Some(len) => {
            if att.length == 0 {
                att.length = len;
            }
            Ok(())
        }
        None => {
            warn!("Unknown stub attachment with digest {}", att.digest);
            Err(Error::MissingStub(att.digest.clone()))
        }
    }
}

/// Store `data` under `digest` unless a body with that digest exists.
pub async fn save(db: &dyn Executor, digest: &str, data: &[u8]) -> Result<()> {
    let existing = db
        .query(
            &format!("SELECT digest FROM {} WHERE digest=?", ATTACH_STORE),
            &sql_params![digest],
        )
        .await?;
    if !existing.is_empty() {
        return Ok(());
    }
    let res = db
        .execute(
            &format!("INSERT INTO {} (digest, body, escaped) VALUES (?,?,0)", ATTACH_STORE),
            &sql_params![digest, data],
        )
        .await;
    match res {
        Ok(_) => {
            debug!("Saved attachment {} ({} bytes)", digest, data.len());
            Ok(())
        }
        // A concurrent writer stored the same content first.
        Err(e) if e.is_constraint_violation() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Attachment body by digest.
pub async fn get(db: &dyn Executor, digest: &str) -> Result<Bytes> {
    let rows = db
        .query(
            &format!("SELECT body FROM {} WHERE digest=?", ATTACH_STORE),
            &sql_params![digest],
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| Error::MissingDocument(format!("unknown attachment {}", digest)))?;
    Ok(Bytes::from(row.get_blob("body")?))
}

/// Mark the attachments of a rendered document as stubs, or inline their
/// bodies as base64 `data`.
pub async fn render(db: &dyn Executor, doc: &mut Map<String, Value>, inline: bool) -> Result<()> {
    let Some(Value::Object(atts)) = doc.get_mut("_attachments") else {
        return Ok(());
    };
    for att in atts.values_mut() {
        let Value::Object(att) = att else {
            continue;
        };
        if inline {
            let digest = att.get("digest").and_then(Value::as_str).unwrap_or_default().to_string();
            let body = get(db, &digest).await?;
            att.insert("data".into(), Value::String(STANDARD.encode(&body)));
        } else {
            att.insert("stub".into(), Value::Bool(true));
        }
    }
    Ok(())
}

/// Record that the revision stored at `seq` references `digest`.
pub async fn insert_mapping(db: &dyn Executor, digest: &str, seq: i64) -> Result<()> {
    let res = db
        .execute(
            &format!("INSERT INTO {} (digest, seq) VALUES (?,?)", ATTACH_AND_SEQ_STORE),
            &sql_params![digest, seq],
        )
        .await;
    match res {
        Ok(_) => Ok(()),
        // Replayed revisions map the same pair again.
        Err(e) if e.is_constraint_violation() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete the stored bodies of `revs` for `doc_id`, then reclaim any
/// attachment left without references. Returns the removed sequences.
pub async fn remove_old_revisions(db: &dyn Executor, doc_id: &str, revs: &[String]) -> Result<Vec<i64>> {
    if revs.is_empty() {
        return Ok(Vec::new());
    }
    let mut seqs = Vec::new();
    for rev in revs {
        let rows = db
            .query(
                &format!("SELECT seq FROM {} WHERE doc_id=? AND rev=?", BY_SEQ_STORE),
                &sql_params![doc_id, rev],
            )
            .await?;
        let Some(row) = rows.first() else {
            continue;
        };
        let seq = row.get_i64("seq")?;
        db.execute(
            &format!("DELETE FROM {} WHERE seq=?", BY_SEQ_STORE),
            &sql_params![seq],
        )
        .await?;
        seqs.push(seq);
    }
    debug!("Removed {} stored revisions of {}", seqs.len(), doc_id);
    remove_orphans(db, &seqs).await?;
    Ok(seqs)
}

/// Drop the mappings of `seqs`, then delete every digest they referenced
/// that has no surviving mapping.
pub async fn remove_orphans(db: &dyn Executor, seqs: &[i64]) -> Result<Vec<String>> {
    if seqs.is_empty() {
        return Ok(Vec::new());
    }
    let seq_params: Vec<SqlValue> = seqs.iter().map(|s| SqlValue::from(*s)).collect();
    let marks = question_marks(seqs.len());

    let rows = db
        .query(
            &format!("SELECT DISTINCT digest FROM {} WHERE seq IN {}", ATTACH_AND_SEQ_STORE, marks),
            &seq_params,
        )
        .await?;
    let candidates: Vec<String> = rows
        .iter()
        .map(|r| r.get_string("digest"))
        .collect::<Result<_>>()?;

    db.execute(
        &format!("DELETE FROM {} WHERE seq IN {}", ATTACH_AND_SEQ_STORE, marks),
        &seq_params,
    )
    .await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let digest_params: Vec<SqlValue> = candidates.iter().map(SqlValue::from).collect();
    let rows = db
        .query(
            &format!(
                "SELECT DISTINCT digest FROM {} WHERE digest IN {}",
                ATTACH_AND_SEQ_STORE,
                question_marks(candidates.len())
            ),
            &digest_params,
        )
        .await?;
    let surviving: HashSet<String> = rows
        .iter()
        .map(|r| r.get_string("digest"))
        .collect::<Result<_>>()?;

    let mut removed = Vec::new();
    for digest in candidates.into_iter().filter(|d| !surviving.contains(d)) {
        db.execute(
            &format!("DELETE FROM {} WHERE digest=?", ATTACH_STORE),
            &sql_params![&digest],
        )
        .await?;
        debug!("Removed orphaned attachment {}", digest);
        removed.push(digest);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::document::attachment_digest;

    async fn count(db: &SqliteBackend, table: &str) -> i64 {
        let rows = db
            .query(&format!("SELECT COUNT(*) AS n FROM {}", table), &[])
            .await
            .unwrap();
        rows[0].get_i64("n").unwrap()
    }

    #[tokio::test]
    async fn test_save_dedupes_by_digest() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let digest = attachment_digest(b"hello");
        save(&db, &digest, b"hello").await.unwrap();
        save(&db, &digest, b"hello").await.unwrap();
        assert_eq!(count(&db, ATTACH_STORE).await, 1);
        assert_eq!(&get(&db, &digest).await.unwrap()[..], b"hello");
        assert_eq!(stored_length(&db, &digest).await.unwrap(), Some(5));
    }

    fn stub(digest: &str, length: u64) -> Attachment {
        Attachment {
            content_type: None,
            digest: digest.to_string(),
            length,
            revpos: 1,
            data: None,
            stub: true,
        }
    }

    #[tokio::test]
    async fn test_verify_unknown_stub() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let err = verify_stub(&db, &mut stub("sha256-nope", 0)).await.unwrap_err();
        assert!(matches!(err, Error::MissingStub(d) if d == "sha256-nope"));
    }

    #[tokio::test]
    async fn test_verify_stub_fills_missing_length() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let digest = attachment_digest(b"hello");
        save(&db, &digest, b"hello").await.unwrap();

        let mut att = stub(&digest, 0);
        verify_stub(&db, &mut att).await.unwrap();
        assert_eq!(att.length, 5);

        let mut att = stub(&digest, 9);
        verify_stub(&db, &mut att).await.unwrap();
        assert_eq!(att.length, 9);
    }

    #[tokio::test]
    async fn test_duplicate_mapping_is_tolerated() {
        let db = SqliteBackend::open_in_memory().unwrap();
        insert_mapping(&db, "d", 1).await.unwrap();
        insert_mapping(&db, "d", 1).await.unwrap();
        assert_eq!(count(&db, ATTACH_AND_SEQ_STORE).await, 1);
    }

    #[tokio::test]
    async fn test_shared_digest_survives_partial_removal() {
        let db = SqliteBackend::open_in_memory().unwrap();
        save(&db, "shared", b"x").await.unwrap();
        save(&db, "lonely", b"y").await.unwrap();
        insert_mapping(&db, "shared", 1).await.unwrap();
        insert_mapping(&db, "shared", 2).await.unwrap();
        insert_mapping(&db, "lonely", 1).await.unwrap();

        let removed = remove_orphans(&db, &[1]).await.unwrap();
        assert_eq!(removed, vec!["lonely".to_string()]);
        assert!(get(&db, "shared").await.is_ok());
        assert!(get(&db, "lonely").await.is_err());

        let removed = remove_orphans(&db, &[2]).await.unwrap();
        assert_eq!(removed, vec!["shared".to_string()]);
        assert_eq!(count(&db, ATTACH_STORE).await, 0);
    }
}
