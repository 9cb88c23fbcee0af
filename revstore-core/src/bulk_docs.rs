//! Bulk write coordinator
//!
//! A batch is parsed up front (any malformed entry fails the whole call),
//! then applied inside one transaction: stub verification, metadata
//! prefetch, per-document merge and write. Per-document conflicts land in
//! the result slot; backing-store failures roll the batch back.

use crate::attachments;
use crate::backend::{BackingStore, Executor};
use crate::config::StoreConfig;
use crate::document::{is_local_id, DocMetadata, ParsedDoc};
use crate::error::{Error, ErrorKind, Result};
use crate::local;
use crate::rev_tree::{MergeOutcome, RevTree};
use crate::revision::RevId;
use crate::schema::{BY_SEQ_STORE, DOC_STORE};
use crate::sql_params;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Result slot for one input document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Ok {
        id: String,
        rev: String,
    },
    Error {
        id: String,
        rev: Option<String>,
        kind: ErrorKind,
        reason: String,
    },
}

impl WriteOutcome {
    fn failed(id: &str, rev: Option<String>, err: &Error) -> Self {
        WriteOutcome::Error {
            id: id.to_string(),
            rev,
            kind: err.kind(),
            reason: err.reason(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, WriteOutcome::Ok { .. })
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOutcome::Ok { id, .. } | WriteOutcome::Error { id, .. } => id,
        }
    }

    pub fn rev(&self) -> Option<&str> {
        match self {
            WriteOutcome::Ok { rev, .. } => Some(rev),
            WriteOutcome::Error { rev, .. } => rev.as_deref(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            WriteOutcome::Ok { .. } => None,
            WriteOutcome::Error { kind, .. } => Some(*kind),
        }
    }

    /// `(id, rev)` on success, the slot's error otherwise.
    pub fn into_result(self) -> Result<(String, String)> {
        match self {
            WriteOutcome::Ok { id, rev } => Ok((id, rev)),
            WriteOutcome::Error { kind, reason, .. } => Err(match kind {
                ErrorKind::MissingDocument => Error::MissingDocument(reason),
                ErrorKind::DocumentDeleted => Error::DocumentDeleted(reason),
                ErrorKind::RevisionConflict => Error::RevisionConflict(reason),
                ErrorKind::MissingAttachmentStub => Error::MissingStub(reason),
                ErrorKind::MalformedDocument => Error::MalformedDocument(reason),
                ErrorKind::FeedStopped => Error::FeedStopped(reason),
                ErrorKind::BackingStoreError => Error::backing_store("BulkWrite", reason),
            }),
        }
    }
}

enum Entry {
    Local {
        id: String,
        rev: Option<String>,
        deleted: bool,
        body: Map<String, Value>,
    },
    Doc(Box<ParsedDoc>),
}

impl Entry {
    fn parse(value: Value, new_edits: bool) -> Result<Self> {
        let local_id = value.get("_id").and_then(Value::as_str).map(is_local_id).unwrap_or(false);
        if local_id {
            let (id, rev, mut body) = local::split(value)?;
            let deleted = body.remove("_deleted").and_then(|v| v.as_bool()).unwrap_or(false);
            return Ok(Entry::Local { id, rev, deleted, body });
        }
        Ok(Entry::Doc(Box::new(ParsedDoc::from_value(value, new_edits)?)))
    }
}

/// Apply a batch atomically; results follow input order.
pub async fn bulk_docs(
    db: &dyn BackingStore,
    config: &StoreConfig,
    docs: Vec<Value>,
    new_edits: bool,
) -> Result<Vec<WriteOutcome>> {
    let entries = docs
        .into_iter()
        .map(|doc| Entry::parse(doc, new_edits))
        .collect::<Result<Vec<_>>>()?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let tx = db.begin().await?;
    let written = write_batch(tx.as_executor(), config, entries).await;
    match written {
        Ok(results) => {
            tx.commit().await?;
            Ok(results)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!("Rollback after failed bulk write also failed: {}", rb);
            }
            Err(e)
        }
    }
}

async fn write_batch(db: &dyn Executor, config: &StoreConfig, mut entries: Vec<Entry>) -> Result<Vec<WriteOutcome>> {
    verify_attachments(db, &mut entries).await?;

    let mut fetched: HashMap<String, DocMetadata> = HashMap::new();
    for entry in &entries {
        if let Entry::Doc(parsed) = entry {
            if fetched.contains_key(parsed.id()) {
                continue;
            }
            let rows = db
                .query(
                    &format!("SELECT json FROM {} WHERE id = ?", DOC_STORE),
                    &sql_params![parsed.id()],
                )
                .await?;
            if let Some(row) = rows.first() {
                fetched.insert(parsed.id().to_string(), DocMetadata::from_json(row.get_str("json")?)?);
            }
        }
    }

    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let outcome = match entry {
            Entry::Local { id, rev, deleted, body } => write_local(db, id, rev, deleted, body).await?,
            Entry::Doc(parsed) => process_doc(db, config, &mut fetched, *parsed).await?,
        };
        results.push(outcome);
    }
    Ok(results)
}

/// Every stub must name stored content. Missing lengths are filled in.
async fn verify_attachments(db: &dyn Executor, entries: &mut [Entry]) -> Result<()> {
    for entry in entries.iter_mut() {
        let Entry::Doc(parsed) = entry else {
            continue;
        };
        for att in parsed.doc.attachments.values_mut().filter(|a| a.stub) {
            attachments::verify_stub(db, att).await?;
        }
    }
    Ok(())
}

async fn write_local(
    db: &dyn Executor,
    id: String,
    rev: Option<String>,
    deleted: bool,
    body: Map<String, Value>,
) -> Result<WriteOutcome> {
    let res = if deleted {
        match &rev {
            Some(rev) => local::remove_local(db, &id, rev).await,
            None => Err(Error::MissingDocument(id.clone())),
        }
    } else {
        local::put_local(db, &id, rev.as_deref(), &body).await
    };
    match res {
        Ok(rev) => Ok(WriteOutcome::Ok { id, rev }),
        Err(e @ Error::BackingStore { .. }) => Err(e),
        Err(e) => Ok(WriteOutcome::failed(&id, rev, &e)),
    }
}

async fn process_doc(
    db: &dyn Executor,
    config: &StoreConfig,
    fetched: &mut HashMap<String, DocMetadata>,
    parsed: ParsedDoc,
) -> Result<WriteOutcome> {
    let id = parsed.id().to_string();
    let prev = fetched.get(&id).cloned();
    let outcome = match prev {
        None => insert_doc(db, config, fetched, parsed).await?,
        Some(prev) => update_doc(db, config, fetched, &prev, parsed).await?,
    };
    Ok(outcome)
}

fn conflict(parsed: &ParsedDoc) -> WriteOutcome {
    let err = Error::RevisionConflict(format!("Document update conflict: {}", parsed.id()));
    debug!("Revision conflict writing {} at {}", parsed.id(), parsed.rev);
    WriteOutcome::failed(parsed.id(), None, &err)
}

async fn insert_doc(
    db: &dyn Executor,
    config: &StoreConfig,
    fetched: &mut HashMap<String, DocMetadata>,
    parsed: ParsedDoc,
) -> Result<WriteOutcome> {
    // A new edit naming a parent the store has never seen.
    if parsed.parent().is_some() {
        return Ok(conflict(&parsed));
    }
    let mut tree = RevTree::new();
    let merged = tree.merge(parsed.path.clone(), config.revs_limit);
    write_doc(db, config, fetched, parsed, tree, merged.stemmed, false).await
}

async fn update_doc(
    db: &dyn Executor,
    config: &StoreConfig,
    fetched: &mut HashMap<String, DocMetadata>,
    prev: &DocMetadata,
    mut parsed: ParsedDoc,
) -> Result<WriteOutcome> {
    if !parsed.new_edits() && prev.rev_tree.contains(&parsed.rev) {
        return Ok(WriteOutcome::Ok {
            id: parsed.id().to_string(),
            rev: parsed.rev.to_string(),
        });
    }

    // Recreating a deleted document continues its history.
    if parsed.new_edits() && prev.deleted && !parsed.doc.deleted && parsed.parent().is_none() {
        let id = parsed.id().to_string();
        parsed = match parsed.rebase(prev.winning_rev.clone()) {
            Ok(rebased) => rebased,
            Err(e) => return Ok(WriteOutcome::failed(&id, None, &e)),
        };
    }

    let mut tree = prev.rev_tree.clone();
    let merged = tree.merge(parsed.path.clone(), config.revs_limit);
    if parsed.new_edits() {
        let extends_leaf = merged.outcome == MergeOutcome::NewLeaf;
        let extends_winner = parsed.parent() == Some(&prev.winning_rev);
        // Deletions may close any conflicting leaf; other edits must build on the winner.
        if !extends_leaf || (!parsed.doc.deleted && !extends_winner) {
            return Ok(conflict(&parsed));
        }
    }
    write_doc(db, config, fetched, parsed, tree, merged.stemmed, true).await
}

async fn write_doc(
    db: &dyn Executor,
    config: &StoreConfig,
    fetched: &mut HashMap<String, DocMetadata>,
    parsed: ParsedDoc,
    mut tree: RevTree,
    stemmed: Vec<RevId>,
    is_update: bool,
) -> Result<WriteOutcome> {
    let id = parsed.id().to_string();
    let rev = parsed.rev.to_string();
    let winner = tree
        .winning_rev()
        .ok_or_else(|| Error::MalformedDocument(format!("empty revision tree for {}", id)))?;
    let winner_deleted = tree.is_deleted(&winner);

    for att in parsed.doc.attachments.values() {
        if let Some(data) = &att.data {
            attachments::save(db, &att.digest, data).await?;
        }
    }

    let json = parsed.doc.stored_json().to_string();
    let deleted = parsed.doc.deleted;
    let inserted = db
        .execute(
            &format!("INSERT INTO {} (doc_id, rev, json, deleted) VALUES (?, ?, ?, ?)", BY_SEQ_STORE),
            &sql_params![&id, &rev, &json, deleted],
        )
        .await;
    let seq = match inserted {
        Ok(out) => out.last_insert_id,
        // The (doc_id, rev) row already exists: overwrite it in place and
        // keep its sequence.
        Err(e) if e.is_constraint_violation() => {
            let rows = db
                .query(
                    &format!("SELECT seq FROM {} WHERE doc_id=? AND rev=?", BY_SEQ_STORE),
                    &sql_params![&id, &rev],
                )
                .await?;
            let seq = rows.first().ok_or(e)?.get_i64("seq")?;
            info!("Got a constraint error, updating instead: seq={}, id={}, rev={}", seq, id, rev);
            db.execute(
                &format!("UPDATE {} SET json=?, deleted=? WHERE doc_id=? AND rev=?", BY_SEQ_STORE),
                &sql_params![&json, deleted, &id, &rev],
            )
            .await?;
            seq
        }
        Err(e) => return Err(e),
    };

    for att in parsed.doc.attachments.values() {
        attachments::insert_mapping(db, &att.digest, seq).await?;
    }

    let mut to_compact = Vec::new();
    if is_update && config.auto_compaction {
        to_compact = tree.compact();
    }
    to_compact.extend(stemmed);
    if !to_compact.is_empty() {
        let revs: Vec<String> = to_compact.iter().map(RevId::to_string).collect();
        attachments::remove_old_revisions(db, &id, &revs).await?;
    }

    let metadata = DocMetadata {
        id: id.clone(),
        rev_tree: tree,
        winning_rev: winner.clone(),
        deleted: winner_deleted,
        seq,
    };
    let metadata_json = metadata.to_json()?;
    if is_update {
        db.execute(
            &format!(
                "UPDATE {ds} SET json=?, max_seq=?, winningseq=\
                 (SELECT seq FROM {bs} WHERE doc_id={ds}.id AND rev=?) WHERE id=?",
                ds = DOC_STORE,
                bs = BY_SEQ_STORE
            ),
            &sql_params![metadata_json, seq, winner.to_string(), &id],
        )
        .await?;
    } else {
        db.execute(
            &format!("INSERT INTO {} (id, winningseq, max_seq, json) VALUES (?,?,?,?)", DOC_STORE),
            &sql_params![&id, seq, seq, metadata_json],
        )
        .await?;
    }
    debug!("Wrote {} rev {} at seq {}", id, rev, seq);
    fetched.insert(id.clone(), metadata);
    Ok(WriteOutcome::Ok { id, rev })
}
