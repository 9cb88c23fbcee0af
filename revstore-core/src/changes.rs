//! Change feed
//!
//! A change reports each document once, at the sequence of its latest
//! write, together with its current winning revision. One-shot feeds scan
//! the document store ordered by `max_seq`; continuous feeds repeat that
//! scan from their own checkpoint whenever the store's [`ChangeBus`] fires.

use crate::attachments;
use crate::backend::{BackingStore, Executor, SqlValue};
use crate::document::{inflate, DocMetadata};
use crate::error::{Error, Result};
use crate::notify::ChangeBus;
use crate::query::{build_select, question_marks};
use crate::revision::RevId;
use crate::schema::{BY_SEQ_STORE, DOC_STORE};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Which revisions a change lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style {
    /// Only the winning revision.
    #[default]
    MainOnly,
    /// Every leaf, winner first.
    AllDocs,
}

/// Verdict of a change filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Skip,
    /// End the feed with [`Error::FeedStopped`].
    Stop(String),
}

pub type ChangeFilter = Arc<dyn Fn(&ChangeEvent) -> FilterDecision + Send + Sync>;

#[derive(Clone)]
pub struct ChangesOptions {
    /// Only changes with a greater sequence are reported. Ignored when descending.
    pub since: i64,
    pub descending: bool,
    /// Maximum number of reported changes; `Some(0)` is treated as one.
    pub limit: Option<usize>,
    pub doc_ids: Option<Vec<String>>,
    pub filter: Option<ChangeFilter>,
    pub include_docs: bool,
    pub conflicts: bool,
    pub attachments: bool,
    pub style: Style,
    /// Collect changes into [`ChangesResponse::results`].
    pub return_docs: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            since: 0,
            descending: false,
            limit: None,
            doc_ids: None,
            filter: None,
            include_docs: false,
            conflicts: false,
            attachments: false,
            style: Style::MainOnly,
            return_docs: true,
        }
    }
}

impl std::fmt::Debug for ChangesOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesOptions")
            .field("since", &self.since)
            .field("descending", &self.descending)
            .field("limit", &self.limit)
            .field("doc_ids", &self.doc_ids)
            .field("filter", &self.filter.is_some())
            .field("include_docs", &self.include_docs)
            .field("style", &self.style)
            .finish()
    }
}

impl ChangesOptions {
    pub fn since(seq: i64) -> Self {
        Self {
            since: seq,
            ..Self::default()
        }
    }

    fn effective_limit(&self) -> Option<usize> {
        self.limit.map(|l| l.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRev {
    pub rev: RevId,
}

/// One document's latest change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub seq: i64,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeEvent>,
    /// Sequence of the last scanned row, or the starting checkpoint.
    pub last_seq: i64,
}

/// Scan the document store once, handing every kept change to `on_change`.
pub(crate) async fn scan(
    db: &dyn Executor,
    opts: &ChangesOptions,
    mut on_change: impl FnMut(&ChangeEvent),
) -> Result<ChangesResponse> {
    let since = if opts.descending { 0 } else { opts.since };
    let limit = opts.effective_limit();

    let columns = format!(
        "{ds}.json AS metadata, {ds}.max_seq AS max_seq, {bs}.json AS winning_doc, {bs}.rev AS winning_rev",
        ds = DOC_STORE,
        bs = BY_SEQ_STORE
    );
    let join = format!(
        "{ds}.id = {bs}.doc_id AND {ds}.winningseq = {bs}.seq",
        ds = DOC_STORE,
        bs = BY_SEQ_STORE
    );
    let mut criteria = vec![format!("{}.max_seq > ?", DOC_STORE)];
    let mut params = vec![SqlValue::from(since)];
    if let Some(ids) = &opts.doc_ids {
        if ids.is_empty() {
            return Ok(ChangesResponse {
                results: Vec::new(),
                last_seq: since,
            });
        }
        criteria.push(format!("{}.id IN {}", DOC_STORE, question_marks(ids.len())));
        params.extend(ids.iter().map(SqlValue::from));
    }
    let order = format!("{}.max_seq {}", DOC_STORE, if opts.descending { "DESC" } else { "ASC" });
    let mut sql = build_select(&columns, &[DOC_STORE, BY_SEQ_STORE], Some(&join), &criteria, Some(&order));
    if let (Some(limit), None) = (limit, &opts.filter) {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let rows = db.query(&sql, &params).await?;
    let mut results = Vec::new();
    let mut last_seq = since;
    let mut kept = 0usize;
    for row in rows {
        let metadata = DocMetadata::from_json(row.get_str("metadata")?)?;
        let seq = row.get_i64("max_seq")?;
        last_seq = seq;
        let event = build_event(db, opts, &metadata, seq, &row.get_string("winning_rev")?, row.get_str("winning_doc")?)
            .await?;

        let decision = match &opts.filter {
            Some(filter) => filter(&event),
            None => FilterDecision::Keep,
        };
        match decision {
            FilterDecision::Stop(reason) => {
                warn!("Change feed stopped by filter at seq {}: {}", seq, reason);
                return Err(Error::FeedStopped(reason));
            }
            FilterDecision::Skip => {}
            FilterDecision::Keep => {
                kept += 1;
                on_change(&event);
                if opts.return_docs {
                    results.push(event);
                }
            }
        }
        if Some(kept) == limit {
            break;
        }
    }
    Ok(ChangesResponse { results, last_seq })
}

async fn build_event(
    db: &dyn Executor,
    opts: &ChangesOptions,
    metadata: &DocMetadata,
    seq: i64,
    winning_rev: &str,
    winning_doc: &str,
) -> Result<ChangeEvent> {
    let rev: RevId = winning_rev.parse()?;
    let changes = match opts.style {
        Style::MainOnly => vec![ChangeRev { rev: rev.clone() }],
        Style::AllDocs => metadata
            .rev_tree
            .leaves()
            .into_iter()
            .map(|l| ChangeRev { rev: l.rev })
            .collect(),
    };
    let doc = if opts.include_docs {
        let mut doc = inflate(winning_doc, &metadata.id, &rev)?;
        if opts.conflicts {
            let conflicts = metadata.rev_tree.conflicts();
            if !conflicts.is_empty() {
                doc.insert(
                    "_conflicts".into(),
                    Value::Array(conflicts.iter().map(|r| Value::String(r.to_string())).collect()),
                );
            }
        }
        attachments::render(db, &mut doc, opts.attachments).await?;
        Some(Value::Object(doc))
    } else {
        None
    };
    Ok(ChangeEvent {
        seq,
        id: metadata.id.clone(),
        changes,
        deleted: metadata.deleted,
        doc,
    })
}

/// Cancels a continuous feed. Cloneable and idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    bus: Arc<ChangeBus>,
    id: String,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.bus.remove(&self.id);
        }
    }

    /// Cancelled explicitly or torn down with the store.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || !self.bus.contains(&self.id)
    }

    pub fn listener_id(&self) -> &str {
        &self.id
    }
}

/// Live change stream; ends on cancellation, limit, filter stop or error.
pub struct ContinuousChanges {
    rx: mpsc::Receiver<Result<ChangeEvent>>,
    handle: CancelHandle,
}

impl ContinuousChanges {
    pub(crate) fn start(db: Arc<dyn BackingStore>, bus: Arc<ChangeBus>, opts: ChangesOptions, capacity: usize) -> Self {
        let (id, notify) = bus.add();
        let handle = CancelHandle {
            bus,
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_feed(db, opts, notify, tx, handle.clone()));
        Self { rx, handle }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }
}

impl Stream for ContinuousChanges {
    type Item = Result<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ContinuousChanges {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

async fn run_feed(
    db: Arc<dyn BackingStore>,
    mut opts: ChangesOptions,
    notify: Arc<Notify>,
    tx: mpsc::Sender<Result<ChangeEvent>>,
    handle: CancelHandle,
) {
    opts.descending = false;
    opts.return_docs = true;
    let mut remaining = opts.effective_limit();
    debug!("Continuous change feed {} starting at seq {}", handle.listener_id(), opts.since);

    while !handle.is_cancelled() {
        let mut scan_opts = opts.clone();
        scan_opts.limit = remaining;
        let batch = match scan(db.as_executor(), &scan_opts, |_| {}).await {
            Ok(batch) => batch,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        };
        opts.since = batch.last_seq;
        for event in batch.results {
            if handle.is_cancelled() || tx.send(Ok(event)).await.is_err() {
                handle.cancel();
                return;
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
        }
        if remaining == Some(0) {
            break;
        }
        notify.notified().await;
    }
    handle.cancel();
    debug!("Continuous change feed {} finished", handle.listener_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::bulk_docs::bulk_docs;
    use crate::config::StoreConfig;
    use serde_json::json;

    #[test]
    fn test_default_options() {
        let opts = ChangesOptions::default();
        assert!(opts.return_docs);
        assert_eq!(opts.style, Style::MainOnly);
        assert_eq!(ChangesOptions { limit: Some(0), ..opts }.effective_limit(), Some(1));
    }

    #[tokio::test]
    async fn test_scan_empty_doc_ids() {
        let db = SqliteBackend::open_in_memory().unwrap();
        bulk_docs(&db, &StoreConfig::new("c"), vec![json!({"_id": "a"})], true)
            .await
            .unwrap();
        let opts = ChangesOptions {
            since: 0,
            doc_ids: Some(Vec::new()),
            ..ChangesOptions::default()
        };
        let res = scan(&db, &opts, |_| {}).await.unwrap();
        assert!(res.results.is_empty());
        assert_eq!(res.last_seq, 0);
    }

    #[test]
    fn test_event_serialization_skips_empty_fields() {
        let event = ChangeEvent {
            seq: 3,
            id: "a".into(),
            changes: vec![ChangeRev { rev: RevId::new(1, "x") }],
            deleted: false,
            doc: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"seq": 3, "id": "a", "changes": [{"rev": "1-x"}]})
        );
    }
}
