//! Document store
//!
//! [`DocStore`] ties the pieces together: writes go through the bulk
//! write coordinator and wake the store's change bus after commit; reads
//! query the backing store directly.

use crate::attachments;
use crate::backend::{BackingStore, Executor, Row, SqlValue, SqliteBackend};
use crate::bulk_docs::{self, WriteOutcome};
use crate::changes::{self, ChangeEvent, ChangesOptions, ChangesResponse, ContinuousChanges};
use crate::compaction;
use crate::config::{SqliteConfig, StoreConfig};
use crate::document::{inflate, is_local_id, DocMetadata};
use crate::error::{Error, Result};
use crate::local;
use crate::notify::ChangeBus;
use crate::query::{build_select, doc_id_joiner, question_marks, select_docs, winning_joiner};
use crate::rev_tree::RevTree;
use crate::revision::RevId;
use crate::schema::{self, BY_SEQ_STORE, DOC_STORE, META_STORE};
use crate::sql_params;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Maximum number of bound parameters per `IN (...)` lookup.
const KEY_CHUNK: usize = 999;

/// Options for [`DocStore::get`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Read this revision instead of the winner (deleted revisions included).
    pub rev: Option<RevId>,
    /// Resolve `rev` to the leaf that descends from it.
    pub latest: bool,
    pub conflicts: bool,
    pub revs: bool,
    /// Inline attachment bodies instead of stubs.
    pub attachments: bool,
}

impl GetOptions {
    pub fn rev(rev: RevId) -> Self {
        Self {
            rev: Some(rev),
            ..Self::default()
        }
    }
}

/// Options for [`DocStore::all_docs`]
#[derive(Debug, Clone)]
pub struct AllDocsOptions {
    pub key: Option<String>,
    pub keys: Option<Vec<String>>,
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub inclusive_end: bool,
    pub descending: bool,
    pub limit: Option<usize>,
    pub skip: usize,
    pub include_docs: bool,
    pub conflicts: bool,
    pub attachments: bool,
    pub update_seq: bool,
}

impl Default for AllDocsOptions {
    fn default() -> Self {
        Self {
            key: None,
            keys: None,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            descending: false,
            limit: None,
            skip: 0,
            include_docs: false,
            conflicts: false,
            attachments: false,
            update_seq: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowValue {
    pub rev: RevId,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllDocsRow {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<RowValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AllDocsRow {
    fn not_found(key: &str) -> Self {
        Self {
            key: key.to_string(),
            id: None,
            value: None,
            doc: None,
            error: Some("not_found".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllDocsResponse {
    pub total_rows: u64,
    pub offset: usize,
    pub rows: Vec<AllDocsRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: i64,
}

struct Inner {
    backend: Arc<dyn BackingStore>,
    config: StoreConfig,
    bus: Arc<ChangeBus>,
}

/// Handle to one document store. Clones share the same store.
#[derive(Clone)]
pub struct DocStore {
    inner: Arc<Inner>,
}

impl DocStore {
    /// Wrap an already bootstrapped backing store.
    pub fn open(backend: Arc<dyn BackingStore>, config: StoreConfig) -> Self {
        let bus = Arc::new(ChangeBus::new(config.name.clone()));
        info!("Opened document store {}", config.name);
        Self {
            inner: Arc::new(Inner { backend, config, bus }),
        }
    }

    /// Open a SQLite-backed store.
    pub fn open_sqlite(sqlite: &SqliteConfig, config: StoreConfig) -> Result<Self> {
        let backend = SqliteBackend::open(sqlite)?;
        Ok(Self::open(Arc::new(backend), config))
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn change_bus(&self) -> &Arc<ChangeBus> {
        &self.inner.bus
    }

    fn db(&self) -> &dyn BackingStore {
        self.inner.backend.as_ref()
    }

    pub async fn info(&self) -> Result<DbInfo> {
        Ok(DbInfo {
            db_name: self.name().to_string(),
            doc_count: self.count_docs().await?,
            update_seq: self.update_seq().await?,
        })
    }

    /// Unique id written when the store was first created.
    pub async fn instance_id(&self) -> Result<String> {
        let rows = self.db().query(&format!("SELECT dbid FROM {}", META_STORE), &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::backing_store("MissingMetadata", "metadata row not found"))?;
        row.get_string("dbid")
    }

    async fn count_docs(&self) -> Result<u64> {
        let sql = build_select(
            &format!("COUNT({}.id) AS num", DOC_STORE),
            &[DOC_STORE, BY_SEQ_STORE],
            Some(&winning_joiner()),
            &[format!("{}.deleted = 0", BY_SEQ_STORE)],
            None,
        );
        let rows = self.db().query(&sql, &[]).await?;
        Ok(rows.first().map(|r| r.get_i64("num")).transpose()?.unwrap_or(0) as u64)
    }

    async fn update_seq(&self) -> Result<i64> {
        let rows = self
            .db()
            .query(&format!("SELECT MAX(max_seq) AS seq FROM {}", DOC_STORE), &[])
            .await?;
        match rows.first() {
            Some(row) => Ok(row.get_opt_i64("seq")?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Write a batch of documents atomically.
    pub async fn bulk_docs(&self, docs: Vec<Value>, new_edits: bool) -> Result<Vec<WriteOutcome>> {
        let results = bulk_docs::bulk_docs(self.db(), &self.inner.config, docs, new_edits).await?;
        self.inner.bus.notify();
        Ok(results)
    }

    /// Write one document with new edits; a conflict becomes an error.
    pub async fn put(&self, doc: Value) -> Result<(String, String)> {
        let mut results = self.bulk_docs(vec![doc], true).await?;
        match results.pop() {
            Some(outcome) => outcome.into_result(),
            None => Err(Error::MalformedDocument("empty write".into())),
        }
    }

    /// Read a document, by default its winning revision.
    pub async fn get(&self, id: &str, opts: GetOptions) -> Result<Value> {
        if is_local_id(id) {
            return Ok(Value::Object(self.get_local(id).await?));
        }
        let rev = match (&opts.rev, opts.latest) {
            (Some(rev), true) => {
                let tree = self.get_revision_tree(id).await?;
                Some(tree.latest(rev).ok_or_else(|| Error::MissingDocument(id.to_string()))?)
            }
            (rev, _) => rev.clone(),
        };

        let (sql, params) = match &rev {
            None => (
                build_select(
                    &select_docs(),
                    &[DOC_STORE, BY_SEQ_STORE],
                    Some(&winning_joiner()),
                    &[format!("{}.id=?", DOC_STORE)],
                    None,
                ),
                sql_params![id],
            ),
            Some(rev) => (
                build_select(
                    &select_docs(),
                    &[DOC_STORE, BY_SEQ_STORE],
                    Some(&doc_id_joiner()),
                    &[format!("{}.doc_id=?", BY_SEQ_STORE), format!("{}.rev=?", BY_SEQ_STORE)],
                    None,
                ),
                sql_params![id, rev.to_string()],
            ),
        };
        let rows = self.db().query(&sql, &params).await?;
        let row = rows.first().ok_or_else(|| Error::MissingDocument(id.to_string()))?;
        if row.get_bool("deleted")? && rev.is_none() {
            return Err(Error::DocumentDeleted(id.to_string()));
        }
        let metadata = DocMetadata::from_json(row.get_str("metadata")?)?;
        let rev: RevId = row.get_str("rev")?.parse()?;
        let mut doc = inflate(row.get_str("data")?, &metadata.id, &rev)?;

        if opts.conflicts {
            insert_conflicts(&mut doc, &metadata);
        }
        if opts.revs {
            let ids = metadata.rev_tree.ancestry(&rev).unwrap_or_else(|| vec![rev.hash.clone()]);
            doc.insert("_revisions".into(), serde_json::json!({ "start": rev.generation, "ids": ids }));
        }
        attachments::render(self.db().as_executor(), &mut doc, opts.attachments).await?;
        Ok(Value::Object(doc))
    }

    /// Primary-key scan over winning revisions.
    pub async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        let total_rows = self.count_docs().await?;
        let update_seq = if opts.update_seq { Some(self.update_seq().await?) } else { None };
        let rows = match &opts.keys {
            Some(keys) => self.all_docs_by_keys(keys, &opts).await?,
            None if opts.limit == Some(0) => Vec::new(),
            None => self.all_docs_range(&opts).await?,
        };
        Ok(AllDocsResponse {
            total_rows,
            offset: opts.skip,
            rows,
            update_seq,
        })
    }

    async fn all_docs_range(&self, opts: &AllDocsOptions) -> Result<Vec<AllDocsRow>> {
        let mut criteria = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(key) = &opts.key {
            criteria.push(format!("{}.id = ?", DOC_STORE));
            params.push(key.into());
        } else {
            if let Some(start) = &opts.start_key {
                criteria.push(format!("{}.id {} ?", DOC_STORE, if opts.descending { "<=" } else { ">=" }));
                params.push(start.into());
            }
            if let Some(end) = &opts.end_key {
                let cmp = match (opts.descending, opts.inclusive_end) {
                    (false, true) => "<=",
                    (false, false) => "<",
                    (true, true) => ">=",
                    (true, false) => ">",
                };
                criteria.push(format!("{}.id {} ?", DOC_STORE, cmp));
                params.push(end.into());
            }
        }
        criteria.push(format!("{}.deleted = 0", BY_SEQ_STORE));
        let order = format!("{}.id {}", DOC_STORE, if opts.descending { "DESC" } else { "ASC" });
        let mut sql = build_select(
            &select_docs(),
            &[DOC_STORE, BY_SEQ_STORE],
            Some(&winning_joiner()),
            &criteria,
            Some(&order),
        );
        let limit = opts.limit.map(|l| l as i64).unwrap_or(-1);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, opts.skip));

        let mut out = Vec::new();
        for row in self.db().query(&sql, &params).await? {
            out.push(self.all_docs_row(&row, opts).await?);
        }
        Ok(out)
    }

    async fn all_docs_by_keys(&self, keys: &[String], opts: &AllDocsOptions) -> Result<Vec<AllDocsRow>> {
        let mut distinct: Vec<&String> = Vec::new();
        for key in keys {
            if !distinct.contains(&key) {
                distinct.push(key);
            }
        }
        let mut found: HashMap<String, AllDocsRow> = HashMap::new();
        for chunk in distinct.chunks(KEY_CHUNK) {
            let sql = build_select(
                &select_docs(),
                &[DOC_STORE, BY_SEQ_STORE],
                Some(&winning_joiner()),
                &[format!("{}.id IN {}", DOC_STORE, question_marks(chunk.len()))],
                None,
            );
            let params: Vec<SqlValue> = chunk.iter().map(|k| SqlValue::from(*k)).collect();
            for row in self.db().query(&sql, &params).await? {
                let entry = self.all_docs_row(&row, opts).await?;
                found.insert(entry.key.clone(), entry);
            }
        }
        let mut rows: Vec<AllDocsRow> = keys
            .iter()
            .map(|k| found.get(k).cloned().unwrap_or_else(|| AllDocsRow::not_found(k)))
            .collect();
        if opts.descending {
            rows.reverse();
        }
        let limit = opts.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(opts.skip).take(limit).collect())
    }

    async fn all_docs_row(&self, row: &Row, opts: &AllDocsOptions) -> Result<AllDocsRow> {
        let metadata = DocMetadata::from_json(row.get_str("metadata")?)?;
        let rev: RevId = row.get_str("rev")?.parse()?;
        let deleted = row.get_bool("deleted")?;
        let doc = if opts.include_docs && !deleted {
            let mut doc = inflate(row.get_str("data")?, &metadata.id, &rev)?;
            if opts.conflicts {
                insert_conflicts(&mut doc, &metadata);
            }
            attachments::render(self.db().as_executor(), &mut doc, opts.attachments).await?;
            Some(Value::Object(doc))
        } else if opts.include_docs {
            Some(Value::Null)
        } else {
            None
        };
        Ok(AllDocsRow {
            key: metadata.id.clone(),
            id: Some(metadata.id),
            value: Some(RowValue { rev, deleted }),
            doc,
            error: None,
        })
    }

    /// One-shot change feed.
    pub async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        changes::scan(self.db().as_executor(), &opts, |_| {}).await
    }

    /// One-shot change feed that hands each kept change to `on_change`.
    pub async fn changes_with(
        &self,
        opts: ChangesOptions,
        on_change: impl FnMut(&ChangeEvent),
    ) -> Result<ChangesResponse> {
        changes::scan(self.db().as_executor(), &opts, on_change).await
    }

    /// Live change feed; must be called within a tokio runtime.
    pub fn changes_continuous(&self, opts: ChangesOptions) -> ContinuousChanges {
        ContinuousChanges::start(
            self.inner.backend.clone(),
            self.inner.bus.clone(),
            opts,
            self.inner.config.changes_channel_capacity,
        )
    }

    /// Attachment body by name, from the winner or a given revision.
    pub async fn get_attachment(&self, doc_id: &str, name: &str, rev: Option<RevId>) -> Result<Bytes> {
        let opts = GetOptions {
            rev,
            ..GetOptions::default()
        };
        let doc = self.get(doc_id, opts).await?;
        let digest = doc
            .get("_attachments")
            .and_then(|atts| atts.get(name))
            .and_then(|att| att.get("digest"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MissingDocument(format!("{}/{}", doc_id, name)))?;
        attachments::get(self.db().as_executor(), digest).await
    }

    pub async fn attachment_by_digest(&self, digest: &str) -> Result<Bytes> {
        attachments::get(self.db().as_executor(), digest).await
    }

    pub async fn get_revision_tree(&self, id: &str) -> Result<RevTree> {
        Ok(self.metadata(id).await?.rev_tree)
    }

    async fn metadata(&self, id: &str) -> Result<DocMetadata> {
        let rows = self
            .db()
            .query(&format!("SELECT json FROM {} WHERE id = ?", DOC_STORE), &sql_params![id])
            .await?;
        let row = rows.first().ok_or_else(|| Error::MissingDocument(id.to_string()))?;
        DocMetadata::from_json(row.get_str("json")?)
    }

    /// Revisions from `request` that the store does not know, per document.
    pub async fn revs_diff(&self, request: &BTreeMap<String, Vec<RevId>>) -> Result<BTreeMap<String, Vec<RevId>>> {
        let mut out = BTreeMap::new();
        for (id, revs) in request {
            let missing: Vec<RevId> = match self.metadata(id).await {
                Ok(meta) => revs.iter().filter(|r| !meta.rev_tree.contains(r)).cloned().collect(),
                Err(Error::MissingDocument(_)) => revs.clone(),
                Err(e) => return Err(e),
            };
            if !missing.is_empty() {
                out.insert(id.clone(), missing);
            }
        }
        Ok(out)
    }

    /// Purge specific revisions of one document.
    pub async fn do_compaction(&self, id: &str, revs: &[RevId]) -> Result<Vec<RevId>> {
        compaction::do_compaction(self.db(), id, revs).await
    }

    pub async fn compact_document(&self, id: &str) -> Result<Vec<RevId>> {
        compaction::compact_document(self.db(), id).await
    }

    pub async fn compact(&self) -> Result<usize> {
        compaction::compact(self.db()).await
    }

    pub async fn get_local(&self, id: &str) -> Result<Map<String, Value>> {
        local::get_local(self.db().as_executor(), id).await
    }

    /// Write a local document; `_rev` must match the stored counter.
    pub async fn put_local(&self, doc: Value) -> Result<String> {
        let (id, rev, body) = local::split(doc)?;
        local::put_local(self.db().as_executor(), &id, rev.as_deref(), &body).await
    }

    pub async fn remove_local(&self, id: &str, rev: &str) -> Result<String> {
        local::remove_local(self.db().as_executor(), id, rev).await
    }

    /// Cancel every continuous feed and release the backing store.
    pub async fn close(&self) -> Result<()> {
        self.inner.bus.remove_all();
        self.db().close().await?;
        info!("Closed document store {}", self.name());
        Ok(())
    }

    /// Drop every table, then close.
    pub async fn destroy(&self) -> Result<()> {
        self.inner.bus.remove_all();
        let tx = self.db().begin().await?;
        let mut dropped = Ok(());
        for sql in schema::drop_tables() {
            let res = tx.execute(&sql, &[]).await;
            if let Err(e) = res {
                dropped = Err(e);
                break;
            }
        }
        if let Err(e) = dropped {
            if let Err(rb) = tx.rollback().await {
                warn!("Rollback after failed destroy also failed: {}", rb);
            }
            return Err(e);
        }
        tx.commit().await?;
        info!("Destroyed document store {}", self.name());
        self.db().close().await
    }
}

fn insert_conflicts(doc: &mut Map<String, Value>, metadata: &DocMetadata) {
    let conflicts = metadata.rev_tree.conflicts();
    if !conflicts.is_empty() {
        doc.insert(
            "_conflicts".into(),
            Value::Array(conflicts.iter().map(|r| Value::String(r.to_string())).collect()),
        );
    }
}
