//! RevStore Core Library
//!
//! Versioned document storage with multi-version concurrency control:
//! - Revision identifiers and revision trees with deterministic winners
//! - Atomic bulk writes with conflict detection and replication mode
//! - Content-addressed attachments with orphan collection
//! - One-shot and continuous change feeds
//! - Compaction of superseded revisions
//! - Local (non-versioned) documents
//! - SQLite backing store using rusqlite (WAL mode)

pub mod error;
pub mod config;
pub mod revision;
pub mod rev_tree;
pub mod document;
pub mod backend;
pub mod schema;
pub mod query;
pub mod attachments;
pub mod bulk_docs;
pub mod changes;
pub mod notify;
pub mod compaction;
pub mod local;
pub mod store;

pub use error::{Error, ErrorKind, Result};
pub use config::{SqliteConfig, StoreConfig};
pub use revision::RevId;
pub use rev_tree::{Leaf, MergeOutcome, RevStatus, RevTree};
pub use document::{Attachment, DocMetadata, Document};
pub use backend::{BackingStore, Executor, Row, SqlValue, SqliteBackend, Transaction};
pub use bulk_docs::WriteOutcome;
pub use changes::{
    CancelHandle, ChangeEvent, ChangeFilter, ChangeRev, ChangesOptions, ChangesResponse,
    ContinuousChanges, FilterDecision, Style,
};
pub use notify::ChangeBus;
pub use store::{AllDocsOptions, AllDocsResponse, AllDocsRow, DbInfo, DocStore, GetOptions, RowValue};
