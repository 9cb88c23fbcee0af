//! Relational layout shared by every module that builds SQL.
//!
//! Store names contain dashes, so they are kept pre-quoted.

/// Schema version written to the metadata store.
pub const ADAPTER_VERSION: i64 = 7;

/// Document metadata, revision tree and winning-sequence pointer.
pub const DOC_STORE: &str = "\"document-store\"";
/// One row per revision body, keyed by the global sequence.
pub const BY_SEQ_STORE: &str = "\"by-sequence\"";
/// Content-addressed attachment bodies.
pub const ATTACH_STORE: &str = "\"attach-store\"";
/// Many-to-many digest <-> sequence references.
pub const ATTACH_AND_SEQ_STORE: &str = "\"attach-seq-store\"";
/// Non-versioned local documents.
pub const LOCAL_STORE: &str = "\"local-store\"";
/// Instance id and schema version.
pub const META_STORE: &str = "\"metadata-store\"";

/// Table DDL, in creation order.
pub fn create_tables() -> Vec<String> {
    vec![
        format!("CREATE TABLE IF NOT EXISTS {} (dbid, db_version INTEGER)", META_STORE),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (digest UNIQUE, escaped TINYINT(1), body BLOB)",
            ATTACH_STORE
        ),
        format!("CREATE TABLE IF NOT EXISTS {} (digest, seq INTEGER)", ATTACH_AND_SEQ_STORE),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id UNIQUE, json, winningseq, max_seq INTEGER UNIQUE)",
            DOC_STORE
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (seq INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT, \
             json, deleted TINYINT(1), doc_id, rev)",
            BY_SEQ_STORE
        ),
        format!("CREATE TABLE IF NOT EXISTS {} (id UNIQUE, rev, json)", LOCAL_STORE),
    ]
}

/// Index DDL backing the primary-key, range and sequence scans.
pub fn create_indexes() -> Vec<String> {
    vec![
        format!(
            "CREATE INDEX IF NOT EXISTS \"by-seq-deleted-idx\" ON {} (seq, deleted)",
            BY_SEQ_STORE
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"by-seq-doc-id-rev\" ON {} (doc_id, rev)",
            BY_SEQ_STORE
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"doc-winningseq-idx\" ON {} (winningseq)",
            DOC_STORE
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"attach-seq-seq-idx\" ON {} (seq)",
            ATTACH_AND_SEQ_STORE
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS \"attach-seq-digest-idx\" ON {} (digest, seq)",
            ATTACH_AND_SEQ_STORE
        ),
    ]
}

/// Statements that remove every table.
pub fn drop_tables() -> Vec<String> {
    [DOC_STORE, BY_SEQ_STORE, ATTACH_STORE, ATTACH_AND_SEQ_STORE, LOCAL_STORE, META_STORE]
        .iter()
        .map(|t| format!("DROP TABLE IF EXISTS {}", t))
        .collect()
}
