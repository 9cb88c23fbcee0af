//! SQL text helpers
//!
//! Keeps the joins between the document and revision stores in one place.

use crate::schema::{BY_SEQ_STORE, DOC_STORE};

/// Columns selected whenever a document row is joined with a revision body.
pub fn select_docs() -> String {
    format!(
        "{bs}.json AS data, {bs}.deleted AS deleted, {bs}.rev AS rev, {bs}.seq AS seq, {ds}.json AS metadata",
        bs = BY_SEQ_STORE,
        ds = DOC_STORE
    )
}

/// Join condition selecting each document's winning revision.
pub fn winning_joiner() -> String {
    format!("{}.seq = {}.winningseq", BY_SEQ_STORE, DOC_STORE)
}

/// Join condition selecting every stored revision of a document.
pub fn doc_id_joiner() -> String {
    format!("{}.id = {}.doc_id", DOC_STORE, BY_SEQ_STORE)
}

/// `(?,?,?)` with `count` placeholders.
pub fn question_marks(count: usize) -> String {
    format!("({})", vec!["?"; count].join(","))
}

/// Assemble a `SELECT` with optional join, `WHERE` conjunction and ordering.
pub fn build_select(
    columns: &str,
    tables: &[&str],
    join_on: Option<&str>,
    conditions: &[String],
    order_by: Option<&str>,
) -> String {
    let mut sql = format!("SELECT {} FROM {}", columns, tables.join(" JOIN "));
    if let Some(on) = join_on {
        sql.push_str(" ON ");
        sql.push_str(on);
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if let Some(order) = order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
    }
    sql
}
