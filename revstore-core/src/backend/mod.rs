//! Backing store abstraction
//!
//! The core talks to the relational store only through these traits:
//! parameterized reads, single mutating statements, and transactions that
//! group both into one atomic unit.

use crate::error::{Error, Result};
use async_trait::async_trait;

pub mod sqlite;

pub use sqlite::SqliteBackend;

/// A bound parameter or a column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Build a `Vec<SqlValue>` from heterogeneous expressions.
#[macro_export]
macro_rules! sql_params {
    () => { Vec::<$crate::backend::SqlValue>::new() };
    ($($v:expr),+ $(,)?) => {
        vec![$($crate::backend::SqlValue::from($v)),+]
    };
}

/// One result row as an ordered field map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new(fields: Vec<(String, SqlValue)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    fn require(&self, name: &str) -> Result<&SqlValue> {
        self.get(name)
            .ok_or_else(|| Error::backing_store("InvalidColumnName", format!("no column {:?}", name)))
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            SqlValue::Integer(v) => Ok(*v),
            SqlValue::Real(v) => Ok(*v as i64),
            other => Err(type_error(name, "integer", other)),
        }
    }

    pub fn get_opt_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.require(name)? {
            SqlValue::Null => Ok(None),
            _ => self.get_i64(name).map(Some),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        Ok(self.get_i64(name)? != 0)
    }

    pub fn get_str(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            SqlValue::Text(v) => Ok(v.as_str()),
            other => Err(type_error(name, "text", other)),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        self.get_str(name).map(str::to_string)
    }

    pub fn get_blob(&self, name: &str) -> Result<Vec<u8>> {
        match self.require(name)? {
            SqlValue::Blob(v) => Ok(v.clone()),
            SqlValue::Text(v) => Ok(v.clone().into_bytes()),
            other => Err(type_error(name, "blob", other)),
        }
    }
}

fn type_error(name: &str, expected: &str, got: &SqlValue) -> Error {
    Error::backing_store(
        "InvalidColumnType",
        format!("column {:?}: expected {}, got {:?}", name, expected, got),
    )
}

/// Outcome of a mutating statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub changes: usize,
    pub last_insert_id: i64,
}

/// Runs statements against the store
#[async_trait]
pub trait Executor: Send + Sync {
    /// Read-only parameterized statement.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Single mutating statement.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecOutcome>;

    fn as_executor(&self) -> &dyn Executor;
}

/// An open transaction; dropping it without commit rolls back.
#[async_trait]
pub trait Transaction: Executor {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The storage engine the document store runs on
#[async_trait]
pub trait BackingStore: Executor {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Release connections. Further calls fail.
    async fn close(&self) -> Result<()>;
}
