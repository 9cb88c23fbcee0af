//! SQLite-backed store using rusqlite
//!
//! One writer connection carries every transaction (`BEGIN IMMEDIATE`),
//! serialized by an async gate. File databases get a second connection for
//! reads so scans never wait on an open write transaction; in-memory
//! databases have a single connection and route reads through the gate.

use super::{BackingStore, ExecOutcome, Executor, Row, SqlValue, Transaction};
use crate::config::SqliteConfig;
use crate::error::{Error, Result};
use crate::schema::{self, ADAPTER_VERSION, META_STORE};
use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
    }
}

fn open_connection(config: &SqliteConfig, read_only: bool) -> Result<Connection> {
    let conn = match &config.path {
        Some(path) if read_only => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?,
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    if !read_only {
        conn.pragma_update_and_check(None, "journal_mode", &config.journal_mode, |_| Ok(()))?;
    }
    conn.pragma_update(None, "synchronous", &config.synchronous)?;
    conn.pragma_update(None, "cache_size", config.cache_size)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

fn bootstrap(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for sql in schema::create_tables().iter().chain(schema::create_indexes().iter()) {
        tx.execute(sql, [])?;
    }
    let version: Option<i64> = tx
        .query_row(&format!("SELECT db_version FROM {}", META_STORE), [], |r| r.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e),
        })?;
    match version {
        None => {
            let dbid = uuid::Uuid::new_v4().to_string();
            tx.execute(
                &format!("INSERT INTO {} (dbid, db_version) VALUES (?1, ?2)", META_STORE),
                rusqlite::params![dbid, ADAPTER_VERSION],
            )?;
            info!("Created document store schema (instance {})", dbid);
        }
        Some(v) if v < ADAPTER_VERSION => {
            tx.execute(
                &format!("UPDATE {} SET db_version = ?1", META_STORE),
                rusqlite::params![ADAPTER_VERSION],
            )?;
            info!("Bumped schema version from {} to {}", v, ADAPTER_VERSION);
        }
        Some(_) => {}
    }
    tx.commit()?;
    Ok(())
}

fn with_conn<T>(conn: &Mutex<Connection>, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let guard = conn
        .lock()
        .map_err(|_| Error::backing_store("Poisoned", "connection mutex poisoned"))?;
    f(&guard)
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut fields = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            fields.push((name.clone(), from_value_ref(row.get_ref(i)?)));
        }
        out.push(Row::new(fields));
    }
    Ok(out)
}

fn run_execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<ExecOutcome> {
    let mut stmt = conn.prepare_cached(sql)?;
    let changes = stmt.execute(params_from_iter(params.iter()))?;
    Ok(ExecOutcome {
        changes,
        last_insert_id: conn.last_insert_rowid(),
    })
}

/// SQLite implementation of [`BackingStore`]
pub struct SqliteBackend {
    writer: Arc<Mutex<Connection>>,
    reader: Option<Arc<Mutex<Connection>>>,
    gate: Arc<AsyncMutex<()>>,
    closed: AtomicBool,
}

impl SqliteBackend {
    /// Open (and bootstrap) a database as described by `config`.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let writer = open_connection(config, false)?;
        bootstrap(&writer)?;
        let reader = match config.path {
            Some(_) => Some(Arc::new(Mutex::new(open_connection(config, true)?))),
            None => None,
        };
        debug!(
            "Opened SQLite backend at {:?} (separate reader: {})",
            config.path,
            reader.is_some()
        );
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader,
            gate: Arc::new(AsyncMutex::new(())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(&SqliteConfig::in_memory())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::backing_store("DatabaseClosed", "database is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for SqliteBackend {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        match &self.reader {
            Some(reader) => with_conn(reader, |c| run_query(c, sql, params)),
            None => {
                let _gate = self.gate.lock().await;
                with_conn(&self.writer, |c| run_query(c, sql, params))
            }
        }
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecOutcome> {
        self.ensure_open()?;
        let _gate = self.gate.lock().await;
        with_conn(&self.writer, |c| run_execute(c, sql, params))
    }

    fn as_executor(&self) -> &dyn Executor {
        self
    }
}

#[async_trait]
impl BackingStore for SqliteBackend {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        let guard = self.gate.clone().lock_owned().await;
        with_conn(&self.writer, |c| Ok(c.execute_batch("BEGIN IMMEDIATE")?))?;
        Ok(Box::new(SqliteTransaction {
            conn: self.writer.clone(),
            _guard: guard,
            finished: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        // Wait for an in-flight transaction before refusing new work.
        let _gate = self.gate.lock().await;
        self.closed.store(true, Ordering::Release);
        debug!("Closed SQLite backend");
        Ok(())
    }
}

/// Write transaction on the writer connection
pub struct SqliteTransaction {
    conn: Arc<Mutex<Connection>>,
    _guard: OwnedMutexGuard<()>,
    finished: bool,
}

#[async_trait]
impl Executor for SqliteTransaction {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        with_conn(&self.conn, |c| run_query(c, sql, params))
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecOutcome> {
        with_conn(&self.conn, |c| run_execute(c, sql, params))
    }

    fn as_executor(&self) -> &dyn Executor {
        self
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        with_conn(&self.conn, |c| Ok(c.execute_batch("COMMIT")?))?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        with_conn(&self.conn, |c| Ok(c.execute_batch("ROLLBACK")?))
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let res = with_conn(&self.conn, |c| {
            if !c.is_autocommit() {
                c.execute_batch("ROLLBACK")?;
            }
            Ok(())
        });
        if let Err(e) = res {
            warn!("Rollback of abandoned transaction failed: {}", e);
        }
    }
}
