use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ErrorCode, ToSql, Transaction, TransactionBehavior, params_from_iter};
use strata_common::{Error, Result};
use strata_config::DatabaseConfig;
use tracing::{debug, info};

use crate::driver::{Driver, ScriptError, SessionLock, SqlSession, SqlValue, UnitOfWork};

/// VM instructions between progress-handler checks of the step deadline.
const PROGRESS_OPS: i32 = 1_000;

const MEMORY_PATH: &str = ":memory:";

/// SQLite implementation of the driver capability.
pub struct SqliteDriver {
    conn: Connection,
    /// `None` for an in-memory database.
    path: Option<PathBuf>,
}

impl SqliteDriver {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if config.path == MEMORY_PATH {
            Self::in_memory()
        } else {
            Self::open_path(Path::new(&config.path), config.busy_timeout())
        }
    }

    pub fn open_path(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!("opening sqlite database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn,
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self { conn, path: None })
    }
}

impl SqlSession for SqliteDriver {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        execute_on(&self.conn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        query_on(&self.conn, sql, params)
    }

    fn table_exists(&mut self, name: &str) -> Result<bool> {
        table_exists_on(&self.conn, name)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn begin(&mut self) -> Result<Box<dyn UnitOfWork + '_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to start transaction: {e}")))?;
        Ok(Box::new(SqliteUnitOfWork { tx }))
    }

    fn try_lock(&self, key: &str) -> Result<Option<Box<dyn SessionLock>>> {
        // Nothing outside this connection can reach an in-memory database.
        let Some(db_path) = &self.path else {
            return Ok(Some(Box::new(PrivateLock)));
        };

        let lock_path = lock_file_path(db_path, key);
        let conn = Connection::open(&lock_path)
            .map_err(|e| Error::Database(format!("failed to open lock database: {e}")))?;
        conn.busy_timeout(Duration::ZERO)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        match conn.execute_batch("BEGIN EXCLUSIVE") {
            Ok(()) => {
                debug!("acquired sqlite session lock {}", lock_path.display());
                Ok(Some(Box::new(SqliteSessionLock { conn, lock_path })))
            }
            Err(e) if is_busy(&e) => Ok(None),
            Err(e) => Err(Error::Database(format!("failed to take lock: {e}"))),
        }
    }
}

/// `<db>.<key>.lock`, with the key reduced to filename-safe characters.
fn lock_file_path(db_path: &Path, key: &str) -> PathBuf {
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let mut name = OsString::from(db_path.as_os_str());
    name.push(format!(".{key}.lock"));
    PathBuf::from(name)
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}

/// An exclusive transaction on the sidecar lock database. Closing the
/// connection, including through process exit, ends it.
struct SqliteSessionLock {
    conn: Connection,
    lock_path: PathBuf,
}

impl SessionLock for SqliteSessionLock {
    fn release(self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Error::Database(format!("failed to release lock: {e}")))?;
        debug!("released sqlite session lock {}", self.lock_path.display());
        Ok(())
    }
}

struct PrivateLock;

impl SessionLock for PrivateLock {
    fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct SqliteUnitOfWork<'c> {
    tx: Transaction<'c>,
}

impl SqlSession for SqliteUnitOfWork<'_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        execute_on(&self.tx, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        query_on(&self.tx, sql, params)
    }

    fn table_exists(&mut self, name: &str) -> Result<bool> {
        table_exists_on(&self.tx, name)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn run_script(
        &mut self,
        script: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), ScriptError> {
        let interrupted = Arc::new(AtomicBool::new(false));
        if let Some(limit) = timeout {
            let deadline = Instant::now() + limit;
            let flag = Arc::clone(&interrupted);
            self.tx.progress_handler(
                PROGRESS_OPS,
                Some(move || {
                    let expired = Instant::now() >= deadline;
                    if expired {
                        flag.store(true, Ordering::SeqCst);
                    }
                    expired
                }),
            );
        }

        let result = self.tx.execute_batch(script);

        if timeout.is_some() {
            self.tx.progress_handler(0, None::<fn() -> bool>);
        }

        match result {
            Ok(()) => Ok(()),
            Err(_) if interrupted.load(Ordering::SeqCst) => Err(ScriptError::TimedOut),
            Err(e) => Err(ScriptError::Failed(e.to_string())),
        }
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .map_err(|e| Error::Database(format!("failed to commit: {e}")))
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        // An interrupted statement may already have rolled the transaction back.
        if self.tx.is_autocommit() {
            return Ok(());
        }
        self.tx
            .rollback()
            .map_err(|e| Error::Database(format!("failed to roll back: {e}")))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Text(v.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn execute_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<usize> {
    conn.execute(sql, params_from_iter(params.iter()))
        .map_err(|e| Error::Database(format!("failed to execute statement: {e}")))
}

fn query_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
    let columns = stmt.column_count();

    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            (0..columns)
                .map(|i| row.get_ref(i).map(from_value_ref))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(|e| Error::Database(format!("failed to run query: {e}")))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?);
    }
    Ok(out)
}

fn table_exists_on(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to inspect schema: {e}")))
}
