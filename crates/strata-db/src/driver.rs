//! Database capabilities the migration engine depends on.
//!
//! The engine never talks to a concrete database. It needs three things:
//! statements (optionally inside a unit of work), a session-scoped
//! exclusive lock, and enough dialect knowledge to keep its ledger.

use std::time::Duration;

use strata_common::Result;
use strata_config::{DatabaseConfig, DriverKind};

use crate::sqlite::SqliteDriver;

/// A bound parameter or a column value read back from a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
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

/// Why a migration script did not run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    Failed(String),
    TimedOut,
}

/// Statement execution shared by a plain session and a unit of work.
pub trait SqlSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;

    fn table_exists(&mut self, name: &str) -> Result<bool>;

    /// Positional parameter marker for this dialect, 1-based.
    fn placeholder(&self, index: usize) -> String;
}

/// A transaction: everything executed through it commits or none of it does.
pub trait UnitOfWork: SqlSession {
    /// Run a multi-statement migration script, aborting it once `timeout`
    /// has elapsed.
    fn run_script(
        &mut self,
        script: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), ScriptError>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// An exclusive reservation held by a database session. The database drops
/// it when the session ends, so a crashed holder never blocks others.
pub trait SessionLock: Send {
    fn release(self: Box<Self>) -> Result<()>;
}

/// One conforming implementation exists per supported engine.
pub trait Driver: SqlSession {
    fn name(&self) -> &'static str;

    fn begin(&mut self) -> Result<Box<dyn UnitOfWork + '_>>;

    /// Attempt the lock for `key` once. `Ok(None)` means another session
    /// holds it.
    fn try_lock(&self, key: &str) -> Result<Option<Box<dyn SessionLock>>>;
}

/// Open the driver selected by configuration.
pub fn connect(config: &DatabaseConfig) -> Result<Box<dyn Driver>> {
    match config.driver {
        DriverKind::Sqlite => Ok(Box::new(SqliteDriver::open(config)?)),
    }
}
