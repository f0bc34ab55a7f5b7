use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};
use tracing::debug;

use crate::driver::{SqlSession, SqlValue};

/// The version a database is at: the highest applied migration, or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchemaVersion {
    Unversioned,
    At(u32),
}

impl SchemaVersion {
    /// Numeric form, with 0 standing for `Unversioned`.
    pub fn as_u32(&self) -> u32 {
        match self {
            SchemaVersion::Unversioned => 0,
            SchemaVersion::At(v) => *v,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::Unversioned => f.write_str("unversioned"),
            SchemaVersion::At(v) => write!(f, "{v}"),
        }
    }
}

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: u32,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// A step that failed during a real run and may have left partial effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub version: u32,
    pub attempted_at: DateTime<Utc>,
    pub error: String,
}

/// The applied-version table inside the target database.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
    attempts_table: String,
}

impl Ledger {
    /// `table` must be a plain identifier; config validation enforces that.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        let attempts_table = format!("{table}_attempts");
        Self {
            table,
            attempts_table,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger tables if they are absent.
    pub fn bootstrap<S: SqlSession + ?Sized>(&self, session: &mut S) -> Result<()> {
        let ddl = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    version BIGINT PRIMARY KEY,
                    applied_at TEXT NOT NULL,
                    checksum TEXT NOT NULL
                )",
                self.table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    version BIGINT PRIMARY KEY,
                    attempted_at TEXT NOT NULL,
                    error TEXT NOT NULL
                )",
                self.attempts_table
            ),
        ];
        for sql in &ddl {
            session
                .execute(sql, &[])
                .map_err(|e| Error::LedgerWrite(format!("failed to bootstrap {}: {e}", self.table)))?;
        }
        debug!("ledger table {} ready", self.table);
        Ok(())
    }

    /// Applied migrations, ascending. An absent table reads as empty.
    pub fn entries<S: SqlSession + ?Sized>(&self, session: &mut S) -> Result<Vec<LedgerEntry>> {
        if !session.table_exists(&self.table)? {
            return Ok(Vec::new());
        }

        let rows = session.query(
            &format!(
                "SELECT version, applied_at, checksum FROM {} ORDER BY version ASC",
                self.table
            ),
            &[],
        )?;

        rows.iter()
            .map(|row| -> Result<LedgerEntry> {
                Ok(LedgerEntry {
                    version: version_column(row, 0)?,
                    applied_at: datetime_column(row, 1)?,
                    checksum: text_column(row, 2)?,
                })
            })
            .collect()
    }

    pub fn current_version<S: SqlSession + ?Sized>(&self, session: &mut S) -> Result<SchemaVersion> {
        Ok(self
            .entries(session)?
            .last()
            .map_or(SchemaVersion::Unversioned, |e| SchemaVersion::At(e.version)))
    }

    pub fn is_applied<S: SqlSession + ?Sized>(&self, session: &mut S, version: u32) -> Result<bool> {
        if !session.table_exists(&self.table)? {
            return Ok(false);
        }
        let sql = format!(
            "SELECT 1 FROM {} WHERE version = {}",
            self.table,
            session.placeholder(1)
        );
        let rows = session.query(&sql, &[version.into()])?;
        Ok(!rows.is_empty())
    }

    /// Mark `version` applied. Must run in the unit of work of the step.
    pub fn record<S: SqlSession + ?Sized>(
        &self,
        session: &mut S,
        version: u32,
        checksum: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (version, applied_at, checksum) VALUES ({}, {}, {})",
            self.table,
            session.placeholder(1),
            session.placeholder(2),
            session.placeholder(3)
        );
        session
            .execute(
                &sql,
                &[version.into(), Utc::now().to_rfc3339().into(), checksum.into()],
            )
            .map_err(|e| Error::LedgerWrite(format!("failed to record version {version}: {e}")))?;
        self.clear_failure(session, version)
    }

    /// Forget `version`. Must run in the unit of work of the step.
    pub fn remove<S: SqlSession + ?Sized>(&self, session: &mut S, version: u32) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE version = {}",
            self.table,
            session.placeholder(1)
        );
        let removed = session
            .execute(&sql, &[version.into()])
            .map_err(|e| Error::LedgerWrite(format!("failed to remove version {version}: {e}")))?;
        if removed == 0 {
            return Err(Error::LedgerWrite(format!(
                "version {version} is not recorded in {}",
                self.table
            )));
        }
        Ok(())
    }

    pub fn failed_attempts<S: SqlSession + ?Sized>(
        &self,
        session: &mut S,
    ) -> Result<Vec<FailedAttempt>> {
        if !session.table_exists(&self.attempts_table)? {
            return Ok(Vec::new());
        }

        let rows = session.query(
            &format!(
                "SELECT version, attempted_at, error FROM {} ORDER BY version ASC",
                self.attempts_table
            ),
            &[],
        )?;

        rows.iter()
            .map(|row| -> Result<FailedAttempt> {
                Ok(FailedAttempt {
                    version: version_column(row, 0)?,
                    attempted_at: datetime_column(row, 1)?,
                    error: text_column(row, 2)?,
                })
            })
            .collect()
    }

    /// Remember that `version` failed. Runs outside the failed unit of work
    /// so it survives the rollback.
    pub fn record_failure<S: SqlSession + ?Sized>(
        &self,
        session: &mut S,
        version: u32,
        error: &str,
    ) -> Result<()> {
        self.clear_failure(session, version)?;
        let sql = format!(
            "INSERT INTO {} (version, attempted_at, error) VALUES ({}, {}, {})",
            self.attempts_table,
            session.placeholder(1),
            session.placeholder(2),
            session.placeholder(3)
        );
        session
            .execute(
                &sql,
                &[version.into(), Utc::now().to_rfc3339().into(), error.into()],
            )
            .map_err(|e| {
                Error::LedgerWrite(format!("failed to record failed attempt of {version}: {e}"))
            })?;
        Ok(())
    }

    fn clear_failure<S: SqlSession + ?Sized>(&self, session: &mut S, version: u32) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE version = {}",
            self.attempts_table,
            session.placeholder(1)
        );
        session
            .execute(&sql, &[version.into()])
            .map_err(|e| Error::LedgerWrite(format!("failed to clear attempt of {version}: {e}")))?;
        Ok(())
    }
}

fn version_column(row: &[SqlValue], idx: usize) -> Result<u32> {
    row.get(idx)
        .and_then(SqlValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::Database(format!("ledger column {idx} is not a valid version")))
}

fn text_column(row: &[SqlValue], idx: usize) -> Result<String> {
    row.get(idx)
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Database(format!("ledger column {idx} is not text")))
}

fn datetime_column(row: &[SqlValue], idx: usize) -> Result<DateTime<Utc>> {
    let s = text_column(row, idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|e| Error::Database(format!("invalid ledger timestamp '{s}': {e}")))
}
