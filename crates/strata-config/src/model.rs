use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

/// Top-level configuration for a migration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub lock: LockConfig,
    pub execution: ExecutionConfig,
}

/// Database engines with a driver implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Sqlite,
}

impl DriverKind {
    /// Name of the per-driver directory in the migration asset tree.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: DriverKind,
    /// Database file path, or `:memory:`.
    pub path: String,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Sqlite,
            path: "strata.db".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Root of the migration asset tree; `<dir>/<driver>/` holds the scripts.
    pub dir: PathBuf,
    pub ledger_table: String,
    pub verify_checksums: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            ledger_table: "db_migrations".to_string(),
            verify_checksums: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicyKind {
    /// Block until the holder finishes, bounded by `timeout_secs`.
    #[default]
    Wait,
    /// Fail immediately when another instance holds the lock.
    Try,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub key: String,
    pub policy: LockPolicyKind,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: "strata-lock-key".to_string(),
            policy: LockPolicyKind::Wait,
            timeout_secs: 60,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-step statement timeout; 0 disables it.
    pub statement_timeout_secs: u64,
    pub dry_run: bool,
}

impl ExecutionConfig {
    pub fn statement_timeout(&self) -> Option<Duration> {
        (self.statement_timeout_secs > 0).then(|| Duration::from_secs(self.statement_timeout_secs))
    }
}

impl AppConfig {
    /// Reject values that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(Error::Config("database.path cannot be empty".into()));
        }
        if !is_identifier(&self.migrations.ledger_table) {
            return Err(Error::Config(format!(
                "migrations.ledger_table '{}' must be a plain SQL identifier",
                self.migrations.ledger_table
            )));
        }
        if self.lock.key.trim().is_empty() {
            return Err(Error::Config("lock.key cannot be empty".into()));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(Error::Config("lock.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
