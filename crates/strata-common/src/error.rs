use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("ledger references versions unknown to the catalog: {versions:?}")]
    CatalogLedgerMismatch { versions: Vec<u32> },

    #[error("checksum mismatch for migration {version}: recorded {recorded}, catalog has {current}")]
    ChecksumMismatch {
        version: u32,
        recorded: String,
        current: String,
    },

    #[error("migration lock '{key}' is held by another instance (waited {waited:?})")]
    LockBusy { key: String, waited: Duration },

    #[error("migration {version} failed: {cause}")]
    StepApplication { version: u32, cause: String },

    #[error("migration {version} exceeded its statement timeout")]
    StepTimeout { version: u32 },

    #[error("ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid migration version: {0}")]
    InvalidVersion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether re-running the same operation later can succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockBusy { .. })
    }

    /// The migration version a step-level failure refers to.
    pub fn failed_version(&self) -> Option<u32> {
        match self {
            Error::StepApplication { version, .. } | Error::StepTimeout { version } => {
                Some(*version)
            }
            Error::ChecksumMismatch { version, .. } => Some(*version),
            _ => None,
        }
    }
}
