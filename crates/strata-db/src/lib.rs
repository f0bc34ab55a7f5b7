pub mod catalog;
pub mod driver;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod migrator;
pub mod plan;
pub mod planner;
pub mod source;
pub mod sqlite;

pub use catalog::{Catalog, MigrationDefinition};
pub use driver::{Driver, ScriptError, SessionLock, SqlSession, SqlValue, UnitOfWork, connect};
pub use executor::{ApplyError, ApplyReport, Executor};
pub use ledger::{FailedAttempt, Ledger, LedgerEntry, SchemaVersion};
pub use lock::{LockGuard, LockManager, LockPolicy};
pub use migrator::{DowngradeReport, MigrationStatus, Migrator};
pub use plan::{Direction, Plan, PlanStep};
pub use planner::{DowngradePlan, Planner, parse_versions};
pub use source::{AssetSource, DirectorySource, EmbeddedSource, MemorySource};
pub use sqlite::SqliteDriver;
