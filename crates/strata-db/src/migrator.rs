use strata_common::Result;
use strata_config::AppConfig;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::driver::{Driver, connect};
use crate::executor::{ApplyError, ApplyReport, Executor, release};
use crate::ledger::{FailedAttempt, Ledger, LedgerEntry, SchemaVersion};
use crate::lock::LockManager;
use crate::plan::Plan;
use crate::planner::{Planner, parse_versions};
use crate::source::{AssetSource, DirectorySource};

/// A catalog migration next to what the ledger knows about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u32,
    pub name: String,
    pub applied: Option<LedgerEntry>,
    pub failed: Option<FailedAttempt>,
    /// False when the recorded checksum differs from the catalog's.
    pub checksum_matches: bool,
}

/// Result of a downgrade, with the requested versions that were skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowngradeReport {
    pub report: ApplyReport,
    pub unmatched: Vec<u32>,
}

/// Entry point for embedding applications: one database, one catalog.
pub struct Migrator {
    driver: Box<dyn Driver>,
    catalog: Catalog,
    executor: Executor,
    verify_checksums: bool,
}

impl Migrator {
    pub fn new(driver: Box<dyn Driver>, catalog: Catalog, executor: Executor) -> Self {
        Self {
            driver,
            catalog,
            executor,
            verify_checksums: true,
        }
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Connect and load `<migrations.dir>/<driver>/` as the catalog.
    pub fn open(config: &AppConfig) -> Result<Self> {
        let source = DirectorySource::new(config.migrations.dir.clone());
        Self::open_with_source(config, &source)
    }

    /// Like `open`, reading the `<driver>/` directory of `source` instead of
    /// `migrations.dir`. Use with `EmbeddedSource` for compiled-in scripts.
    pub fn open_with_source(config: &AppConfig, source: &dyn AssetSource) -> Result<Self> {
        config.validate()?;

        let catalog = Catalog::load(source, config.database.driver.as_str())?;
        let driver = connect(&config.database)?;
        info!(
            driver = driver.name(),
            migrations = catalog.len(),
            latest = ?catalog.latest(),
            "migration catalog loaded"
        );

        let executor = Executor::new(
            Ledger::new(config.migrations.ledger_table.clone()),
            LockManager::from_config(&config.lock),
        )
        .with_statement_timeout(config.execution.statement_timeout());

        Ok(Self::new(driver, catalog, executor).verify_checksums(config.migrations.verify_checksums))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn driver(&mut self) -> &mut dyn Driver {
        &mut *self.driver
    }

    pub fn current_version(&mut self) -> Result<SchemaVersion> {
        self.executor.ledger().current_version(&mut *self.driver)
    }

    pub fn status(&mut self) -> Result<Vec<MigrationStatus>> {
        let ledger = self.executor.ledger();
        let applied = ledger.entries(&mut *self.driver)?;
        let failed = ledger.failed_attempts(&mut *self.driver)?;

        Ok(self
            .catalog
            .all()
            .iter()
            .map(|def| {
                let entry = applied.iter().find(|e| e.version == def.version).cloned();
                let checksum_matches = entry.as_ref().is_none_or(|e| e.checksum == def.checksum);
                MigrationStatus {
                    version: def.version,
                    name: def.name.clone(),
                    applied: entry,
                    failed: failed.iter().find(|a| a.version == def.version).cloned(),
                    checksum_matches,
                }
            })
            .collect())
    }

    /// Forward plan against the current ledger, without running it.
    pub fn plan(&mut self, recover: bool) -> Result<Plan> {
        let ledger = self.executor.ledger();
        let applied = ledger.entries(&mut *self.driver)?;
        let failed = ledger.failed_attempts(&mut *self.driver)?;
        Planner::new(&self.catalog)
            .verify_checksums(self.verify_checksums)
            .forward(&applied, &failed, recover)
    }

    /// Run a plan produced earlier, possibly by another process. Every step
    /// must still match the loaded catalog.
    pub fn apply_plan(&mut self, plan: &Plan, dry_run: bool) -> Result<ApplyReport, ApplyError> {
        self.catalog.check_plan(plan)?;
        self.executor.apply(&mut *self.driver, plan, dry_run)
    }

    /// Apply every pending migration.
    pub fn up(&mut self, dry_run: bool) -> Result<ApplyReport, ApplyError> {
        self.locked(|m| {
            let plan = m.plan(false)?;
            m.executor.apply_locked(&mut *m.driver, &plan, dry_run)
        })
    }

    /// Revert the `count` most recently applied migrations.
    pub fn down(&mut self, count: usize, dry_run: bool) -> Result<ApplyReport, ApplyError> {
        self.locked(|m| {
            let applied = m.executor.ledger().entries(&mut *m.driver)?;
            let plan = Planner::new(&m.catalog).rollback_latest(&applied, count)?;
            m.executor.apply_locked(&mut *m.driver, &plan, dry_run)
        })
    }

    /// Revert the listed versions, newest first.
    pub fn downgrade<S: AsRef<str>>(
        &mut self,
        versions: &[S],
        dry_run: bool,
    ) -> Result<DowngradeReport, ApplyError> {
        let requested = parse_versions(versions)?;
        self.locked(|m| {
            let applied = m.executor.ledger().entries(&mut *m.driver)?;
            let downgrade = Planner::new(&m.catalog).downgrade(&requested, &applied)?;
            let report = m
                .executor
                .apply_locked(&mut *m.driver, &downgrade.plan, dry_run)?;
            Ok(DowngradeReport {
                report,
                unmatched: downgrade.unmatched,
            })
        })
    }

    /// Audit file name for `plan` starting from the current version.
    pub fn plan_file_name(&mut self, plan: &Plan) -> Result<String> {
        let from = self.current_version()?;
        plan.file_name(from)
    }

    pub fn close(self) {
        debug!(driver = self.driver.name(), "closing migrator");
    }

    fn locked<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ApplyError>,
    ) -> Result<T, ApplyError> {
        let guard = self.executor.lock().acquire(&*self.driver)?;
        let result = f(self);
        release(guard);
        result
    }
}
