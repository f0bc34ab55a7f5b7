//! Turns the catalog and the ledger into an ordered plan.

use std::collections::{BTreeSet, HashSet};

use strata_common::{Error, Result};
use tracing::{debug, warn};

use crate::catalog::{Catalog, MigrationDefinition};
use crate::ledger::{FailedAttempt, LedgerEntry};
use crate::plan::{Direction, Plan, PlanStep};

/// A downgrade plan plus the requested versions it could not honour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowngradePlan {
    pub plan: Plan,
    pub unmatched: Vec<u32>,
}

pub struct Planner<'a> {
    catalog: &'a Catalog,
    verify_checksums: bool,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            verify_checksums: true,
        }
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Every catalog migration missing from the ledger, ascending.
    ///
    /// With `recover`, steps that failed in an earlier real run use their
    /// recovery script when one exists.
    pub fn forward(
        &self,
        applied: &[LedgerEntry],
        failed: &[FailedAttempt],
        recover: bool,
    ) -> Result<Plan> {
        self.check_consistency(applied)?;

        let applied: HashSet<u32> = applied.iter().map(|e| e.version).collect();
        let failed: HashSet<u32> = failed.iter().map(|a| a.version).collect();

        let mut steps = Vec::new();
        for def in self.catalog.all() {
            if applied.contains(&def.version) {
                continue;
            }
            let recovering = failed.contains(&def.version);
            if recovering && !recover {
                warn!(
                    version = def.version,
                    "migration failed in an earlier run; plan with recovery to use its recovery script"
                );
            }
            steps.push(forward_step(def, recovering && recover));
        }

        debug!(steps = steps.len(), "generated forward plan");
        Plan::new(Direction::Up, steps)
    }

    /// Undo the requested versions that are applied, newest first.
    ///
    /// Requested versions that are not applied or not in the catalog are
    /// reported back instead of failing the whole downgrade.
    pub fn downgrade(&self, requested: &[u32], applied: &[LedgerEntry]) -> Result<DowngradePlan> {
        let applied: HashSet<u32> = applied.iter().map(|e| e.version).collect();
        let requested: BTreeSet<u32> = requested.iter().copied().collect();

        let mut matched = Vec::new();
        let mut unmatched = Vec::new();
        for version in requested {
            match self.catalog.get(version) {
                Some(def) if applied.contains(&version) => matched.push(def),
                Some(_) => unmatched.push(version),
                None => {
                    if applied.contains(&version) {
                        warn!(version, "applied migration is not in the catalog, cannot downgrade it");
                    }
                    unmatched.push(version);
                }
            }
        }

        if !unmatched.is_empty() {
            warn!(
                ?unmatched,
                "could not match all requested versions, downgrading only the applied ones"
            );
        }

        matched.sort_by(|a, b| b.version.cmp(&a.version));
        let steps = matched
            .into_iter()
            .map(down_step)
            .collect::<Result<Vec<_>>>()?;

        Ok(DowngradePlan {
            plan: Plan::new(Direction::Down, steps)?,
            unmatched,
        })
    }

    /// Undo the `count` most recently applied versions.
    pub fn rollback_latest(&self, applied: &[LedgerEntry], count: usize) -> Result<Plan> {
        let mut latest: Vec<u32> = applied.iter().map(|e| e.version).collect();
        latest.sort_unstable_by(|a, b| b.cmp(a));
        latest.truncate(count);

        let unknown: Vec<u32> = latest
            .iter()
            .copied()
            .filter(|v| self.catalog.get(*v).is_none())
            .collect();
        if !unknown.is_empty() {
            return Err(Error::CatalogLedgerMismatch { versions: unknown });
        }

        Ok(self.downgrade(&latest, applied)?.plan)
    }

    fn check_consistency(&self, applied: &[LedgerEntry]) -> Result<()> {
        let unknown: Vec<u32> = applied
            .iter()
            .filter(|e| self.catalog.get(e.version).is_none())
            .map(|e| e.version)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::CatalogLedgerMismatch { versions: unknown });
        }

        for entry in applied {
            let Some(def) = self.catalog.get(entry.version) else {
                continue;
            };
            if def.checksum == entry.checksum {
                continue;
            }
            if self.verify_checksums {
                return Err(Error::ChecksumMismatch {
                    version: entry.version,
                    recorded: entry.checksum.clone(),
                    current: def.checksum.clone(),
                });
            }
            warn!(
                version = entry.version,
                "migration changed after it was applied"
            );
        }
        Ok(())
    }
}

/// Parse operator-supplied version identifiers.
pub fn parse_versions<S: AsRef<str>>(versions: &[S]) -> Result<Vec<u32>> {
    versions
        .iter()
        .map(|v| {
            let v = v.as_ref().trim();
            v.parse::<u32>()
                .map_err(|_| Error::InvalidVersion(format!("'{v}' is not a migration version")))
        })
        .collect()
}

fn forward_step(def: &MigrationDefinition, recovery: bool) -> PlanStep {
    let script = match (&def.recover, recovery) {
        (Some(recover), true) => recover.clone(),
        _ => def.up.clone(),
    };
    PlanStep {
        version: def.version,
        name: def.name.clone(),
        checksum: def.checksum.clone(),
        script,
        recovery,
    }
}

fn down_step(def: &MigrationDefinition) -> Result<PlanStep> {
    let script = match &def.down {
        Some(down) if def.is_reversible() => down.clone(),
        _ => {
            return Err(Error::Catalog(format!(
                "migration {} ({}) has no down script",
                def.version, def.name
            )));
        }
    };
    Ok(PlanStep {
        version: def.version,
        name: def.name.clone(),
        checksum: def.checksum.clone(),
        script,
        recovery: false,
    })
}
