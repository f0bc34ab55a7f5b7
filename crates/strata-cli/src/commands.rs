use std::path::Path;

use anyhow::{Context, Result};
use strata_db::{ApplyError, Migrator, Plan};
use tracing::{info, warn};

use crate::report;

pub fn status(m: &mut Migrator) -> Result<()> {
    let current = m.current_version()?;
    let statuses = m.status()?;
    report::print_status(current, &statuses);
    Ok(())
}

pub fn version(m: &mut Migrator) -> Result<()> {
    println!("{}", m.current_version()?);
    Ok(())
}

pub fn plan(m: &mut Migrator, recover: bool, save: Option<&Path>) -> Result<()> {
    let plan = m.plan(recover)?;
    if plan.is_empty() {
        info!("schema is up to date, nothing to plan");
        return Ok(());
    }

    let json = plan.to_json()?;
    println!("{json}");

    if let Some(dir) = save {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(m.plan_file_name(&plan)?);
        std::fs::write(&path, &json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("plan saved to {}", path.display());
    }
    Ok(())
}

pub fn up(m: &mut Migrator, dry_run: bool) -> Result<()> {
    let report = m.up(dry_run).map_err(apply_failed)?;
    report::print_apply(&report);
    Ok(())
}

pub fn down(m: &mut Migrator, count: usize, dry_run: bool) -> Result<()> {
    let report = m.down(count, dry_run).map_err(apply_failed)?;
    report::print_apply(&report);
    Ok(())
}

pub fn downgrade(m: &mut Migrator, versions: &[String], dry_run: bool) -> Result<()> {
    let result = m.downgrade(versions, dry_run).map_err(apply_failed)?;
    if !result.unmatched.is_empty() {
        warn!(
            "{} requested version(s) were not applied and were skipped: {:?}",
            result.unmatched.len(),
            result.unmatched
        );
    }
    report::print_apply(&result.report);
    Ok(())
}

pub fn apply_plan(m: &mut Migrator, file: &Path, dry_run: bool) -> Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read plan {}", file.display()))?;
    let plan = Plan::from_json(&json)
        .with_context(|| format!("invalid plan file {}", file.display()))?;

    let report = m.apply_plan(&plan, dry_run).map_err(apply_failed)?;
    report::print_apply(&report);
    Ok(())
}

/// Keep the committed prefix visible in the final error message.
fn apply_failed(e: ApplyError) -> anyhow::Error {
    let ApplyError { applied, error } = e;
    if applied.is_empty() {
        error.into()
    } else {
        anyhow::Error::new(error).context(format!("stopped after applying {applied:?}"))
    }
}
