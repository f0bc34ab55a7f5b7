use std::time::{Duration, Instant};

use strata_common::Error;
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, ScriptError, UnitOfWork};
use crate::ledger::Ledger;
use crate::lock::{LockGuard, LockManager};
use crate::plan::{Direction, Plan, PlanStep};

/// Outcome of a plan that ran to the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub direction: Direction,
    /// Versions whose steps completed, in execution order. In a dry run these
    /// are the steps that ran cleanly before the work was discarded.
    pub applied: Vec<u32>,
    pub dry_run: bool,
    pub elapsed: Duration,
}

/// A failed apply. `applied` is the prefix of the plan that committed (or,
/// in a dry run, validated) before `error` stopped it.
#[derive(Debug, ThisError)]
#[error("{error}")]
pub struct ApplyError {
    pub applied: Vec<u32>,
    #[source]
    pub error: Error,
}

impl From<Error> for ApplyError {
    fn from(error: Error) -> Self {
        Self {
            applied: Vec::new(),
            error,
        }
    }
}

impl From<ApplyError> for Error {
    fn from(e: ApplyError) -> Self {
        e.error
    }
}

/// Runs plans step by step under the migration lock.
#[derive(Debug, Clone)]
pub struct Executor {
    ledger: Ledger,
    lock: LockManager,
    statement_timeout: Option<Duration>,
}

impl Executor {
    pub fn new(ledger: Ledger, lock: LockManager) -> Self {
        Self {
            ledger,
            lock,
            statement_timeout: None,
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    /// Take the lock, run `plan`, release the lock.
    pub fn apply(
        &self,
        driver: &mut dyn Driver,
        plan: &Plan,
        dry_run: bool,
    ) -> Result<ApplyReport, ApplyError> {
        plan.validate()?;
        let guard = self.lock.acquire(&*driver)?;
        let result = self.apply_locked(driver, plan, dry_run);
        release(guard);
        result
    }

    /// Run `plan` while the caller already holds the lock.
    pub(crate) fn apply_locked(
        &self,
        driver: &mut dyn Driver,
        plan: &Plan,
        dry_run: bool,
    ) -> Result<ApplyReport, ApplyError> {
        self.check_against_ledger(driver, plan)?;

        if plan.is_empty() {
            info!(direction = %plan.direction, "nothing to migrate");
            return Ok(ApplyReport {
                direction: plan.direction,
                applied: Vec::new(),
                dry_run,
                elapsed: Duration::ZERO,
            });
        }

        if dry_run {
            self.run_dry(driver, plan)
        } else {
            self.run(driver, plan)
        }
    }

    /// A plan saved earlier may be stale by the time it runs.
    fn check_against_ledger(&self, driver: &mut dyn Driver, plan: &Plan) -> Result<(), Error> {
        for step in &plan.steps {
            let applied = self.ledger.is_applied(driver, step.version)?;
            match (plan.direction, applied) {
                (Direction::Up, true) => {
                    return Err(Error::InvalidPlan(format!(
                        "version {} is already applied; regenerate the plan",
                        step.version
                    )));
                }
                (Direction::Down, false) => {
                    return Err(Error::InvalidPlan(format!(
                        "version {} is not applied; regenerate the plan",
                        step.version
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn run(&self, driver: &mut dyn Driver, plan: &Plan) -> Result<ApplyReport, ApplyError> {
        self.ledger.bootstrap(driver)?;

        let started = Instant::now();
        let mut applied = Vec::with_capacity(plan.len());

        for step in &plan.steps {
            let step_started = Instant::now();
            info!(
                version = step.version,
                name = %step.name,
                direction = %plan.direction,
                recovery = step.recovery,
                "applying migration"
            );

            if let Err(error) = self.run_step(driver, plan.direction, step) {
                error!(version = step.version, "migration failed: {error}");
                if plan.direction == Direction::Up {
                    if let Err(e) = self
                        .ledger
                        .record_failure(driver, step.version, &error.to_string())
                    {
                        warn!(version = step.version, "could not record failed attempt: {e}");
                    }
                }
                return Err(ApplyError { applied, error });
            }

            info!(
                version = step.version,
                elapsed = ?step_started.elapsed(),
                "migration {} complete",
                match plan.direction {
                    Direction::Up => "applied",
                    Direction::Down => "reverted",
                }
            );
            applied.push(step.version);
        }

        Ok(ApplyReport {
            direction: plan.direction,
            applied,
            dry_run: false,
            elapsed: started.elapsed(),
        })
    }

    /// One durable step: the script and its ledger change commit together.
    fn run_step(
        &self,
        driver: &mut dyn Driver,
        direction: Direction,
        step: &PlanStep,
    ) -> Result<(), Error> {
        let mut uow = driver.begin()?;
        match self.execute_step(&mut *uow, direction, step) {
            Ok(()) => uow.commit().map_err(|e| Error::StepApplication {
                version: step.version,
                cause: e.to_string(),
            }),
            Err(e) => {
                if let Err(rb) = uow.rollback() {
                    warn!(version = step.version, "rollback after failure failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Every step, ledger changes included, runs in a single unit of work
    /// that is always rolled back, so later steps see the schema earlier
    /// ones produced and ledger faults surface as they would for real.
    fn run_dry(&self, driver: &mut dyn Driver, plan: &Plan) -> Result<ApplyReport, ApplyError> {
        let started = Instant::now();
        let mut uow = driver.begin()?;
        let mut validated = Vec::with_capacity(plan.len());
        let mut failure = self.ledger.bootstrap(&mut *uow).err();

        let steps: &[PlanStep] = if failure.is_none() { &plan.steps } else { &[] };
        for step in steps {
            info!(
                version = step.version,
                name = %step.name,
                direction = %plan.direction,
                "dry run: executing migration"
            );
            if let Err(e) = self.execute_step(&mut *uow, plan.direction, step) {
                failure = Some(e);
                break;
            }
            validated.push(step.version);
        }

        if let Err(e) = uow.rollback() {
            warn!("dry run rollback failed: {e}");
        }
        debug!("dry run changes discarded");

        match failure {
            Some(error) => {
                error!("dry run failed: {error}");
                Err(ApplyError {
                    applied: validated,
                    error,
                })
            }
            None => Ok(ApplyReport {
                direction: plan.direction,
                applied: validated,
                dry_run: true,
                elapsed: started.elapsed(),
            }),
        }
    }

    fn execute_step(
        &self,
        uow: &mut dyn UnitOfWork,
        direction: Direction,
        step: &PlanStep,
    ) -> Result<(), Error> {
        uow.run_script(&step.script, self.statement_timeout)
            .map_err(|e| match e {
                ScriptError::TimedOut => Error::StepTimeout {
                    version: step.version,
                },
                ScriptError::Failed(cause) => Error::StepApplication {
                    version: step.version,
                    cause,
                },
            })?;

        match direction {
            Direction::Up => self.ledger.record(uow, step.version, &step.checksum),
            Direction::Down => self.ledger.remove(uow, step.version),
        }
    }
}

pub(crate) fn release(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release() {
        warn!(key = %key, "failed to release migration lock: {e}");
    }
}
