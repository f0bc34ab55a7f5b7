use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};

use crate::ledger::SchemaVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// One migration to run, carrying the exact script chosen at planning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub version: u32,
    pub name: String,
    pub checksum: String,
    pub script: String,
    /// Re-running a step that previously failed in a real run.
    #[serde(default)]
    pub recovery: bool,
}

/// Ordered work for one executor invocation: ascending for up, descending
/// for down, no repeated versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub direction: Direction,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(direction: Direction, steps: Vec<PlanStep>) -> Result<Self> {
        let plan = Self { direction, steps };
        plan.validate()?;
        Ok(plan)
    }

    pub fn empty(direction: Direction) -> Self {
        Self {
            direction,
            steps: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn versions(&self) -> Vec<u32> {
        self.steps.iter().map(|s| s.version).collect()
    }

    /// The version the last step leaves behind it.
    pub fn target(&self) -> Option<u32> {
        self.steps.last().map(|s| s.version)
    }

    /// Check ordering and uniqueness; plans read back from disk go through
    /// this before they run.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(step.version) {
                return Err(Error::InvalidPlan(format!(
                    "version {} appears more than once",
                    step.version
                )));
            }
            if step.script.trim().is_empty() {
                return Err(Error::InvalidPlan(format!(
                    "step {} has an empty script",
                    step.version
                )));
            }
        }

        let ordered = self.steps.windows(2).all(|w| match self.direction {
            Direction::Up => w[0].version < w[1].version,
            Direction::Down => w[0].version > w[1].version,
        });
        if !ordered {
            let expected = match self.direction {
                Direction::Up => "ascending",
                Direction::Down => "descending",
            };
            return Err(Error::InvalidPlan(format!(
                "{} plan steps must be {expected}: {:?}",
                self.direction,
                self.versions()
            )));
        }
        Ok(())
    }

    /// Name under which a plan starting at `from` is saved for audit.
    pub fn file_name(&self, from: SchemaVersion) -> Result<String> {
        let to = self
            .target()
            .ok_or_else(|| Error::InvalidPlan("plan is empty".into()))?;
        Ok(format!("migration_plan_{}_{to}", from.as_u32()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }
}
