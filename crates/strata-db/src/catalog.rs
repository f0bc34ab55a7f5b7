//! The set of migrations available to the engine.
//!
//! Assets are named `<digits>_<name>.<kind>.sql` where kind is `up`, `down`
//! or `recover`. The numeric prefix is the version.

use std::collections::BTreeMap;

use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::plan::{Direction, Plan, PlanStep};
use crate::source::AssetSource;

/// A single versioned schema change. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub version: u32,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
    /// Replaces `up` when re-running a step that previously failed part way.
    pub recover: Option<String>,
    pub checksum: String,
}

impl MigrationDefinition {
    pub fn new(
        version: u32,
        name: impl Into<String>,
        up: impl Into<String>,
        down: Option<String>,
    ) -> Self {
        let up = up.into();
        let checksum = checksum(&up, down.as_deref());
        Self {
            version,
            name: name.into(),
            up,
            down,
            recover: None,
            checksum,
        }
    }

    pub fn with_recover(mut self, recover: impl Into<String>) -> Self {
        self.recover = Some(recover.into());
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down.as_deref().is_some_and(|d| !d.trim().is_empty())
    }

    fn allows_script(&self, direction: Direction, step: &PlanStep) -> bool {
        match direction {
            Direction::Up if step.recovery => self.recover.as_deref() == Some(step.script.as_str()),
            Direction::Up => self.up == step.script,
            Direction::Down => self.down.as_deref() == Some(step.script.as_str()),
        }
    }
}

/// SHA-256 over the up script and the down script, hex encoded.
pub fn checksum(up: &str, down: Option<&str>) -> String {
    let mut bytes = Vec::with_capacity(up.len() + 1 + down.map_or(0, str::len));
    bytes.extend_from_slice(up.as_bytes());
    bytes.push(0);
    if let Some(down) = down {
        bytes.extend_from_slice(down.as_bytes());
    }
    hex::encode(digest(&SHA256, &bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Up,
    Down,
    Recover,
}

/// Migrations sorted ascending by version, validated at construction.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    migrations: Vec<MigrationDefinition>,
}

impl Catalog {
    /// Read every asset in `dir` and assemble validated definitions.
    pub fn load(source: &dyn AssetSource, dir: &str) -> Result<Self> {
        let mut scripts: BTreeMap<u32, (String, [Option<String>; 3])> = BTreeMap::new();

        for asset in source.list(dir)? {
            let Some((version, name, kind)) = parse_asset_name(&asset)? else {
                debug!("skipping non-migration asset {asset}");
                continue;
            };

            let bytes = source.read(dir, &asset)?;
            let text = String::from_utf8(bytes)
                .map_err(|_| Error::Catalog(format!("{asset} is not valid UTF-8")))?;

            let entry = scripts
                .entry(version)
                .or_insert_with(|| (name.clone(), [None, None, None]));
            if entry.0 != name {
                return Err(Error::Catalog(format!(
                    "version {version} has conflicting names '{}' and '{name}'",
                    entry.0
                )));
            }
            let slot = &mut entry.1[kind as usize];
            if slot.is_some() {
                return Err(Error::Catalog(format!(
                    "duplicate {kind:?} script for version {version}"
                )));
            }
            *slot = Some(text);
        }

        let mut definitions = Vec::with_capacity(scripts.len());
        for (version, (name, [up, down, recover])) in scripts {
            let up = up.ok_or_else(|| {
                Error::Catalog(format!("migration {version} ({name}) has no up script"))
            })?;
            let mut definition = MigrationDefinition::new(version, name, up, down);
            definition.recover = recover;
            definitions.push(definition);
        }

        let catalog = Self::from_definitions(definitions)?;
        info!(
            count = catalog.len(),
            latest = ?catalog.latest(),
            "loaded migration catalog from '{dir}'"
        );
        Ok(catalog)
    }

    /// Validate and order definitions built in code.
    pub fn from_definitions(mut migrations: Vec<MigrationDefinition>) -> Result<Self> {
        migrations.sort_by_key(|m| m.version);

        for (i, m) in migrations.iter().enumerate() {
            if m.version == 0 {
                return Err(Error::Catalog(format!(
                    "migration '{}' has version 0; versions start at 1",
                    m.name
                )));
            }
            if m.up.trim().is_empty() {
                return Err(Error::Catalog(format!(
                    "migration {} ({}) has an empty up script",
                    m.version, m.name
                )));
            }
            if i > 0 {
                let prev = migrations[i - 1].version;
                if prev == m.version {
                    return Err(Error::Catalog(format!(
                        "duplicate migration version {}",
                        m.version
                    )));
                }
                if m.version != prev + 1 {
                    return Err(Error::Catalog(format!(
                        "migration versions must be sequential: {prev} is followed by {}",
                        m.version
                    )));
                }
            }
        }

        Ok(Self { migrations })
    }

    /// Every definition, ascending by version.
    pub fn all(&self) -> &[MigrationDefinition] {
        &self.migrations
    }

    pub fn get(&self, version: u32) -> Option<&MigrationDefinition> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.migrations[i])
    }

    pub fn latest(&self) -> Option<u32> {
        self.migrations.last().map(|m| m.version)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Check that every step of a plan built elsewhere still describes a
    /// migration of this catalog, byte for byte.
    pub fn check_plan(&self, plan: &Plan) -> Result<()> {
        for step in &plan.steps {
            let def = self.get(step.version).ok_or_else(|| {
                Error::InvalidPlan(format!("version {} is not in the catalog", step.version))
            })?;
            if step.checksum != def.checksum {
                return Err(Error::InvalidPlan(format!(
                    "checksum of version {} differs from the catalog",
                    step.version
                )));
            }
            if !def.allows_script(plan.direction, step) {
                return Err(Error::InvalidPlan(format!(
                    "script of version {} is not one of the catalog's {} scripts",
                    step.version, plan.direction
                )));
            }
        }
        Ok(())
    }
}

/// `Ok(None)` for assets that are not SQL scripts.
fn parse_asset_name(asset: &str) -> Result<Option<(u32, String, ScriptKind)>> {
    let Some(stem) = asset.strip_suffix(".sql") else {
        return Ok(None);
    };

    let malformed = || {
        Error::Catalog(format!(
            "malformed migration name '{asset}', expected <version>_<name>.(up|down|recover).sql"
        ))
    };

    let (base, kind) = stem.rsplit_once('.').ok_or_else(malformed)?;
    let kind = match kind {
        "up" => ScriptKind::Up,
        "down" => ScriptKind::Down,
        "recover" => ScriptKind::Recover,
        _ => return Err(malformed()),
    };

    let (digits, name) = base.split_once('_').ok_or_else(malformed)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
        return Err(malformed());
    }
    let version = digits
        .parse::<u32>()
        .map_err(|_| Error::Catalog(format!("version in '{asset}' is out of range")))?;

    Ok(Some((version, name.to_string(), kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn source(files: &[(&str, &str)]) -> MemorySource {
        files
            .iter()
            .fold(MemorySource::new(), |s, (name, body)| s.with_file("sqlite", name, *body))
    }

    #[test]
    fn loads_definitions_in_version_order() {
        let src = source(&[
            ("000002_add_posts.up.sql", "CREATE TABLE posts (id INTEGER);"),
            ("000002_add_posts.down.sql", "DROP TABLE posts;"),
            ("000001_add_users.up.sql", "CREATE TABLE users (id INTEGER);"),
            ("000001_add_users.down.sql", "DROP TABLE users;"),
            ("000001_add_users.recover.sql", "CREATE TABLE IF NOT EXISTS users (id INTEGER);"),
            ("README.md", "not a migration"),
        ]);

        let catalog = Catalog::load(&src, "sqlite").unwrap();
        let versions: Vec<u32> = catalog.all().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);

        let users = catalog.get(1).unwrap();
        assert_eq!(users.name, "add_users");
        assert_eq!(users.down.as_deref(), Some("DROP TABLE users;"));
        assert!(users.recover.is_some());
        assert_eq!(catalog.latest(), Some(2));
    }

    #[test]
    fn checksum_tracks_script_content() {
        let a = checksum("CREATE TABLE t (id INTEGER);", Some("DROP TABLE t;"));
        let b = checksum("CREATE TABLE t (id INTEGER);", Some("DROP TABLE t;"));
        let c = checksum("CREATE TABLE t (id TEXT);", Some("DROP TABLE t;"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        // Moving text between up and down changes the checksum.
        assert_ne!(checksum("ab", Some("c")), checksum("a", Some("bc")));
    }

    #[test]
    fn checksum_is_lowercase_hex_sha256() {
        assert_eq!(
            checksum("SELECT 1;", None),
            "89c8145a4229c96c4744b417b5e7cbd12151b04c6f0e8d7267ae263b3f8a6a53"
        );
    }

    #[test]
    fn rejects_duplicate_versions() {
        let defs = vec![
            MigrationDefinition::new(1, "a", "SELECT 1;", None),
            MigrationDefinition::new(1, "b", "SELECT 2;", None),
        ];
        let err = Catalog::from_definitions(defs).unwrap_err();
        assert!(err.to_string().contains("duplicate migration version 1"));
    }

    #[test]
    fn rejects_conflicting_names_for_one_version() {
        let src = source(&[
            ("000001_a.up.sql", "SELECT 1;"),
            ("000001_b.down.sql", "SELECT 1;"),
        ]);
        assert!(Catalog::load(&src, "sqlite").is_err());
    }

    #[test]
    fn rejects_gaps_in_the_sequence() {
        let src = source(&[("000001_a.up.sql", "SELECT 1;"), ("000003_c.up.sql", "SELECT 3;")]);
        let err = Catalog::load(&src, "sqlite").unwrap_err();
        assert!(err.to_string().contains("sequential"));
    }

    #[test]
    fn rejects_missing_or_blank_up_script() {
        let src = source(&[("000001_a.down.sql", "DROP TABLE a;")]);
        assert!(Catalog::load(&src, "sqlite").is_err());

        let src = source(&[("000001_a.up.sql", "  \n")]);
        assert!(Catalog::load(&src, "sqlite").is_err());
    }

    #[test]
    fn rejects_version_zero_and_malformed_names() {
        assert!(Catalog::load(&source(&[("000000_init.up.sql", "SELECT 1;")]), "sqlite").is_err());
        assert!(Catalog::load(&source(&[("init.up.sql", "SELECT 1;")]), "sqlite").is_err());
        assert!(Catalog::load(&source(&[("0001_init.sideways.sql", "SELECT 1;")]), "sqlite").is_err());
        assert!(Catalog::load(&source(&[("12a_init.up.sql", "SELECT 1;")]), "sqlite").is_err());
    }

    #[test]
    fn rejects_non_utf8_scripts() {
        let src = MemorySource::new().with_file("sqlite", "000001_a.up.sql", vec![0xffu8, 0xfe]);
        let err = Catalog::load(&src, "sqlite").unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn reversibility_requires_a_non_blank_down_script() {
        assert!(!MigrationDefinition::new(1, "a", "SELECT 1;", None).is_reversible());
        assert!(!MigrationDefinition::new(1, "a", "SELECT 1;", Some(" ".into())).is_reversible());
        assert!(MigrationDefinition::new(1, "a", "SELECT 1;", Some("SELECT 0;".into())).is_reversible());
    }

    #[test]
    fn check_plan_accepts_only_steps_the_catalog_knows() {
        let catalog = Catalog::from_definitions(vec![
            MigrationDefinition::new(1, "a", "CREATE TABLE a (id INTEGER);", Some("DROP TABLE a;".into()))
                .with_recover("CREATE TABLE IF NOT EXISTS a (id INTEGER);"),
        ])
        .unwrap();
        let def = catalog.get(1).unwrap();
        let up = |script: &str, recovery: bool| PlanStep {
            version: 1,
            name: "a".into(),
            checksum: def.checksum.clone(),
            script: script.into(),
            recovery,
        };

        let ok = Plan::new(Direction::Up, vec![up(&def.up, false)]).unwrap();
        catalog.check_plan(&ok).unwrap();
        let recover = Plan::new(Direction::Up, vec![up(def.recover.as_deref().unwrap(), true)]).unwrap();
        catalog.check_plan(&recover).unwrap();
        let down = Plan::new(Direction::Down, vec![up("DROP TABLE a;", false)]).unwrap();
        catalog.check_plan(&down).unwrap();

        let unknown = Plan::new(
            Direction::Up,
            vec![PlanStep {
                version: 99,
                ..up("CREATE TABLE z (id INTEGER);", false)
            }],
        )
        .unwrap();
        assert!(matches!(catalog.check_plan(&unknown), Err(Error::InvalidPlan(_))));

        let edited = Plan::new(Direction::Up, vec![up("DROP TABLE users;", false)]).unwrap();
        assert!(matches!(catalog.check_plan(&edited), Err(Error::InvalidPlan(_))));

        let mut drifted = ok.clone();
        drifted.steps[0].checksum = "0".repeat(64);
        assert!(matches!(catalog.check_plan(&drifted), Err(Error::InvalidPlan(_))));

        let down_as_up = Plan::new(Direction::Up, vec![up("DROP TABLE a;", false)]).unwrap();
        assert!(catalog.check_plan(&down_as_up).is_err());
    }
}
