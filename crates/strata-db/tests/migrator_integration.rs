use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use strata_common::Error;
use strata_config::{AppConfig, LockPolicyKind};
use strata_db::{
    Direction, EmbeddedSource, LockManager, LockPolicy, Migrator, Plan, PlanStep, SchemaVersion,
    SqliteDriver,
};
use tempfile::TempDir;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/migrations")
}

fn config(db_dir: &Path, migrations: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = db_dir.join("app.db").to_string_lossy().into_owned();
    config.migrations.dir = migrations.to_path_buf();
    config.lock.policy = LockPolicyKind::Try;
    config
}

fn write_migrations(root: &Path, files: &[(&str, &str)]) {
    let dir = root.join("sqlite");
    std::fs::create_dir_all(&dir).unwrap();
    for (name, sql) in files {
        std::fs::write(dir.join(name), sql).unwrap();
    }
}

fn simple_migrations(root: &Path) {
    write_migrations(
        root,
        &[
            ("000001_a.up.sql", "CREATE TABLE a (id INTEGER PRIMARY KEY);"),
            ("000001_a.down.sql", "DROP TABLE a;"),
            ("000002_b.up.sql", "CREATE TABLE b (id INTEGER PRIMARY KEY);"),
            ("000002_b.down.sql", "DROP TABLE b;"),
            ("000003_c.up.sql", "CREATE TABLE c (id INTEGER PRIMARY KEY);"),
            ("000003_c.down.sql", "DROP TABLE c;"),
        ],
    );
}

fn applied_versions(m: &mut Migrator) -> Vec<u32> {
    m.status()
        .unwrap()
        .into_iter()
        .filter(|s| s.applied.is_some())
        .map(|s| s.version)
        .collect()
}

/// Apply only the first `n` steps of the pending plan.
fn apply_first(m: &mut Migrator, n: usize) {
    let plan = m.plan(false).unwrap();
    let partial = Plan::new(Direction::Up, plan.steps[..n].to_vec()).unwrap();
    m.apply_plan(&partial, false).unwrap();
}

#[test]
fn plans_and_applies_pending_migrations() {
    let db = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();
    apply_first(&mut m, 1);

    let plan = m.plan(false).unwrap();
    assert_eq!(plan.versions(), vec![2, 3]);
    assert_eq!(m.plan_file_name(&plan).unwrap(), "migration_plan_1_3");

    let report = m.up(false).unwrap();
    assert_eq!(report.applied, vec![2, 3]);
    assert_eq!(applied_versions(&mut m), vec![1, 2, 3]);
    assert!(m.driver().table_exists("posts").unwrap());
}

#[test]
fn downgrade_runs_newest_first() {
    let db = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();
    m.up(false).unwrap();

    let result = m.downgrade(&["3", "2"], false).unwrap();
    assert_eq!(result.report.applied, vec![3, 2]);
    assert!(result.unmatched.is_empty());
    assert_eq!(applied_versions(&mut m), vec![1]);
    assert!(!m.driver().table_exists("posts").unwrap());
}

#[test]
fn downgrade_skips_unknown_versions() {
    let db = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();
    m.up(false).unwrap();

    let result = m.downgrade(&["2", "99"], false).unwrap();
    assert_eq!(result.report.applied, vec![2]);
    assert_eq!(result.unmatched, vec![99]);
    assert_eq!(applied_versions(&mut m), vec![1, 3]);
}

#[test]
fn full_up_then_down_returns_to_empty() {
    let db = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();

    m.up(false).unwrap();
    assert_eq!(m.current_version().unwrap(), SchemaVersion::At(3));

    let report = m.down(3, false).unwrap();
    assert_eq!(report.direction, Direction::Down);
    assert_eq!(report.applied, vec![3, 2, 1]);
    assert_eq!(m.current_version().unwrap(), SchemaVersion::Unversioned);
    assert!(!m.driver().table_exists("users").unwrap());
}

#[test]
fn dry_run_leaves_database_untouched() {
    let db = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();
    apply_first(&mut m, 1);

    let report = m.up(true).unwrap();
    assert!(report.dry_run);
    assert_eq!(report.applied, vec![2, 3]);
    assert_eq!(applied_versions(&mut m), vec![1]);
    assert!(!m.driver().table_exists("posts").unwrap());

    let report = m.down(1, true).unwrap();
    assert_eq!(report.applied, vec![1]);
    assert!(m.driver().table_exists("users").unwrap());
}

#[test]
fn failed_step_keeps_earlier_steps_and_can_be_recovered() {
    let db = TempDir::new().unwrap();
    let migrations = TempDir::new().unwrap();
    simple_migrations(migrations.path());
    write_migrations(
        migrations.path(),
        &[("000002_b.up.sql", "CREATE TABLE b (id INTEGER PRIMARY KEY); CREAT TABLE oops;")],
    );
    let cfg = config(db.path(), migrations.path());

    let mut m = Migrator::open(&cfg).unwrap();
    let err = m.up(false).unwrap_err();
    assert_eq!(err.applied, vec![1]);
    assert!(matches!(err.error, Error::StepApplication { version: 2, .. }));
    assert_eq!(m.current_version().unwrap(), SchemaVersion::At(1));
    assert!(!m.driver().table_exists("b").unwrap());

    let status = m.status().unwrap();
    assert!(status[1].failed.is_some());
    assert!(status[2].failed.is_none());
    m.close();

    write_migrations(
        migrations.path(),
        &[(
            "000002_b.recover.sql",
            "CREATE TABLE IF NOT EXISTS b (id INTEGER PRIMARY KEY);",
        )],
    );
    let mut m = Migrator::open(&cfg).unwrap();
    let plan = m.plan(true).unwrap();
    assert_eq!(plan.versions(), vec![2, 3]);
    assert!(plan.steps[0].recovery);
    assert!(plan.steps[0].script.contains("IF NOT EXISTS"));
    assert!(!plan.steps[1].recovery);

    m.apply_plan(&plan, false).unwrap();
    assert_eq!(applied_versions(&mut m), vec![1, 2, 3]);
    assert!(m.status().unwrap().iter().all(|s| s.failed.is_none()));
}

#[test]
fn slow_step_is_cut_off_by_statement_timeout() {
    let db = TempDir::new().unwrap();
    let migrations = TempDir::new().unwrap();
    write_migrations(
        migrations.path(),
        &[
            ("000001_a.up.sql", "CREATE TABLE a (id INTEGER PRIMARY KEY);"),
            (
                "000002_spin.up.sql",
                "CREATE TABLE spin AS
                 WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
                 SELECT x FROM n;",
            ),
        ],
    );
    let mut cfg = config(db.path(), migrations.path());
    cfg.execution.statement_timeout_secs = 1;

    let mut m = Migrator::open(&cfg).unwrap();
    let err = m.up(false).unwrap_err();
    assert_eq!(err.applied, vec![1]);
    assert!(matches!(err.error, Error::StepTimeout { version: 2 }));
    assert_eq!(m.current_version().unwrap(), SchemaVersion::At(1));
}

#[test]
fn busy_lock_fails_fast_with_try_policy() {
    let db = TempDir::new().unwrap();
    let cfg = config(db.path(), &fixtures());
    let mut m = Migrator::open(&cfg).unwrap();

    let holder = SqliteDriver::open_path(Path::new(&cfg.database.path), Duration::from_secs(1))
        .unwrap();
    let guard = LockManager::new(cfg.lock.key.clone(), LockPolicy::TryOnce)
        .acquire(&holder)
        .unwrap();

    let err = m.up(false).unwrap_err();
    assert!(matches!(err.error, Error::LockBusy { .. }));
    assert!(err.error.is_retryable());
    assert_eq!(m.current_version().unwrap(), SchemaVersion::Unversioned);

    guard.release().unwrap();
    assert_eq!(m.up(false).unwrap().applied, vec![1, 2, 3]);
}

#[test]
fn concurrent_instances_apply_each_migration_once() {
    let db = TempDir::new().unwrap();
    let mut cfg = config(db.path(), &fixtures());
    cfg.lock.policy = LockPolicyKind::Wait;
    cfg.lock.timeout_secs = 30;
    cfg.lock.poll_interval_ms = 10;

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let cfg = cfg.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut m = Migrator::open(&cfg).unwrap();
                barrier.wait();
                m.up(false).unwrap().applied
            })
        })
        .collect();

    let mut results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort();
    assert_eq!(results, vec![vec![], vec![1, 2, 3]]);

    let mut m = Migrator::open(&cfg).unwrap();
    assert_eq!(applied_versions(&mut m), vec![1, 2, 3]);
}

#[test]
fn saved_plan_applies_later_and_goes_stale_once_used() {
    let db = TempDir::new().unwrap();
    let plans = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();

    let plan = m.plan(false).unwrap();
    let name = m.plan_file_name(&plan).unwrap();
    assert_eq!(name, "migration_plan_0_3");
    let path = plans.path().join(&name);
    std::fs::write(&path, plan.to_json().unwrap()).unwrap();

    let loaded = Plan::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(m.apply_plan(&loaded, false).unwrap().applied, vec![1, 2, 3]);

    let err = m.apply_plan(&loaded, false).unwrap_err();
    assert!(matches!(err.error, Error::InvalidPlan(_)));
    assert!(err.applied.is_empty());
}

#[test]
fn edited_migration_is_detected_by_checksum() {
    let db = TempDir::new().unwrap();
    let migrations = TempDir::new().unwrap();
    simple_migrations(migrations.path());
    let mut cfg = config(db.path(), migrations.path());

    Migrator::open(&cfg).unwrap().up(false).unwrap();

    write_migrations(
        migrations.path(),
        &[("000002_b.up.sql", "CREATE TABLE b (id INTEGER PRIMARY KEY, note TEXT);")],
    );
    let mut m = Migrator::open(&cfg).unwrap();
    assert!(matches!(
        m.plan(false).unwrap_err(),
        Error::ChecksumMismatch { version: 2, .. }
    ));
    assert!(!m.status().unwrap()[1].checksum_matches);

    cfg.migrations.verify_checksums = false;
    let mut m = Migrator::open(&cfg).unwrap();
    assert!(m.plan(false).unwrap().is_empty());
}

#[test]
fn ledger_ahead_of_catalog_is_refused() {
    let db = TempDir::new().unwrap();
    let migrations = TempDir::new().unwrap();
    simple_migrations(migrations.path());
    let cfg = config(db.path(), migrations.path());
    Migrator::open(&cfg).unwrap().up(false).unwrap();

    std::fs::remove_file(migrations.path().join("sqlite/000003_c.up.sql")).unwrap();
    std::fs::remove_file(migrations.path().join("sqlite/000003_c.down.sql")).unwrap();

    let mut m = Migrator::open(&cfg).unwrap();
    match m.up(false) {
        Err(e) => match e.error {
            Error::CatalogLedgerMismatch { versions } => assert_eq!(versions, vec![3]),
            other => panic!("expected CatalogLedgerMismatch, got {other}"),
        },
        Ok(report) => panic!("expected failure, applied {:?}", report.applied),
    }
}

#[test]
fn foreign_plan_step_never_reaches_the_ledger() {
    let db = TempDir::new().unwrap();
    let mut m = Migrator::open(&config(db.path(), &fixtures())).unwrap();
    m.up(false).unwrap();

    let foreign = Plan::new(
        Direction::Up,
        vec![PlanStep {
            version: 99,
            name: "z".into(),
            checksum: String::new(),
            script: "CREATE TABLE z (id INTEGER PRIMARY KEY);".into(),
            recovery: false,
        }],
    )
    .unwrap();
    let err = m.apply_plan(&foreign, false).unwrap_err();
    assert!(matches!(err.error, Error::InvalidPlan(_)));
    assert!(!m.driver().table_exists("z").unwrap());

    assert!(m.up(false).unwrap().applied.is_empty());
    assert_eq!(applied_versions(&mut m), vec![1, 2, 3]);
}

static EMBEDDED: include_dir::Dir<'static> =
    include_dir::include_dir!("$CARGO_MANIFEST_DIR/tests/fixtures/migrations");

#[test]
fn embedded_catalog_migrates_like_the_directory_one() {
    let db = TempDir::new().unwrap();
    let cfg = config(db.path(), Path::new("unused"));

    let mut m = Migrator::open_with_source(&cfg, &EmbeddedSource::new(&EMBEDDED)).unwrap();
    assert_eq!(m.up(false).unwrap().applied, vec![1, 2, 3]);
    assert!(m.driver().table_exists("posts").unwrap());
}
