use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use strata_config::{AppConfig, ConfigLoader, LockPolicyKind};
use strata_db::Migrator;
use tracing_subscriber::EnvFilter;

mod commands;
mod report;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - versioned schema migrations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (YAML or TOML); defaults apply when it does not exist
    #[arg(short, long, global = true, env = "STRATA_CONFIG", default_value = "strata.yml")]
    config: PathBuf,

    /// Database path, overriding the config file
    #[arg(long, global = true, env = "STRATA_DATABASE")]
    database: Option<String>,

    /// Root of the migration tree (`<dir>/<driver>/*.sql`)
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// Run every step, then roll everything back
    #[arg(long, global = true)]
    dry_run: bool,

    /// What to do when another instance holds the migration lock
    #[arg(long, global = true, value_enum)]
    lock_policy: Option<LockPolicyArg>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// List every migration and whether it is applied
    Status,

    /// Print the current schema version
    Version,

    /// Print the pending forward plan as JSON
    Plan {
        /// Use recovery scripts for steps that failed earlier
        #[arg(long)]
        recover: bool,

        /// Also write the plan into this directory
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Apply all pending migrations
    Up,

    /// Revert the most recently applied migrations
    Down {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Revert specific versions, newest first
    Downgrade {
        #[arg(required = true)]
        versions: Vec<String>,
    },

    /// Apply a plan written by `plan --save`
    ApplyPlan { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum LockPolicyArg {
    Wait,
    Try,
}

impl From<LockPolicyArg> for LockPolicyKind {
    fn from(arg: LockPolicyArg) -> Self {
        match arg {
            LockPolicyArg::Wait => LockPolicyKind::Wait,
            LockPolicyArg::Try => LockPolicyKind::Try,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli)?;
    let dry_run = config.execution.dry_run;
    let mut migrator = Migrator::open(&config).with_context(|| {
        format!(
            "failed to open {} with migrations from {}",
            config.database.path,
            config.migrations.dir.display()
        )
    })?;

    let result = match cli.command {
        Commands::Status => commands::status(&mut migrator),
        Commands::Version => commands::version(&mut migrator),
        Commands::Plan { recover, save } => commands::plan(&mut migrator, recover, save.as_deref()),
        Commands::Up => commands::up(&mut migrator, dry_run),
        Commands::Down { count } => commands::down(&mut migrator, count, dry_run),
        Commands::Downgrade { versions } => commands::downgrade(&mut migrator, &versions, dry_run),
        Commands::ApplyPlan { file } => commands::apply_plan(&mut migrator, &file, dry_run),
    };

    migrator.close();
    result
}

/// Logs go to stderr so stdout stays clean for plan JSON.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = ConfigLoader::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    if let Some(dir) = &cli.migrations {
        config.migrations.dir = dir.clone();
    }
    if let Some(policy) = cli.lock_policy {
        config.lock.policy = policy.into();
    }
    if cli.dry_run {
        config.execution.dry_run = true;
    }
    config.validate()?;
    Ok(config)
}
