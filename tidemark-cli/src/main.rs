//! Tidemark Migration CLI Tool
//!
//! Applies, inspects, reverts and scaffolds migrations. Designed to run as a
//! deployment step: any failure exits non-zero after the run was rolled back.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process;
use tidemark::migration::ScaffoldGenerator;
use tidemark::{open_executor, MigrationSettings, TideExecutor};
use tidemark_cli::commands;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Transactional schema migrations for PostgreSQL and SQLite")]
#[command(version)]
struct Cli {
    /// Database connection URL (falls back to settings, then DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Use the SQLite database at this path instead of a URL
    #[arg(long, global = true, conflicts_with = "database_url")]
    sqlite: Option<PathBuf>,

    /// Migrations directory path
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Schema holding the ledger table
    #[arg(long, global = true)]
    schema: Option<String>,

    /// Ledger table name
    #[arg(long, global = true)]
    table: Option<String>,

    /// Settings file
    #[arg(long, global = true, default_value = tidemark::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations in one transaction
    Migrate {
        /// Apply everything, then roll back
        #[arg(long)]
        damp: bool,
    },

    /// Create a new migration file
    Create,

    /// Show migration status (applied vs pending)
    Status,

    /// Revert the most recently applied migrations
    Rollback {
        /// Number of migrations to revert
        #[arg(long, default_value = "1")]
        steps: usize,

        /// Revert, then roll back
        #[arg(long)]
        damp: bool,
    },
}

impl Commands {
    fn runs_migrations(&self) -> bool {
        matches!(self, Commands::Migrate { .. } | Commands::Rollback { .. })
    }
}

fn init_logging(cli: &Cli) {
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

fn settings(cli: &Cli) -> Result<MigrationSettings> {
    let mut settings = MigrationSettings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    if let Some(dir) = &cli.migrations_dir {
        settings.migrations_folder = dir.clone();
    }
    if let Some(schema) = &cli.schema {
        settings.migration_schema = schema.clone();
    }
    if let Some(table) = &cli.table {
        settings.migration_table = table.clone();
    }
    if let Some(path) = &cli.sqlite {
        settings.database_url = Some(format!("sqlite://{}", path.display()));
    } else if let Some(url) = &cli.database_url {
        settings.database_url = Some(url.clone());
    } else if settings.database_url.is_none() {
        settings.database_url = std::env::var("DATABASE_URL").ok();
    }
    Ok(settings)
}

fn executor(settings: &MigrationSettings) -> Result<Box<dyn TideExecutor>> {
    let Some(url) = settings.database_url.as_deref() else {
        bail!(
            "Database URL not provided. Use --database-url, --sqlite, \
             TIDEMARK__MIGRATION__DATABASE_URL or DATABASE_URL"
        );
    };
    open_executor(url).context("Error connecting to database")
}

fn run(cli: &Cli) -> Result<()> {
    let settings = settings(cli)?;

    match cli.command {
        Commands::Create => {
            commands::handle_create(&settings, &ScaffoldGenerator::new())?;
        }
        Commands::Migrate { damp } => {
            let db = executor(&settings)?;
            commands::handle_migrate(db.as_ref(), &settings, damp)?;
        }
        Commands::Status => {
            let db = executor(&settings)?;
            commands::handle_status(db.as_ref(), &settings)?;
        }
        Commands::Rollback { steps, damp } => {
            let db = executor(&settings)?;
            commands::handle_rollback(db.as_ref(), &settings, steps, damp)?;
        }
    }
    Ok(())
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(&cli) {
        log::error!("{e:#}");
        if cli.command.runs_migrations() {
            eprintln!("{}", commands::failure_message(&e).red());
        }
        eprintln!("{} {e:#}", "Error:".red().bold());
        process::exit(1);
    }
}
