//! Command handlers
//!
//! Each handler prints its own progress and returns an error for the binary to
//! report; engine failures are surfaced as [`MigrationError`] so the caller can
//! tell whether the database was left untouched.

use crate::discover::{discover_migrations, MigrationFile};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use tidemark::migration::{
    MigrationError, Migrator, RunFailure, RunOutcome, ScaffoldGenerator, StepStatus,
};
use tidemark::{MigrationSettings, TideExecutor};

/// Build the migrator described by `settings`
#[must_use]
pub fn migrator(settings: &MigrationSettings) -> Migrator {
    let migrator = Migrator::new(settings.ledger());
    match settings.lock_timeout() {
        Some(timeout) => migrator.with_lock(timeout),
        None => migrator,
    }
}

fn load_migrations(settings: &MigrationSettings) -> Result<Vec<MigrationFile>> {
    discover_migrations(&settings.migrations_folder).with_context(|| {
        format!(
            "Failed to load migrations from {}",
            settings.migrations_folder.display()
        )
    })
}

fn print_steps(outcome: &RunOutcome) {
    for step in &outcome.steps {
        match &step.status {
            StepStatus::Applied => println!("  {} {}", "✓".green(), step.identity),
            StepStatus::Reverted => println!("  {} {}", "↶".yellow(), step.identity),
            StepStatus::Skipped => println!("  {} {} (already applied)", "·".dimmed(), step.identity),
            StepStatus::Failed(message) => {
                println!("  {} {}: {}", "✗".red(), step.identity, message)
            }
        }
    }
}

fn surface(failure: RunFailure) -> anyhow::Error {
    print_steps(&failure.outcome);
    anyhow::Error::new(failure.error)
}

/// Apply pending migrations; `damp` rolls everything back afterwards
pub fn handle_migrate(
    executor: &dyn TideExecutor,
    settings: &MigrationSettings,
    damp: bool,
) -> Result<RunOutcome> {
    let files = load_migrations(settings)?;
    let migrations: Vec<_> = files.into_iter().map(|f| f.migration).collect();

    if damp {
        println!("Damp run: applying {} migration(s) and rolling back...", migrations.len());
    } else {
        println!("Applying migrations...");
    }

    let outcome = migrator(settings)
        .execute(executor, &migrations, !damp)
        .map_err(surface)?;
    print_steps(&outcome);

    if damp {
        println!("{}", "Damp run successful.".green());
    } else {
        println!("{}", "Migrations complete.".green());
    }
    Ok(outcome)
}

/// Revert the newest `steps` applied migrations
pub fn handle_rollback(
    executor: &dyn TideExecutor,
    settings: &MigrationSettings,
    steps: usize,
    damp: bool,
) -> Result<RunOutcome> {
    let files = load_migrations(settings)?;
    let migrations: Vec<_> = files.into_iter().map(|f| f.migration).collect();

    println!("Rolling back {steps} migration(s)...");
    let outcome = migrator(settings)
        .revert(executor, &migrations, steps, !damp)
        .map_err(surface)?;
    print_steps(&outcome);

    if outcome.steps.is_empty() {
        println!("{}", "No migrations to roll back".green());
    } else if damp {
        println!("{}", "Damp run successful.".green());
    } else {
        println!(
            "{}",
            format!("Rolled back {} migration(s)", outcome.reverted().len()).green()
        );
    }
    Ok(outcome)
}

/// Show applied, pending and orphaned migrations
pub fn handle_status(executor: &dyn TideExecutor, settings: &MigrationSettings) -> Result<()> {
    let files = load_migrations(settings)?;
    let migrations: Vec<_> = files.iter().map(|f| f.migration.clone()).collect();
    let status = migrator(settings).status(executor, &migrations)?;

    println!("\n{}\n", "Migration Status".bold());

    if status.applied.is_empty() {
        println!("Applied Migrations: None");
    } else {
        println!("Applied Migrations ({}):", status.applied_count);
        for entry in &status.applied {
            println!(
                "  {} {} ({})",
                "✓".green(),
                entry.identity,
                entry.applied_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    println!();

    if status.pending.is_empty() {
        println!("Pending Migrations: None");
    } else {
        println!("Pending Migrations ({}):", status.pending_count);
        for pending in &status.pending {
            let name = files
                .iter()
                .find(|f| f.serial == pending.serial)
                .and_then(|f| f.name.as_deref())
                .map(|n| format!(" {n}"))
                .unwrap_or_default();
            println!("  {} {}{}", "…".yellow(), pending.identity, name);
        }
    }

    if !status.orphaned.is_empty() {
        println!();
        println!(
            "{}",
            format!("Recorded without a migration file ({}):", status.orphaned.len()).yellow()
        );
        for entry in &status.orphaned {
            println!("  {} {}", "?".yellow(), entry.identity);
        }
    }

    println!(
        "\nSummary: {} applied, {} pending",
        status.applied_count, status.pending_count
    );
    Ok(())
}

/// Write a new migration file from the configured template
pub fn handle_create(settings: &MigrationSettings, generator: &ScaffoldGenerator) -> Result<PathBuf> {
    let template = settings.template().with_context(|| {
        format!(
            "Failed to read migration template {}",
            settings
                .migration_template
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )
    })?;

    let path = generator.create(&settings.migrations_folder, &template)?;
    println!("{} {}", "Created migration".green(), path.display());
    Ok(path)
}

/// Message shown when a migrate or rollback command fails
#[must_use]
pub fn failure_message(error: &anyhow::Error) -> &'static str {
    match error.downcast_ref::<MigrationError>() {
        Some(e) if !e.changes_reverted() => {
            "An error occurred while running migrations. Changes may NOT have been reverted; \
             inspect the database manually."
        }
        _ => "An error occurred while running migrations. All changes have been reverted.",
    }
}
