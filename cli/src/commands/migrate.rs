// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Database Migrate Command
//!
//! Applies the schema migrations embedded in `ea-licensing-core` to the
//! PostgreSQL database named by `spec.store.database_url`
//! (or `EA_LICENSING_DATABASE_URL`).
//!
//! # Usage
//!
//! ```bash
//! # Apply all pending migrations
//! ea-licensing migrate
//!
//! # Preview migrations without applying
//! ea-licensing migrate --dry-run
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use ea_licensing_core::domain::config::LicensingConfigManifest;
use ea_licensing_core::infrastructure::db::{Database, MIGRATOR};

#[derive(Args)]
pub struct MigrateCommand {
    /// Perform a dry run without applying changes
    #[arg(long)]
    dry_run: bool,
}

pub async fn execute(cmd: MigrateCommand, config: LicensingConfigManifest) -> Result<()> {
    println!("{}", "EA Licensing Migrate".bold().green());

    let database_url = config
        .spec
        .store
        .database_url
        .as_deref()
        .context("No database URL configured. Set spec.store.database_url or EA_LICENSING_DATABASE_URL.")?;

    println!("Connecting to database...");
    let database = Database::new(database_url, 1).await?;

    let total = MIGRATOR.iter().count();
    let pending = database.pending_migrations().await?;
    println!(
        "Migration status: {} applied, {} total available.",
        total - pending,
        total
    );

    if pending == 0 {
        println!("{}", "✓ Database is up to date.".green());
        return Ok(());
    }

    if cmd.dry_run {
        println!("Pending migrations found (Dry Run):");
        for migration in MIGRATOR.iter().skip(total - pending) {
            println!(" - {} {}", migration.version, migration.description);
        }
        println!("Skipping application due to --dry-run");
        return Ok(());
    }

    println!("Applying pending migrations...");
    let applied = database.migrate().await?;
    println!(
        "{}",
        format!("✓ Database updated successfully ({} migrations applied).", applied).green()
    );

    Ok(())
}
