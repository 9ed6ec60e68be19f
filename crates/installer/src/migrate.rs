//! Sentry's own database migrations and the first admin account.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing::info;

use crate::stage::{StageContext, StageOutcome};
use crate::ui;

/// Run `web upgrade` and offer to create an admin user.
///
/// The prompt is only offered when prompting is allowed and stdin is a
/// terminal; otherwise the command to create a user later is printed.
///
/// # Errors
///
/// Returns an error if the migration or the account creation fails.
pub fn migrate_database(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ui::print_info("Setting up and migrating the database...");
    ctx.checked(&ctx.compose.run_rm(["web", "upgrade", "--noinput"]))
        .context("Database migration failed")?;
    info!("Database migrated");

    let interactive = !ctx.config.skip_user_prompt && std::io::stdin().is_terminal();
    if !interactive {
        print_createuser_hint(ctx);
        return Ok(StageOutcome::Done(
            "Database migrated; user creation skipped".into(),
        ));
    }

    let create = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Would you like to create a user account now?")
        .default(true)
        .interact()
        .context("Failed to read answer")?;
    if !create {
        print_createuser_hint(ctx);
        return Ok(StageOutcome::Done("Database migrated".into()));
    }

    ctx.checked(&ctx.compose.run_rm(["web", "createuser"]).interactive())
        .context("Failed to create user")?;
    Ok(StageOutcome::Done("Database migrated and user created".into()))
}

fn print_createuser_hint(ctx: &StageContext<'_>) {
    ui::print_info(
        "Did not prompt for user creation. Run the following command to create one \
         yourself (recommended):",
    );
    ui::print_command(&format!(
        "{} run --rm web createuser",
        ctx.compose.display_name()
    ));
}
