//! One-way upgrade of the legacy Postgres data format.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::stage::StageContext;
use crate::ui;
use crate::volumes;

/// Volume holding the database.
pub const POSTGRES_VOLUME: &str = "sentry-postgres";
/// Scratch volume the upgraded cluster is written to.
pub const UPGRADE_VOLUME: &str = "sentry-postgres-new";
/// On-disk format that must be upgraded.
pub const LEGACY_VERSION: &str = "9.5";
/// Image that performs the upgrade.
pub const UPGRADE_IMAGE: &str = "tianon/postgres-upgrade:9.5-to-9.6";
/// Access rule the upgrade image does not carry over.
pub const TRUST_RULE: &str = "host all all all trust";

/// What the format probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostgresFormat {
    /// No data yet; the server will initialize a current cluster.
    Empty,
    /// Data in a supported format.
    Current(String),
    /// Data that was upgraded during this run.
    Upgraded,
}

/// Read `PG_VERSION` from the database volume, if there is one.
///
/// # Errors
///
/// Returns an error if the engine cannot be reached.
pub fn data_version(ctx: &StageContext<'_>) -> Result<Option<String>> {
    if !volumes::volume_exists(ctx, POSTGRES_VOLUME)? {
        return Ok(None);
    }
    let mount = format!("{POSTGRES_VOLUME}:/db");
    let output = ctx.tolerated(&ctx.docker([
        "run",
        "--rm",
        "-v",
        mount.as_str(),
        "busybox",
        "cat",
        "/db/PG_VERSION",
    ]))?;
    let version = output.stdout.trim();
    Ok((output.success() && !version.is_empty()).then(|| version.to_string()))
}

/// Upgrade the database volume if it holds the legacy format.
///
/// # Errors
///
/// Returns an error if any upgrade command fails. There is no rollback once
/// the old volume has been removed.
pub fn upgrade_if_needed(ctx: &StageContext<'_>) -> Result<PostgresFormat> {
    let Some(version) = data_version(ctx)? else {
        return Ok(PostgresFormat::Empty);
    };
    if version != LEGACY_VERSION {
        return Ok(PostgresFormat::Current(version));
    }

    warn!(version = %version, "Legacy Postgres data found, upgrading");
    ui::print_warning(&format!(
        "Upgrading Postgres data from {LEGACY_VERSION}. This cannot be undone."
    ));

    ctx.tolerated(&ctx.docker(["volume", "rm", UPGRADE_VOLUME]))?;

    let old = format!("{POSTGRES_VOLUME}:/var/lib/postgresql/9.5/data");
    let new = format!("{UPGRADE_VOLUME}:/var/lib/postgresql/9.6/data");
    ctx.checked(&ctx.docker([
        "run",
        "--rm",
        "-v",
        old.as_str(),
        "-v",
        new.as_str(),
        UPGRADE_IMAGE,
    ]))
    .context("Postgres upgrade container failed")?;

    // Volumes cannot be renamed, so recreate the old name and copy back.
    ctx.checked(&ctx.docker(["volume", "rm", POSTGRES_VOLUME]))
        .context("Failed to remove the old Postgres volume")?;
    ctx.checked(&ctx.docker(["volume", "create", "--name", POSTGRES_VOLUME]))
        .context("Failed to recreate the Postgres volume")?;

    let from = format!("{UPGRADE_VOLUME}:/from");
    let to = format!("{POSTGRES_VOLUME}:/to");
    let copy = format!("cd /from ; cp -a . /to ; echo '{TRUST_RULE}' >> /to/pg_hba.conf");
    ctx.checked(&ctx.docker([
        "run",
        "--rm",
        "-v",
        from.as_str(),
        "-v",
        to.as_str(),
        "alpine",
        "ash",
        "-c",
        copy.as_str(),
    ]))
    .context("Failed to copy upgraded Postgres data")?;

    ctx.checked(&ctx.docker(["volume", "rm", UPGRADE_VOLUME]))
        .context("Failed to remove the scratch Postgres volume")?;

    info!("Postgres data upgraded");
    Ok(PostgresFormat::Upgraded)
}
