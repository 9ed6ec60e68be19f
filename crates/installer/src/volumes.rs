//! Named volumes that outlive the containers.

use anyhow::{Context, Result};
use tracing::info;

use crate::stage::{StageContext, StageOutcome};

/// Volumes the stack expects to exist before it is started.
pub const REQUIRED_VOLUMES: [&str; 7] = [
    "sentry-data",
    "sentry-postgres",
    "sentry-redis",
    "sentry-zookeeper",
    "sentry-kafka",
    "sentry-clickhouse",
    "sentry-symbolicator",
];

/// Whether a named volume exists.
///
/// # Errors
///
/// Returns an error if the engine cannot be reached.
pub fn volume_exists(ctx: &StageContext<'_>, name: &str) -> Result<bool> {
    Ok(ctx
        .runner
        .run(&ctx.docker(["volume", "inspect", name]))?
        .success())
}

/// Create `name` unless it already exists. Returns `true` if created.
///
/// # Errors
///
/// Returns an error if creation fails.
pub fn ensure_volume(ctx: &StageContext<'_>, name: &str) -> Result<bool> {
    if volume_exists(ctx, name)? {
        return Ok(false);
    }
    ctx.checked(&ctx.docker(["volume", "create", "--name", name]))
        .with_context(|| format!("Failed to create volume {name}"))?;
    info!(volume = name, "Created volume");
    Ok(true)
}

/// Create every required volume that is missing.
///
/// # Errors
///
/// Returns an error if any volume cannot be created.
pub fn create_volumes(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let mut created = Vec::new();
    for name in REQUIRED_VOLUMES {
        if ensure_volume(ctx, name)? {
            created.push(name);
        }
    }

    if created.is_empty() {
        Ok(StageOutcome::Skipped("All volumes already exist".into()))
    } else {
        Ok(StageOutcome::Done(format!(
            "Created volumes: {}",
            created.join(", ")
        )))
    }
}
