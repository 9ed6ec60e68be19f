//! Taking the stack down and bringing it back up.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{BringUpMode, EDGE_SERVICES, LEGACY_PROJECT_NAME};
use crate::error::InstallError;
use crate::runner::CommandSpec;
use crate::stage::{StageContext, StageOutcome};
use crate::ui;

/// Liveness endpoint of the web service, as seen from the stack network.
pub const HEALTH_URL: &str = "http://web:9000/_health/";
/// Body the endpoint returns once the web tier is serving.
pub const HEALTHY_BODY: &str = "ok";

/// Services compose knows about for this project.
///
/// # Errors
///
/// Returns an error if compose cannot render the configuration.
pub fn stack_services(ctx: &StageContext<'_>) -> Result<Vec<String>> {
    let output = ctx
        .checked(&ctx.compose.services())
        .context("Failed to list compose services")?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// Every service except the edge ones that keep serving during an upgrade.
#[must_use]
pub fn non_edge_services(services: &[String]) -> Vec<String> {
    services
        .iter()
        .filter(|s| !EDGE_SERVICES.contains(&s.as_str()))
        .cloned()
        .collect()
}

/// Stop what the previous deployment left running.
///
/// # Errors
///
/// Returns an error if compose fails to remove containers.
pub fn teardown(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let timeout = ctx.config.stop_timeout_secs.to_string();

    match ctx.config.mode {
        BringUpMode::FullStop => {
            // Deployments from before the project rename run under the old name.
            ctx.tolerated(&ctx.compose.command([
                "-p",
                LEGACY_PROJECT_NAME,
                "down",
                "-t",
                timeout.as_str(),
                "--rmi",
                "local",
                "--remove-orphans",
            ]))?;
            ctx.checked(&ctx.compose.command([
                "down",
                "-t",
                timeout.as_str(),
                "--rmi",
                "local",
                "--remove-orphans",
            ]))
            .context("Failed to stop running services")?;
            info!("All services stopped");
            Ok(StageOutcome::Done("Stopped all services".into()))
        }
        BringUpMode::MinimizeDowntime => {
            let services = non_edge_services(&stack_services(ctx)?);
            if services.is_empty() {
                return Ok(StageOutcome::Skipped("No services to remove".into()));
            }
            ctx.checked(&ctx.compose.command(["rm", "-fsv"]).args(services.iter().cloned()))
                .context("Failed to remove services")?;
            info!(count = services.len(), "Removed services, edge services kept running");
            Ok(StageOutcome::Done(format!(
                "Removed all services except {}",
                EDGE_SERVICES.join(" and ")
            )))
        }
    }
}

/// Bring the stack up.
///
/// In full-stop mode nothing is started here; the operator is told how to
/// start the stack. In minimize-downtime mode the edge services are switched
/// over once the web tier reports healthy.
///
/// # Errors
///
/// Returns an error if compose fails or the health wait times out.
pub async fn start(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    match ctx.config.mode {
        BringUpMode::FullStop => {
            ui::print_success("You're all done! Run the following command to get Sentry running:");
            ui::print_command(&format!("{} up -d", ctx.compose.display_name()));
            Ok(StageOutcome::Done("Ready to start".into()))
        }
        BringUpMode::MinimizeDowntime => {
            let services = non_edge_services(&stack_services(ctx)?);
            ctx.checked(
                &ctx.compose
                    .command(["up", "-d", "--remove-orphans"])
                    .args(services.iter().cloned()),
            )
            .context("Failed to start services")?;

            let mut warning = None;
            let reload = ctx.tolerated(
                &ctx.compose
                    .command(["exec", "-T", "nginx", "nginx", "-s", "reload"]),
            )?;
            if !reload.success() {
                warn!(stderr = %reload.stderr.trim(), "nginx reload failed");
                warning = Some("nginx could not be reloaded; it will be recreated".to_string());
            }

            let waited = wait_for_health(ctx).await?;
            info!(waited_secs = waited.as_secs(), "Web service is healthy");

            ctx.checked(&ctx.compose.command(["up", "-d"]))
                .context("Failed to start edge services")?;
            ui::print_success("Sentry is up and running");

            Ok(match warning {
                Some(w) => StageOutcome::Warned(w),
                None => StageOutcome::Done("Services started with minimal downtime".into()),
            })
        }
    }
}

/// The one-off container that probes the health endpoint.
#[must_use]
pub fn health_probe(ctx: &StageContext<'_>) -> CommandSpec {
    let network = ctx.config.default_network();
    ctx.docker([
        "run",
        "--rm",
        "--network",
        network.as_str(),
        "alpine",
        "wget",
        "-T",
        "1",
        "-q",
        "-O-",
        HEALTH_URL,
    ])
}

/// Poll the health endpoint until it answers [`HEALTHY_BODY`].
///
/// Waits forever unless a health-check timeout is configured.
///
/// # Errors
///
/// Returns [`InstallError::HealthCheckTimeout`] once the configured timeout
/// passes, or an error if the probe cannot be launched.
pub async fn wait_for_health(ctx: &StageContext<'_>) -> Result<Duration> {
    let probe = health_probe(ctx);
    let started = Instant::now();
    let spinner = ui::spinner("Waiting for Sentry to start");

    loop {
        let output = ctx.runner.run(&probe)?;
        if output.success() && output.stdout.trim() == HEALTHY_BODY {
            spinner.finish_and_clear();
            return Ok(started.elapsed());
        }

        let waited = started.elapsed();
        if let Some(limit) = ctx.config.health_check_timeout {
            if waited >= limit {
                spinner.finish_and_clear();
                return Err(InstallError::HealthCheckTimeout { waited }.into());
            }
        }

        tokio::time::sleep(ctx.config.health_check_interval).await;
    }
}
