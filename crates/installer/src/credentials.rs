//! Relay credentials.

use anyhow::{Context, Result};
use tracing::info;

use crate::fsutil;
use crate::stage::{StageContext, StageOutcome};

/// Check that generated credentials are a JSON object.
///
/// # Errors
///
/// Returns an error if `raw` is not a JSON object.
pub fn parse_credentials(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(raw.trim()).context("Relay did not print valid JSON credentials")?;
    if !value.is_object() {
        anyhow::bail!("Relay credentials are not a JSON object");
    }
    Ok(value)
}

/// Generate `relay/credentials.json` unless it already exists.
///
/// # Errors
///
/// Returns an error if relay fails or prints something other than JSON.
pub fn ensure_relay_credentials(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let path = ctx.config.relay_credentials_json();
    if path.exists() {
        return Ok(StageOutcome::Skipped(format!(
            "{} already exists",
            path.display()
        )));
    }

    let mount = format!("{}:/tmp/config.yml", ctx.config.relay_config_yml().display());
    let output = ctx
        .checked(&ctx.compose.run_rm([
            "--no-deps",
            "-v",
            mount.as_str(),
            "relay",
            "--config",
            "/tmp",
            "credentials",
            "generate",
            "--stdout",
        ]))
        .context("Failed to generate Relay credentials")?;

    let credentials = parse_credentials(&output.stdout)?;
    let mut contents = serde_json::to_string_pretty(&credentials)?;
    contents.push('\n');
    fsutil::write_atomic(&path, contents.as_bytes())?;

    info!(file = %path.display(), "Relay credentials written");
    Ok(StageOutcome::Done(format!(
        "Relay credentials written to {}",
        path.display()
    )))
}
