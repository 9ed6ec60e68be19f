//! Pulling and building images.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::stage::{StageContext, StageOutcome};
use crate::ui;

/// Images built locally carry this in their name; pulling them always fails.
pub const LOCAL_IMAGE_MARKER: &str = "-self-hosted-local";

/// Drop pull noise about images that are only ever built locally.
#[must_use]
pub fn filter_pull_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.contains(LOCAL_IMAGE_MARKER))
        .map(str::to_string)
        .collect()
}

/// Pull every image, then build the local ones.
///
/// Pull failures are tolerated; a failed build is not.
///
/// # Errors
///
/// Returns an error if the build fails.
pub fn fetch_images(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    ui::print_info("Pulling images...");
    let pull = ctx.tolerated(
        &ctx.compose
            .command(["pull", "--quiet", "--ignore-pull-failures"]),
    )?;
    let combined = format!("{}{}", pull.stdout, pull.stderr);
    let noise = filter_pull_output(&combined);
    if !noise.is_empty() {
        ui::print_block(&noise);
    }

    // A custom SENTRY_IMAGE may only exist locally.
    let sentry = ctx.tolerated(&ctx.docker(["pull", ctx.config.sentry_image.as_str()]))?;
    let mut warned = None;
    if !sentry.success() {
        warn!(image = %ctx.config.sentry_image, "Could not pull Sentry image, using local copy");
        warned = Some(format!(
            "Could not pull {}; a locally available image will be used",
            ctx.config.sentry_image
        ));
    }

    ui::print_info("Building and tagging Docker images...");
    ctx.checked(&ctx.compose.command(["build", "--force-rm"]))
        .context("Failed to build images")?;
    info!("Docker images built");

    Ok(match warned {
        Some(message) => StageOutcome::Warned(message),
        None => StageOutcome::Done("Docker images pulled and built".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_images_filtered() {
        let output = "\
Pulling web ... done
ERROR: pull access denied for sentry-self-hosted-local, repository does not exist

WARNING: Some service image(s) must be built from source
";
        let lines = filter_pull_output(output);
        assert_eq!(
            lines,
            vec![
                "Pulling web ... done".to_string(),
                "WARNING: Some service image(s) must be built from source".to_string(),
            ]
        );
    }
}
