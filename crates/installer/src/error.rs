//! Error types for the installer.

use std::time::Duration;

use thiserror::Error;

/// Typed failures the driver and `main` need to tell apart.
#[derive(Debug, Error)]
pub enum InstallError {
    /// An external command ran but exited unsuccessfully.
    #[error("`{command}` failed (exit code {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: String,
        stderr: String,
    },

    /// An external command could not be started at all.
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// One or more preflight checks hard-failed.
    #[error("Preflight checks failed: {}", failures.join("; "))]
    PreflightFailed { failures: Vec<String> },

    /// A version string could not be normalized.
    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    /// Neither the compose plugin nor a standalone binary is available.
    #[error("Docker Compose not found. Install the compose plugin or docker-compose")]
    ComposeNotFound,

    /// The health endpoint did not report healthy in time.
    #[error("Health check did not pass within {}s", waited.as_secs())]
    HealthCheckTimeout { waited: Duration },

    /// Cleanup already ran, so no further stage may touch the stack.
    #[error("Installation interrupted")]
    Interrupted,
}
