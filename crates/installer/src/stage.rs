//! Shared types for pipeline stages.

use std::fmt;

use anyhow::Result;
use tracing::debug;

use crate::config::InstallConfig;
use crate::runner::{self, CommandOutput, CommandRunner, CommandSpec, Compose};

/// What a stage did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Work was performed.
    Done(String),
    /// Nothing needed doing.
    Skipped(String),
    /// The stage finished but the operator should look at something.
    Warned(String),
}

impl StageOutcome {
    /// The message carried by the outcome.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Done(m) | Self::Skipped(m) | Self::Warned(m) => m,
        }
    }

    /// Whether this outcome should appear in the final warnings summary.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warned(_))
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Everything a stage needs to talk to the engine.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    /// Immutable run configuration.
    pub config: &'a InstallConfig,
    /// Command execution seam.
    pub runner: &'a dyn CommandRunner,
    /// Detected compose invocation.
    pub compose: &'a Compose,
}

impl<'a> StageContext<'a> {
    /// Bundle the pieces for a stage.
    #[must_use]
    pub fn new(
        config: &'a InstallConfig,
        runner: &'a dyn CommandRunner,
        compose: &'a Compose,
    ) -> Self {
        Self {
            config,
            runner,
            compose,
        }
    }

    /// A `docker` command with the run's environment.
    #[must_use]
    pub fn docker<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        runner::docker(&self.config.env, args)
    }

    /// Run a command that must succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot start or exits non-zero.
    pub fn checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.runner.run_checked(spec)
    }

    /// Run a command whose failure is acceptable.
    ///
    /// # Errors
    ///
    /// Returns an error only if the command cannot start.
    pub fn tolerated(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.runner.run(spec)?;
        if !output.success() {
            debug!(command = %spec, code = ?output.code, "Tolerated command failure");
        }
        Ok(output)
    }
}
