//! External command execution.
//!
//! Every interaction with the container engine goes through the
//! [`CommandRunner`] trait so the pipeline can be driven against a simulated
//! engine in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::process::{Command, Stdio};

use anyhow::Result;
use tracing::debug;

use crate::error::InstallError;

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
    /// Inherit the terminal instead of capturing output.
    pub interactive: bool,
}

impl CommandSpec {
    /// Start a new command for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            interactive: false,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Attach environment variables.
    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Run attached to the user's terminal.
    #[must_use]
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// The command line as a single string, for logs and matching.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output (empty for interactive commands).
    pub stdout: String,
    /// Captured standard error (empty for interactive commands).
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert a non-zero exit into [`InstallError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the command did not succeed.
    pub fn into_result(self, spec: &CommandSpec) -> Result<Self, InstallError> {
        if self.success() {
            return Ok(self);
        }
        Err(InstallError::CommandFailed {
            command: spec.command_line(),
            code: self
                .code
                .map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr: self.stderr.trim().to_string(),
        })
    }
}

/// Something that can execute external commands.
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion.
    ///
    /// A non-zero exit is not an error at this level; callers decide whether
    /// a failure is tolerable.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be launched.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run `spec` and require it to succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be launched or exits non-zero.
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        Ok(self.run(spec)?.into_result(spec)?)
    }
}

/// Runs commands on the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "Running command");

        let mut command = Command::new(&spec.program);
        command.args(&spec.args).envs(&spec.env);

        let spawn_err = |source: std::io::Error| InstallError::Spawn {
            program: spec.program.clone(),
            source,
        };

        if spec.interactive {
            let status = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(spawn_err)?;
            return Ok(CommandOutput {
                code: status.code(),
                ..CommandOutput::default()
            });
        }

        let output = command
            .stdin(Stdio::null())
            .output()
            .map_err(spawn_err)?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How compose is invoked on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compose {
    program: String,
    prefix: Vec<String>,
    env: BTreeMap<String, String>,
}

impl Compose {
    /// Use the `docker compose` plugin.
    #[must_use]
    pub fn plugin(env: BTreeMap<String, String>) -> Self {
        Self {
            program: "docker".into(),
            prefix: vec!["compose".into()],
            env,
        }
    }

    /// Use a standalone `docker-compose` binary.
    #[must_use]
    pub fn standalone(env: BTreeMap<String, String>) -> Self {
        Self {
            program: "docker-compose".into(),
            prefix: Vec::new(),
            env,
        }
    }

    /// Find a working compose and report its version.
    ///
    /// The plugin is preferred; the standalone binary is used only if it is
    /// on `PATH` and answers a version query.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::ComposeNotFound`] if neither is usable.
    pub fn detect(
        runner: &dyn CommandRunner,
        env: &BTreeMap<String, String>,
    ) -> Result<(Self, String)> {
        let plugin = Self::plugin(env.clone());
        if let Ok(output) = runner.run(&plugin.command(["version", "--short"])) {
            if output.success() && !output.stdout.trim().is_empty() {
                return Ok((plugin, output.stdout.trim().to_string()));
            }
        }

        if which::which("docker-compose").is_ok() {
            let standalone = Self::standalone(env.clone());
            let output = runner.run(&standalone.command(["version", "--short"]))?;
            if output.success() {
                return Ok((standalone, output.stdout.trim().to_string()));
            }
        }

        Err(InstallError::ComposeNotFound.into())
    }

    /// How a human would type this compose on the command line.
    #[must_use]
    pub fn display_name(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.prefix.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A compose command with the given arguments.
    #[must_use]
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.program)
            .args(self.prefix.iter().cloned())
            .args(args)
            .envs(&self.env)
    }

    /// `compose run --rm <args>`.
    #[must_use]
    pub fn run_rm<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command(["run", "--rm"]).args(args)
    }

    /// `compose config --services`.
    #[must_use]
    pub fn services(&self) -> CommandSpec {
        self.command(["config", "--services"])
    }
}

/// A plain `docker` command carrying the merged environment.
#[must_use]
pub fn docker<I, S>(env: &BTreeMap<String, String>, args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new("docker").args(args).envs(env)
}
