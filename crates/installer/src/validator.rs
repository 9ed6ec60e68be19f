//! Host prerequisite checks.
//!
//! Facts about the host are gathered through the container engine (so they
//! describe the machine containers will actually run on) and then judged by
//! pure functions. Hard failures abort the installation; soft shortfalls only
//! warn.

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{info, warn};

use crate::config::Requirements;
use crate::error::InstallError;
use crate::runner::{docker, CommandRunner};
use crate::ui;
use crate::version;

/// Severity of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    /// Requirement met.
    Pass,
    /// Below the recommendation; installation continues.
    Warn,
    /// Below the minimum; installation aborts.
    Fail,
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// What was checked.
    pub name: String,
    /// Outcome.
    pub level: CheckLevel,
    /// Human-readable details.
    pub message: String,
}

impl CheckResult {
    fn new(name: &str, level: CheckLevel, message: String) -> Self {
        Self {
            name: name.to_string(),
            level,
            message,
        }
    }
}

/// Raw facts reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    /// Docker server version.
    pub docker_version: String,
    /// Docker Compose version.
    pub compose_version: String,
    /// CPU cores available to containers.
    pub cpus: u32,
    /// RAM available to containers, in MB.
    pub ram_mb: u64,
    /// Whether `/proc/cpuinfo` carries the required flag.
    pub has_cpu_flag: bool,
    /// Whether the host is a guest known to misreport CPU flags.
    pub virtualized_guest: bool,
}

/// Compare a reported tool version against its minimum.
#[must_use]
pub fn check_version(tool: &str, found: &str, minimum: &str) -> CheckResult {
    match version::is_at_least(found, minimum) {
        Ok(true) => CheckResult::new(tool, CheckLevel::Pass, found.to_string()),
        Ok(false) => CheckResult::new(
            tool,
            CheckLevel::Fail,
            format!("Minimum {tool} version required is {minimum}, found {found}"),
        ),
        Err(e) => CheckResult::new(tool, CheckLevel::Fail, e.to_string()),
    }
}

/// Judge the CPU count.
#[must_use]
pub fn check_cpu(cpus: u32, req: &Requirements) -> CheckResult {
    const NAME: &str = "CPU cores";
    if cpus < req.min_cpu_hard {
        CheckResult::new(
            NAME,
            CheckLevel::Fail,
            format!(
                "Required minimum CPU cores available to Docker is {}, found {cpus}",
                req.min_cpu_hard
            ),
        )
    } else if cpus < req.min_cpu_soft {
        CheckResult::new(
            NAME,
            CheckLevel::Warn,
            format!(
                "Recommended minimum CPU cores available to Docker is {}, found {cpus}",
                req.min_cpu_soft
            ),
        )
    } else {
        CheckResult::new(NAME, CheckLevel::Pass, format!("{cpus}"))
    }
}

/// Judge the RAM size.
#[must_use]
pub fn check_ram(ram_mb: u64, req: &Requirements) -> CheckResult {
    const NAME: &str = "RAM";
    if ram_mb < req.min_ram_hard_mb {
        CheckResult::new(
            NAME,
            CheckLevel::Fail,
            format!(
                "Required minimum RAM available to Docker is {} MB, found {ram_mb} MB",
                req.min_ram_hard_mb
            ),
        )
    } else if ram_mb < req.min_ram_soft_mb {
        CheckResult::new(
            NAME,
            CheckLevel::Warn,
            format!(
                "Recommended minimum RAM available to Docker is {} MB, found {ram_mb} MB",
                req.min_ram_soft_mb
            ),
        )
    } else {
        CheckResult::new(NAME, CheckLevel::Pass, format!("{ram_mb} MB"))
    }
}

/// Judge the instruction-set support.
///
/// Skipped on virtualised guests, which may hide the flag even when the
/// physical CPU supports it.
#[must_use]
pub fn check_instruction_set(
    has_flag: bool,
    virtualized_guest: bool,
    req: &Requirements,
) -> CheckResult {
    let name = format!("{} support", req.required_cpu_flag.to_uppercase());
    if virtualized_guest {
        return CheckResult::new(
            &name,
            CheckLevel::Pass,
            "skipped on virtualised guest".into(),
        );
    }
    if has_flag {
        return CheckResult::new(&name, CheckLevel::Pass, String::new());
    }
    CheckResult::new(
        &name,
        CheckLevel::Fail,
        format!(
            "The CPU does not support the {} instruction set, which ClickHouse requires",
            req.required_cpu_flag
        ),
    )
}

/// Every check for a set of host facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    /// Individual results, in check order.
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Evaluate all checks.
    #[must_use]
    pub fn evaluate(facts: &HostFacts, req: &Requirements) -> Self {
        Self {
            checks: vec![
                check_version("Docker", &facts.docker_version, &req.min_docker_version),
                check_version(
                    "Docker Compose",
                    &facts.compose_version,
                    &req.min_compose_version,
                ),
                check_cpu(facts.cpus, req),
                check_ram(facts.ram_mb, req),
                check_instruction_set(facts.has_cpu_flag, facts.virtualized_guest, req),
            ],
        }
    }

    /// Checks with the given level.
    pub fn with_level(&self, level: CheckLevel) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(move |c| c.level == level)
    }

    /// Whether any check hard-failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.with_level(CheckLevel::Fail).next().is_some()
    }

    /// Print every result.
    pub fn print(&self) {
        for check in &self.checks {
            let detail = (!check.message.is_empty()).then_some(check.message.as_str());
            match check.level {
                CheckLevel::Pass => ui::print_check_result(&check.name, true, detail),
                CheckLevel::Fail => ui::print_check_result(&check.name, false, detail),
                CheckLevel::Warn => println!(
                    "  {} {} - {}",
                    "⚠".yellow(),
                    check.name.yellow(),
                    check.message.bright_black()
                ),
            }
        }
    }

    /// Turn hard failures into an error, returning the warnings otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::PreflightFailed`] if any check failed.
    pub fn into_result(self) -> Result<Vec<String>, InstallError> {
        let failures: Vec<String> = self
            .with_level(CheckLevel::Fail)
            .map(|c| c.message.clone())
            .collect();
        if !failures.is_empty() {
            return Err(InstallError::PreflightFailed { failures });
        }
        Ok(self
            .with_level(CheckLevel::Warn)
            .map(|c| c.message.clone())
            .collect())
    }
}

/// Parse the "Mem:" total out of `free -m` output.
#[must_use]
pub fn parse_free_total_mb(output: &str) -> Option<u64> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("Mem:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|total| total.parse().ok())
}

/// Parse a `grep -c` count; an empty or unparsable count is zero.
#[must_use]
pub fn parse_count(output: &str) -> u64 {
    output.trim().parse().unwrap_or(0)
}

/// Gathers host facts through the container engine.
pub struct PrerequisitesValidator<'a> {
    runner: &'a dyn CommandRunner,
    env: &'a std::collections::BTreeMap<String, String>,
}

impl<'a> PrerequisitesValidator<'a> {
    /// Create a validator using `runner`.
    #[must_use]
    pub fn new(
        runner: &'a dyn CommandRunner,
        env: &'a std::collections::BTreeMap<String, String>,
    ) -> Self {
        Self { runner, env }
    }

    /// Collect facts. `compose_version` comes from compose detection.
    ///
    /// # Errors
    ///
    /// Returns an error if Docker cannot be reached or a probe gives unusable
    /// output.
    pub fn gather(&self, compose_version: &str, req: &Requirements) -> Result<HostFacts> {
        let docker_version = self
            .runner
            .run_checked(&docker(
                self.env,
                ["version", "--format", "{{.Server.Version}}"],
            ))
            .context("Failed to query the Docker server version. Is Docker installed and running?")?
            .stdout
            .trim()
            .to_string();

        let cpus = self
            .busybox(["nproc", "--all"])?
            .trim()
            .parse::<u32>()
            .context("Unexpected output from nproc")?;

        let ram_mb = parse_free_total_mb(&self.busybox(["free", "-m"])?)
            .context("Unexpected output from free -m")?;

        // grep -c exits non-zero when the count is zero, so only stdout matters.
        let virtualized_guest = parse_count(&self.busybox_any([
            "grep",
            "-c",
            req.virtualized_guest_marker.as_str(),
            "/proc/cpuinfo",
        ])?) > 0;
        let has_cpu_flag = virtualized_guest
            || parse_count(&self.busybox_any([
                "grep",
                "-c",
                req.required_cpu_flag.as_str(),
                "/proc/cpuinfo",
            ])?) > 0;

        let facts = HostFacts {
            docker_version,
            compose_version: compose_version.to_string(),
            cpus,
            ram_mb,
            has_cpu_flag,
            virtualized_guest,
        };
        info!(?facts, "Gathered host facts");
        Ok(facts)
    }

    /// Gather facts, print the report and fail on hard shortfalls.
    ///
    /// Returns the soft warnings.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::PreflightFailed`] if any hard check fails.
    pub fn validate(&self, compose_version: &str, req: &Requirements) -> Result<Vec<String>> {
        let facts = self.gather(compose_version, req)?;
        let report = PreflightReport::evaluate(&facts, req);

        println!();
        report.print();
        println!();

        let warnings = report.into_result()?;
        for w in &warnings {
            warn!(warning = %w, "Preflight warning");
        }
        if warnings.is_empty() {
            ui::print_success("All prerequisites met!");
        }
        Ok(warnings)
    }

    fn busybox<const N: usize>(&self, args: [&str; N]) -> Result<String> {
        let spec = docker(self.env, ["run", "--rm", "busybox"]).args(args);
        Ok(self.runner.run_checked(&spec)?.stdout)
    }

    fn busybox_any<const N: usize>(&self, args: [&str; N]) -> Result<String> {
        let spec = docker(self.env, ["run", "--rm", "busybox"]).args(args);
        Ok(self.runner.run(&spec)?.stdout)
    }
}
