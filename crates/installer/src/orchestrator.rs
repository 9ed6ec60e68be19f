//! Installer orchestration module.
//!
//! Runs every stage in order against one immutable configuration:
//! - Preflight checks and compose detection
//! - Volumes, configuration files and the secret key
//! - Legacy settings migration
//! - Images, teardown and the data-plane bootstrap
//! - Database, file storage and credential migrations
//! - Bring-up
//!
//! Every stage is idempotent, so a failed run is fixed by re-running. The
//! ledger records how far a run got and which one-shot migrations are done;
//! the migrations still inspect the volumes and files on every run, since
//! those can change underneath the checkout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::{BringUpMode, InstallConfig};
use crate::error::InstallError;
use crate::file_layout::{self, ContainerVolume, LayoutMigration};
use crate::postgres::{self, PostgresFormat};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, Compose};
use crate::settings::{self, TsdbMigration};
use crate::stage::{StageContext, StageOutcome};
use crate::state::{InstallState, InstallStep, Migration};
use crate::templates::{self, Materialized};
use crate::validator::PrerequisitesValidator;
use crate::{credentials, dataplane, images, migrate, secret, services, ui, volumes};

/// Why cleanup was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The pipeline finished.
    Exit,
    /// The pipeline failed in a step.
    Failed(InstallStep),
    /// The process received a signal.
    Signal(&'static str),
}

/// Stops the stack at most once per process.
pub struct Cleanup {
    done: AtomicBool,
    mode: BringUpMode,
    stop_timeout_secs: u64,
    runner: Arc<dyn CommandRunner>,
    compose: OnceLock<Compose>,
}

impl Cleanup {
    /// Create a guard for `config`.
    #[must_use]
    pub fn new(config: &InstallConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            done: AtomicBool::new(false),
            mode: config.mode,
            stop_timeout_secs: config.stop_timeout_secs,
            runner,
            compose: OnceLock::new(),
        }
    }

    /// Remember which compose to stop with. Later calls are ignored.
    pub fn set_compose(&self, compose: Compose) {
        let _ = self.compose.set(compose);
    }

    /// Whether cleanup has already happened.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Run cleanup for `reason`. Returns `false` if it already ran.
    pub fn run(&self, reason: CleanupReason) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }

        match reason {
            CleanupReason::Exit => {}
            CleanupReason::Failed(step) => {
                ui::print_error(&format!("An error occurred during: {step}"));
            }
            CleanupReason::Signal(name) => {
                ui::print_error(&format!("Caught {name}"));
            }
        }

        match self.mode {
            BringUpMode::MinimizeDowntime => {
                if reason != CleanupReason::Exit {
                    ui::print_warning(
                        "*NOT* cleaning up, to clean your environment run \"docker compose stop\".",
                    );
                }
            }
            BringUpMode::FullStop => {
                if reason != CleanupReason::Exit {
                    ui::print_info("Cleaning up...");
                }
                if let Some(compose) = self.compose.get() {
                    let timeout = self.stop_timeout_secs.to_string();
                    let stop = compose.command(["stop", "-t", timeout.as_str()]);
                    if let Err(e) = self.runner.run(&stop) {
                        warn!(error = %e, "Failed to stop services during cleanup");
                    }
                }
            }
        }

        info!(?reason, mode = %self.mode, "Cleanup finished");
        true
    }
}

/// Refuses every command once cleanup has run.
struct GuardedRunner<'a> {
    inner: &'a dyn CommandRunner,
    cleanup: &'a Cleanup,
}

impl CommandRunner for GuardedRunner<'_> {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if self.cleanup.has_run() {
            warn!(command = %spec, "Refusing command after cleanup");
            return Err(InstallError::Interrupted.into());
        }
        self.inner.run(spec)
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Outcome of every stage, in order.
    pub outcomes: Vec<(InstallStep, StageOutcome)>,
    /// Warnings the operator should read.
    pub warnings: Vec<String>,
}

impl RunSummary {
    /// The outcome recorded for `step`.
    #[must_use]
    pub fn outcome(&self, step: InstallStep) -> Option<&StageOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, o)| o)
    }

    fn record(&mut self, step: InstallStep, outcome: StageOutcome) {
        match &outcome {
            StageOutcome::Done(m) => ui::print_success(m),
            StageOutcome::Skipped(m) => ui::print_info(m),
            StageOutcome::Warned(m) => {
                ui::print_warning(m);
                self.warnings.push(m.clone());
            }
        }
        self.outcomes.push((step, outcome));
    }
}

/// Main installer struct that orchestrates the full installation process.
pub struct Installer {
    config: InstallConfig,
    runner: Arc<dyn CommandRunner>,
    cleanup: Arc<Cleanup>,
    state: InstallState,
}

impl Installer {
    /// Create an installer for `config`, loading the ledger if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing ledger cannot be read.
    pub fn new(config: InstallConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let state = InstallState::load_or_new(&config.root)?;
        let cleanup = Arc::new(Cleanup::new(&config, Arc::clone(&runner)));
        Ok(Self {
            config,
            runner,
            cleanup,
            state,
        })
    }

    /// The cleanup guard shared with the signal handler.
    #[must_use]
    pub fn cleanup(&self) -> Arc<Cleanup> {
        Arc::clone(&self.cleanup)
    }

    /// The ledger as it stands.
    #[must_use]
    pub fn state(&self) -> &InstallState {
        &self.state
    }

    /// Run every stage, then clean up once.
    ///
    /// # Errors
    ///
    /// Returns the first stage error. The ledger records the failing step.
    pub async fn run(&mut self) -> Result<RunSummary> {
        if let Some((step, err)) = self.state.begin_run()? {
            ui::print_warning(&format!("The previous run failed during '{step}': {err}"));
        }
        info!(mode = %self.config.mode, root = %self.config.root.display(), "Starting installation");

        let mut summary = RunSummary::default();
        match self.run_stages(&mut summary).await {
            Ok(()) => {
                self.state.set_step(InstallStep::Complete)?;
                self.cleanup.run(CleanupReason::Exit);
                print_summary(&summary);
                Ok(summary)
            }
            Err(e) => {
                let step = self.state.step;
                error!(step = ?step, error = %format!("{e:#}"), "Installation failed");
                if let Err(save) = self.state.record_error(&format!("{e:#}")) {
                    warn!(error = %save, "Failed to record error in state file");
                }
                ui::print_error(&format!("{e:#}"));
                self.cleanup.run(CleanupReason::Failed(step));
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, summary: &mut RunSummary) -> Result<()> {
        let config = &self.config;
        let cleanup = self.cleanup.as_ref();
        let guarded = GuardedRunner {
            inner: self.runner.as_ref(),
            cleanup,
        };
        let runner: &dyn CommandRunner = &guarded;
        let state = &mut self.state;

        enter(state, cleanup, InstallStep::CheckingPrerequisites)?;
        let (compose, compose_version) = Compose::detect(runner, &config.env)?;
        ui::print_kv("Compose", &compose.display_name());
        cleanup.set_compose(compose.clone());
        let preflight_warnings = PrerequisitesValidator::new(runner, &config.env)
            .validate(&compose_version, &config.requirements)?;
        summary.record(
            InstallStep::CheckingPrerequisites,
            StageOutcome::Done("Prerequisites checked".into()),
        );
        summary.warnings.extend(preflight_warnings);

        let ctx = StageContext::new(config, runner, &compose);

        enter(state, cleanup, InstallStep::CreatingVolumes)?;
        summary.record(InstallStep::CreatingVolumes, volumes::create_volumes(&ctx)?);

        enter(state, cleanup, InstallStep::CreatingConfigFiles)?;
        summary.record(InstallStep::CreatingConfigFiles, create_config_files(config)?);

        enter(state, cleanup, InstallStep::GeneratingSecretKey)?;
        let outcome = if secret::ensure_secret_key(&config.sentry_config_yml())? {
            StageOutcome::Done("Secret key written to sentry/config.yml".into())
        } else {
            StageOutcome::Skipped("Secret key already set".into())
        };
        summary.record(InstallStep::GeneratingSecretKey, outcome);

        enter(state, cleanup, InstallStep::MigratingSettings)?;
        summary.record(InstallStep::MigratingSettings, migrate_settings(config, state)?);

        enter(state, cleanup, InstallStep::FetchingImages)?;
        summary.record(InstallStep::FetchingImages, images::fetch_images(&ctx)?);

        enter(state, cleanup, InstallStep::StoppingServices)?;
        summary.record(InstallStep::StoppingServices, services::teardown(&ctx)?);

        enter(state, cleanup, InstallStep::BootstrappingDataPlane)?;
        summary.record(InstallStep::BootstrappingDataPlane, dataplane::bootstrap(&ctx)?);

        enter(state, cleanup, InstallStep::UpgradingDatabase)?;
        summary.record(InstallStep::UpgradingDatabase, upgrade_database(&ctx, state)?);

        enter(state, cleanup, InstallStep::MigratingDatabase)?;
        summary.record(InstallStep::MigratingDatabase, migrate::migrate_database(&ctx)?);

        enter(state, cleanup, InstallStep::MigratingFileStorage)?;
        summary.record(InstallStep::MigratingFileStorage, migrate_file_storage(&ctx, state)?);

        enter(state, cleanup, InstallStep::GeneratingRelayCredentials)?;
        summary.record(
            InstallStep::GeneratingRelayCredentials,
            credentials::ensure_relay_credentials(&ctx)?,
        );

        enter(state, cleanup, InstallStep::StartingServices)?;
        summary.record(InstallStep::StartingServices, services::start(&ctx).await?);

        Ok(())
    }
}

/// Move the ledger to `step`, unless cleanup already ran.
fn enter(state: &mut InstallState, cleanup: &Cleanup, step: InstallStep) -> Result<()> {
    if cleanup.has_run() {
        return Err(InstallError::Interrupted.into());
    }
    debug_assert_eq!(state.step.next(), step, "stages entered out of order");
    ui::print_progress_step(step.step_number(), InstallStep::TOTAL_STEPS, step.description());
    state.set_step(step)
}

fn create_config_files(config: &InstallConfig) -> Result<StageOutcome> {
    let mut created = Vec::new();
    for target in config.templated_files() {
        if templates::ensure_from_example(&target)? == Materialized::Created {
            let shown = target.strip_prefix(&config.root).unwrap_or(&target);
            created.push(shown.display().to_string());
        }
    }

    if created.is_empty() {
        Ok(StageOutcome::Skipped("Configuration files already exist".into()))
    } else {
        Ok(StageOutcome::Done(format!("Created {}", created.join(", "))))
    }
}

fn migrate_settings(config: &InstallConfig, state: &mut InstallState) -> Result<StageOutcome> {
    match settings::migrate_tsdb(&config.sentry_config_py(), chrono::Utc::now())? {
        TsdbMigration::Migrated => {
            state.mark_applied(Migration::TsdbBackend)?;
            Ok(StageOutcome::Done("Migrated SENTRY_TSDB to the Snuba backend".into()))
        }
        TsdbMigration::AlreadyMigrated => {
            state.mark_applied(Migration::TsdbBackend)?;
            Ok(StageOutcome::Skipped("SENTRY_TSDB already uses Snuba".into()))
        }
        TsdbMigration::NotConfigured => {
            Ok(StageOutcome::Skipped("SENTRY_TSDB is not set".into()))
        }
        TsdbMigration::ManualActionRequired {
            reason,
            instructions,
        } => {
            ui::print_warning(&format!(
                "Could not migrate SENTRY_TSDB automatically ({reason}). Replace the SENTRY_TSDB \
                 and SENTRY_TSDB_OPTIONS settings in sentry/sentry.conf.py with:"
            ));
            ui::print_block(&instructions);
            Ok(StageOutcome::Warned(format!(
                "sentry/sentry.conf.py needs a manual SENTRY_TSDB migration: {reason}"
            )))
        }
    }
}

fn upgrade_database(ctx: &StageContext<'_>, state: &mut InstallState) -> Result<StageOutcome> {
    match postgres::upgrade_if_needed(ctx)? {
        PostgresFormat::Empty => Ok(StageOutcome::Skipped("No Postgres data yet".into())),
        PostgresFormat::Current(version) => {
            state.mark_applied(Migration::PostgresUpgrade)?;
            Ok(StageOutcome::Skipped(format!("Postgres data format is {version}")))
        }
        PostgresFormat::Upgraded => {
            state.mark_applied(Migration::PostgresUpgrade)?;
            Ok(StageOutcome::Done("Upgraded Postgres data".into()))
        }
    }
}

fn migrate_file_storage(ctx: &StageContext<'_>, state: &mut InstallState) -> Result<StageOutcome> {
    let volume = ContainerVolume::new(*ctx);
    match file_layout::migrate_file_layout(&volume)? {
        LayoutMigration::Empty => Ok(StageOutcome::Skipped("No stored files yet".into())),
        LayoutMigration::AlreadyNested => {
            state.mark_applied(Migration::FileLayout)?;
            Ok(StageOutcome::Skipped("File storage already nested".into()))
        }
        LayoutMigration::Migrated { moved } => {
            state.mark_applied(Migration::FileLayout)?;
            Ok(StageOutcome::Done(format!(
                "Moved {moved} entries into {}/",
                file_layout::NESTED_DIR
            )))
        }
    }
}

fn print_summary(summary: &RunSummary) {
    if summary.warnings.is_empty() {
        return;
    }
    ui::print_section("Warnings");
    for warning in &summary.warnings {
        ui::print_warning(warning);
    }
}
