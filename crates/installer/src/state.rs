//! Installation state persistence.
//!
//! The ledger records which step a run reached, the last failure, and which
//! one-shot migrations have completed. Stages still inspect the real files and
//! volumes where those are the source of truth; the ledger lets them skip
//! probes once a migration is known to be done and tells the operator where a
//! previous run stopped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fsutil;

/// File name of the ledger inside the checkout.
pub const STATE_FILE: &str = ".install-state.json";

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    /// Not yet started.
    NotStarted,
    /// Checking tool versions and host resources.
    CheckingPrerequisites,
    /// Creating named volumes.
    CreatingVolumes,
    /// Seeding configuration files from templates.
    CreatingConfigFiles,
    /// Generating the secret key.
    GeneratingSecretKey,
    /// Migrating legacy settings.
    MigratingSettings,
    /// Pulling and building images.
    FetchingImages,
    /// Stopping the previous deployment.
    StoppingServices,
    /// Repairing ZooKeeper, migrating Snuba, creating Kafka topics.
    BootstrappingDataPlane,
    /// Upgrading the on-disk Postgres format.
    UpgradingDatabase,
    /// Running Sentry's own migrations.
    MigratingDatabase,
    /// Moving file storage into the nested layout.
    MigratingFileStorage,
    /// Generating Relay credentials.
    GeneratingRelayCredentials,
    /// Bringing the stack up.
    StartingServices,
    /// Installation complete.
    Complete,
}

impl InstallStep {
    /// Get the next step in the sequence.
    #[must_use]
    pub fn next(&self) -> Self {
        match self {
            Self::NotStarted => Self::CheckingPrerequisites,
            Self::CheckingPrerequisites => Self::CreatingVolumes,
            Self::CreatingVolumes => Self::CreatingConfigFiles,
            Self::CreatingConfigFiles => Self::GeneratingSecretKey,
            Self::GeneratingSecretKey => Self::MigratingSettings,
            Self::MigratingSettings => Self::FetchingImages,
            Self::FetchingImages => Self::StoppingServices,
            Self::StoppingServices => Self::BootstrappingDataPlane,
            Self::BootstrappingDataPlane => Self::UpgradingDatabase,
            Self::UpgradingDatabase => Self::MigratingDatabase,
            Self::MigratingDatabase => Self::MigratingFileStorage,
            Self::MigratingFileStorage => Self::GeneratingRelayCredentials,
            Self::GeneratingRelayCredentials => Self::StartingServices,
            Self::StartingServices | Self::Complete => Self::Complete,
        }
    }

    /// Get a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::CheckingPrerequisites => "Checking prerequisites",
            Self::CreatingVolumes => "Creating volumes for persistent storage",
            Self::CreatingConfigFiles => "Creating configuration files",
            Self::GeneratingSecretKey => "Generating secret key",
            Self::MigratingSettings => "Migrating legacy settings",
            Self::FetchingImages => "Fetching and building Docker images",
            Self::StoppingServices => "Stopping running services",
            Self::BootstrappingDataPlane => "Bootstrapping Snuba and Kafka",
            Self::UpgradingDatabase => "Checking Postgres data format",
            Self::MigratingDatabase => "Setting up and migrating the database",
            Self::MigratingFileStorage => "Migrating file storage",
            Self::GeneratingRelayCredentials => "Generating Relay credentials",
            Self::StartingServices => "Starting services",
            Self::Complete => "Complete",
        }
    }

    /// Get the step number for progress display.
    #[must_use]
    pub fn step_number(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::CheckingPrerequisites => 1,
            Self::CreatingVolumes => 2,
            Self::CreatingConfigFiles => 3,
            Self::GeneratingSecretKey => 4,
            Self::MigratingSettings => 5,
            Self::FetchingImages => 6,
            Self::StoppingServices => 7,
            Self::BootstrappingDataPlane => 8,
            Self::UpgradingDatabase => 9,
            Self::MigratingDatabase => 10,
            Self::MigratingFileStorage => 11,
            Self::GeneratingRelayCredentials => 12,
            Self::StartingServices => 13,
            Self::Complete => 14,
        }
    }

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 14;
}

impl std::fmt::Display for InstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// One-shot migrations tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Migration {
    /// `sentry.conf.py` switched to the Snuba time-series store.
    TsdbBackend,
    /// Postgres data upgraded from the legacy on-disk format.
    PostgresUpgrade,
    /// File storage moved under `files/`.
    FileLayout,
}

/// Full installation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallState {
    /// Step the latest run reached.
    pub step: InstallStep,
    /// Completed migrations and when they were recorded.
    #[serde(default)]
    pub completed: BTreeMap<Migration, String>,
    /// Number of runs started against this checkout.
    #[serde(default)]
    pub runs: u32,
    /// Step that failed in the latest run, if any.
    #[serde(default)]
    pub failed_step: Option<InstallStep>,
    /// Last error message (if any).
    #[serde(default)]
    pub last_error: Option<String>,
    /// Timestamp of last state update.
    pub updated_at: String,

    #[serde(skip)]
    path: PathBuf,
}

impl InstallState {
    /// Create an empty ledger stored at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            step: InstallStep::NotStarted,
            completed: BTreeMap::new(),
            runs: 0,
            failed_step: None,
            last_error: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
            path,
        }
    }

    /// Get the state file path for a checkout.
    #[must_use]
    pub fn state_file(root: &Path) -> PathBuf {
        root.join(STATE_FILE)
    }

    /// Load state for `root` if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(root);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).context("Failed to read state file")?;
        let mut state: Self =
            serde_json::from_str(&content).context("Failed to parse state file")?;
        state.path = path;

        info!(
            step = ?state.step,
            runs = state.runs,
            completed = state.completed.len(),
            "Loaded installation state"
        );
        Ok(Some(state))
    }

    /// Load state for `root`, or start a fresh ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_new(root: &Path) -> Result<Self> {
        Ok(Self::load(root)?.unwrap_or_else(|| Self::new(Self::state_file(root))))
    }

    /// Save state to file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        fsutil::write_atomic(&self.path, content.as_bytes()).context("Failed to write state file")
    }

    /// Start a new run, returning the failure the previous run ended with.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn begin_run(&mut self) -> Result<Option<(InstallStep, String)>> {
        let previous = self.failed_step.zip(self.last_error.clone());
        self.runs += 1;
        self.step = InstallStep::NotStarted;
        self.failed_step = None;
        self.last_error = None;
        self.save()?;
        Ok(previous)
    }

    /// Update the current step and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_step(&mut self, step: InstallStep) -> Result<()> {
        info!("Step: {} -> {}", self.step, step);
        self.step = step;
        self.save()
    }

    /// Record an error for the current step.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record_error(&mut self, error: &str) -> Result<()> {
        self.failed_step = Some(self.step);
        self.last_error = Some(error.to_string());
        self.save()
    }

    /// Whether `migration` has been recorded as done.
    #[must_use]
    pub fn is_applied(&self, migration: Migration) -> bool {
        self.completed.contains_key(&migration)
    }

    /// Record `migration` as done.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn mark_applied(&mut self, migration: Migration) -> Result<()> {
        if self.is_applied(migration) {
            return Ok(());
        }
        info!(?migration, "Recording completed migration");
        self.completed.insert(migration, chrono::Utc::now().to_rfc3339());
        self.save()
    }

    /// Check if the latest run completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step == InstallStep::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_step_progression() {
        let mut step = InstallStep::NotStarted;
        let mut steps = vec![step];

        while step != InstallStep::Complete {
            step = step.next();
            steps.push(step);
        }

        assert_eq!(steps.len(), usize::from(InstallStep::TOTAL_STEPS) + 1);
        assert_eq!(InstallStep::Complete.next(), InstallStep::Complete);

        // Step numbers follow execution order.
        for pair in steps.windows(2) {
            assert_eq!(pair[0].step_number() + 1, pair[1].step_number());
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_step_numbers() {
        assert_eq!(InstallStep::NotStarted.step_number(), 0);
        assert_eq!(
            InstallStep::Complete.step_number(),
            InstallStep::TOTAL_STEPS
        );
    }

    #[test]
    fn test_ledger_persists_migrations() {
        let dir = TempDir::new().unwrap();
        let mut state = InstallState::load_or_new(dir.path()).unwrap();
        assert!(!state.is_applied(Migration::FileLayout));

        state.mark_applied(Migration::FileLayout).unwrap();
        let recorded_at = state.completed[&Migration::FileLayout].clone();
        state.mark_applied(Migration::FileLayout).unwrap();
        assert_eq!(state.completed[&Migration::FileLayout], recorded_at);

        let reloaded = InstallState::load(dir.path()).unwrap().unwrap();
        assert!(reloaded.is_applied(Migration::FileLayout));
        assert!(!reloaded.is_applied(Migration::PostgresUpgrade));

        let raw = std::fs::read_to_string(InstallState::state_file(dir.path())).unwrap();
        assert!(raw.contains("\"file_layout\""));
    }

    #[test]
    fn test_failure_reported_to_next_run() {
        let dir = TempDir::new().unwrap();
        let mut state = InstallState::load_or_new(dir.path()).unwrap();
        assert_eq!(state.begin_run().unwrap(), None);

        state.set_step(InstallStep::FetchingImages).unwrap();
        state.record_error("pull access denied").unwrap();

        let mut next = InstallState::load(dir.path()).unwrap().unwrap();
        let previous = next.begin_run().unwrap();
        assert_eq!(
            previous,
            Some((InstallStep::FetchingImages, "pull access denied".to_string()))
        );
        assert_eq!(next.runs, 2);
        assert!(next.last_error.is_none());
        assert_eq!(next.step, InstallStep::NotStarted);
    }

    #[test]
    fn test_corrupt_state_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(InstallState::state_file(dir.path()), "{not json").unwrap();
        assert!(InstallState::load(dir.path()).is_err());
    }
}
