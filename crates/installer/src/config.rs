//! Installation configuration types.
//!
//! Configuration is assembled once at startup from, in increasing order of
//! precedence: built-in defaults, `.env`, `.env.custom`, and the process
//! environment. The result is immutable and passed to every stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;
use serde::Serialize;

/// Defaults file shipped with the repository.
pub const ENV_FILE: &str = ".env";
/// Optional local override file.
pub const ENV_CUSTOM_FILE: &str = ".env.custom";

/// Services that keep serving traffic during a minimize-downtime upgrade.
pub const EDGE_SERVICES: [&str; 2] = ["nginx", "relay"];
/// Compose project name used by older deployments.
pub const LEGACY_PROJECT_NAME: &str = "onpremise";

/// How services are taken down and brought back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BringUpMode {
    /// Stop everything before provisioning; nothing is served meanwhile.
    #[default]
    FullStop,
    /// Keep the edge services up and cut over once the web tier is healthy.
    MinimizeDowntime,
}

impl std::fmt::Display for BringUpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullStop => write!(f, "full-stop"),
            Self::MinimizeDowntime => write!(f, "minimize-downtime"),
        }
    }
}

/// Flags accepted on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    /// `--no-user-prompt`
    pub no_user_prompt: bool,
    /// `--minimize-downtime`
    pub minimize_downtime: bool,
}

/// Layered key/value environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvLayers {
    values: BTreeMap<String, String>,
    process_only: BTreeMap<String, String>,
}

impl EnvLayers {
    /// Merge layers; later layers override earlier ones.
    #[must_use]
    pub fn merge<I, L>(layers: L) -> Self
    where
        L: IntoIterator<Item = I>,
        I: IntoIterator<Item = (String, String)>,
    {
        let mut values = BTreeMap::new();
        for layer in layers {
            values.extend(layer);
        }
        Self {
            values,
            process_only: BTreeMap::new(),
        }
    }

    /// Load `.env` and `.env.custom` from `root` and overlay `process`.
    ///
    /// Only keys that appear in one of the files are kept; the process
    /// environment can override them but does not add to them.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be parsed.
    pub fn load<P>(root: &Path, process: P) -> Result<Self>
    where
        P: IntoIterator<Item = (String, String)>,
    {
        let defaults = read_env_file(&root.join(ENV_FILE))?;
        let custom = read_env_file(&root.join(ENV_CUSTOM_FILE))?;
        let mut merged = Self::merge([defaults, custom]);

        for (key, value) in process {
            if let Some(slot) = merged.values.get_mut(&key) {
                *slot = value;
            } else {
                merged.process_only.insert(key, value);
            }
        }

        Ok(merged)
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .or_else(|| self.process_only.get(key))
            .map(String::as_str)
    }

    /// Variables to hand to child commands.
    #[must_use]
    pub fn exported(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    debug!(path = %path.display(), "Reading environment file");

    dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .map(|item| item.with_context(|| format!("Failed to parse {}", path.display())))
        .collect()
}

/// Minimum host capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirements {
    /// Minimum Docker engine version.
    pub min_docker_version: String,
    /// Minimum Docker Compose version.
    pub min_compose_version: String,
    /// Fewer CPU cores than this aborts.
    pub min_cpu_hard: u32,
    /// Fewer CPU cores than this warns.
    pub min_cpu_soft: u32,
    /// Less RAM (MB) than this aborts.
    pub min_ram_hard_mb: u64,
    /// Less RAM (MB) than this warns.
    pub min_ram_soft_mb: u64,
    /// `/proc/cpuinfo` flag that must be present.
    pub required_cpu_flag: String,
    /// `/proc/cpuinfo` marker of a guest that misreports CPU flags.
    pub virtualized_guest_marker: String,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            min_docker_version: "19.03.6".into(),
            min_compose_version: "1.28.0".into(),
            min_cpu_hard: 2,
            min_cpu_soft: 4,
            min_ram_hard_mb: 3800,
            min_ram_soft_mb: 7800,
            required_cpu_flag: "sse4_2".into(),
            virtualized_guest_marker: "Common KVM processor".into(),
        }
    }
}

/// Full installation configuration.
#[derive(Debug, Clone, Serialize)]
pub struct InstallConfig {
    /// Checkout being installed; all relative paths hang off it.
    pub root: PathBuf,
    /// Compose project name.
    pub project_name: String,
    /// Sentry image, pulled separately so a locally tagged one is tolerated.
    pub sentry_image: String,
    /// Seconds compose waits for containers to stop.
    pub stop_timeout_secs: u64,
    /// Teardown and start-up strategy.
    pub mode: BringUpMode,
    /// Never prompt for an admin account.
    pub skip_user_prompt: bool,
    /// Delay between health probes.
    pub health_check_interval: Duration,
    /// Give up on the health probe after this long; `None` waits forever.
    pub health_check_timeout: Option<Duration>,
    /// Host capability thresholds.
    pub requirements: Requirements,
    /// Environment exported to every child command.
    pub env: BTreeMap<String, String>,
}

impl InstallConfig {
    /// Create config with defaults for a checkout at `root`.
    #[must_use]
    pub fn with_defaults(root: PathBuf) -> Self {
        Self {
            root,
            project_name: "sentry-self-hosted".into(),
            sentry_image: "getsentry/sentry:nightly".into(),
            stop_timeout_secs: 60,
            mode: BringUpMode::default(),
            skip_user_prompt: false,
            health_check_interval: Duration::from_millis(500),
            health_check_timeout: None,
            requirements: Requirements::default(),
            env: BTreeMap::new(),
        }
    }

    /// Build the configuration from layered environment and CLI flags.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric setting cannot be parsed.
    pub fn from_env(root: PathBuf, env: &EnvLayers, flags: RunFlags) -> Result<Self> {
        let mut config = Self::with_defaults(root);

        if let Some(name) = env.get("COMPOSE_PROJECT_NAME").filter(|v| !v.is_empty()) {
            config.project_name = name.to_string();
        }
        if let Some(image) = env.get("SENTRY_IMAGE").filter(|v| !v.is_empty()) {
            config.sentry_image = image.to_string();
        }
        if let Some(timeout) = env.get("STOP_TIMEOUT") {
            config.stop_timeout_secs = timeout
                .parse()
                .with_context(|| format!("STOP_TIMEOUT must be a number, got {timeout:?}"))?;
        }
        if let Some(interval) = env.get("HEALTHCHECK_INTERVAL_MS") {
            let millis: u64 = interval.parse().with_context(|| {
                format!("HEALTHCHECK_INTERVAL_MS must be a number, got {interval:?}")
            })?;
            config.health_check_interval = Duration::from_millis(millis);
        }
        if let Some(timeout) = env.get("HEALTHCHECK_TIMEOUT_SECS").filter(|v| !v.is_empty()) {
            let secs: u64 = timeout.parse().with_context(|| {
                format!("HEALTHCHECK_TIMEOUT_SECS must be a number, got {timeout:?}")
            })?;
            config.health_check_timeout = Some(Duration::from_secs(secs));
        }

        let in_ci = env.get("CI").is_some_and(|v| !v.is_empty());
        config.skip_user_prompt =
            flags.no_user_prompt || in_ci || env.get("SKIP_USER_PROMPT") == Some("1");

        let minimize = flags.minimize_downtime
            || env.get("MINIMIZE_DOWNTIME").is_some_and(|v| !v.is_empty());
        if minimize {
            config.mode = BringUpMode::MinimizeDowntime;
        }

        config.env = env.exported().clone();
        config
            .env
            .insert("COMPOSE_PROJECT_NAME".into(), config.project_name.clone());

        Ok(config)
    }

    /// Resolve a path relative to the checkout.
    #[must_use]
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// `sentry/config.yml`
    #[must_use]
    pub fn sentry_config_yml(&self) -> PathBuf {
        self.path("sentry/config.yml")
    }

    /// `sentry/sentry.conf.py`
    #[must_use]
    pub fn sentry_config_py(&self) -> PathBuf {
        self.path("sentry/sentry.conf.py")
    }

    /// `sentry/requirements.txt`
    #[must_use]
    pub fn sentry_requirements(&self) -> PathBuf {
        self.path("sentry/requirements.txt")
    }

    /// `symbolicator/config.yml`
    #[must_use]
    pub fn symbolicator_config_yml(&self) -> PathBuf {
        self.path("symbolicator/config.yml")
    }

    /// `relay/config.yml`
    #[must_use]
    pub fn relay_config_yml(&self) -> PathBuf {
        self.path("relay/config.yml")
    }

    /// `relay/credentials.json`
    #[must_use]
    pub fn relay_credentials_json(&self) -> PathBuf {
        self.path("relay/credentials.json")
    }

    /// Directory holding the seed ZooKeeper snapshot.
    #[must_use]
    pub fn zookeeper_seed_dir(&self) -> PathBuf {
        self.path("zookeeper")
    }

    /// Every configuration file seeded from an example template.
    #[must_use]
    pub fn templated_files(&self) -> Vec<PathBuf> {
        vec![
            self.sentry_config_yml(),
            self.sentry_config_py(),
            self.sentry_requirements(),
            self.symbolicator_config_yml(),
            self.relay_config_yml(),
        ]
    }

    /// Network the stack's containers share.
    #[must_use]
    pub fn default_network(&self) -> String {
        format!("{}_default", self.project_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_config_defaults() {
        let config = InstallConfig::with_defaults(PathBuf::from("/srv/self-hosted"));
        assert_eq!(config.project_name, "sentry-self-hosted");
        assert_eq!(config.stop_timeout_secs, 60);
        assert_eq!(config.mode, BringUpMode::FullStop);
        assert!(config.health_check_timeout.is_none());
        assert_eq!(
            config.sentry_config_py(),
            PathBuf::from("/srv/self-hosted/sentry/sentry.conf.py")
        );
        assert_eq!(config.templated_files().len(), 5);
        assert_eq!(config.default_network(), "sentry-self-hosted_default");
    }

    #[test]
    fn test_env_precedence() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(ENV_FILE),
            "COMPOSE_PROJECT_NAME=from-env-file\nSENTRY_IMAGE=getsentry/sentry:24.1.0\nSTOP_TIMEOUT=30\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(ENV_CUSTOM_FILE),
            "SENTRY_IMAGE=getsentry/sentry:custom\n",
        )
        .unwrap();

        let process = pairs(&[("STOP_TIMEOUT", "5"), ("HOME", "/root")]);
        let layers = EnvLayers::load(dir.path(), process).unwrap();

        assert_eq!(layers.get("COMPOSE_PROJECT_NAME"), Some("from-env-file"));
        assert_eq!(layers.get("SENTRY_IMAGE"), Some("getsentry/sentry:custom"));
        assert_eq!(layers.get("STOP_TIMEOUT"), Some("5"));
        assert_eq!(layers.get("HOME"), Some("/root"));
        assert!(!layers.exported().contains_key("HOME"));

        let config =
            InstallConfig::from_env(dir.path().to_path_buf(), &layers, RunFlags::default())
                .unwrap();
        assert_eq!(config.project_name, "from-env-file");
        assert_eq!(config.sentry_image, "getsentry/sentry:custom");
        assert_eq!(config.stop_timeout_secs, 5);
        assert_eq!(config.env.get("STOP_TIMEOUT").unwrap(), "5");
    }

    #[test]
    fn test_missing_env_files_use_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let layers = EnvLayers::load(dir.path(), Vec::new()).unwrap();
        let config =
            InstallConfig::from_env(dir.path().to_path_buf(), &layers, RunFlags::default())
                .unwrap();
        assert_eq!(config.project_name, "sentry-self-hosted");
        assert_eq!(
            config.env.get("COMPOSE_PROJECT_NAME").unwrap(),
            "sentry-self-hosted"
        );
    }

    #[test]
    fn test_user_prompt_gating() {
        let root = PathBuf::from("/tmp/x");

        let quiet = EnvLayers::merge([pairs(&[])]);
        let config = InstallConfig::from_env(root.clone(), &quiet, RunFlags::default()).unwrap();
        assert!(!config.skip_user_prompt);

        let flags = RunFlags {
            no_user_prompt: true,
            ..RunFlags::default()
        };
        let config = InstallConfig::from_env(root.clone(), &quiet, flags).unwrap();
        assert!(config.skip_user_prompt);

        let ci = EnvLayers::merge([pairs(&[("CI", "true")])]);
        let config = InstallConfig::from_env(root.clone(), &ci, RunFlags::default()).unwrap();
        assert!(config.skip_user_prompt);

        let skip = EnvLayers::merge([pairs(&[("SKIP_USER_PROMPT", "1")])]);
        let config = InstallConfig::from_env(root.clone(), &skip, RunFlags::default()).unwrap();
        assert!(config.skip_user_prompt);

        let not_skip = EnvLayers::merge([pairs(&[("SKIP_USER_PROMPT", "0")])]);
        let config = InstallConfig::from_env(root, &not_skip, RunFlags::default()).unwrap();
        assert!(!config.skip_user_prompt);
    }

    #[test]
    fn test_minimize_downtime_sources() {
        let root = PathBuf::from("/tmp/x");
        let flags = RunFlags {
            minimize_downtime: true,
            ..RunFlags::default()
        };
        let empty = EnvLayers::default();
        let config = InstallConfig::from_env(root.clone(), &empty, flags).unwrap();
        assert_eq!(config.mode, BringUpMode::MinimizeDowntime);

        let env = EnvLayers::merge([pairs(&[("MINIMIZE_DOWNTIME", "1")])]);
        let config = InstallConfig::from_env(root, &env, RunFlags::default()).unwrap();
        assert_eq!(config.mode, BringUpMode::MinimizeDowntime);
    }

    #[test]
    fn test_bad_numbers_rejected() {
        let env = EnvLayers::merge([pairs(&[("STOP_TIMEOUT", "soon")])]);
        let err = InstallConfig::from_env(PathBuf::from("/tmp/x"), &env, RunFlags::default())
            .unwrap_err();
        assert!(err.to_string().contains("STOP_TIMEOUT"));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(BringUpMode::default(), BringUpMode::FullStop);
        assert_eq!(BringUpMode::FullStop.to_string(), "full-stop");
        assert_eq!(BringUpMode::MinimizeDowntime.to_string(), "minimize-downtime");
    }
}
