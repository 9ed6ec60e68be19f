//! Sentry self-hosted installer library.
//!
//! Installs or upgrades a self-hosted Sentry checkout: validates the host,
//! provisions volumes and configuration, runs the one-shot data migrations
//! and brings the compose stack up.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use selfhost_installer::{EnvLayers, InstallConfig, Installer, RunFlags, SystemRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let root = std::env::current_dir()?;
//!     let env = EnvLayers::load(&root, std::env::vars())?;
//!     let config = InstallConfig::from_env(root, &env, RunFlags::default())?;
//!     let mut installer = Installer::new(config, Arc::new(SystemRunner))?;
//!     installer.run().await?;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod config;
pub mod credentials;
pub mod dataplane;
pub mod error;
pub mod file_layout;
pub mod fsutil;
pub mod images;
pub mod migrate;
pub mod orchestrator;
pub mod postgres;
pub mod runner;
pub mod secret;
pub mod services;
pub mod settings;
pub mod stage;
pub mod state;
pub mod templates;
pub mod ui;
pub mod validator;
pub mod version;
pub mod volumes;

// Re-export commonly used types at the crate root
pub use config::{BringUpMode, EnvLayers, InstallConfig, RunFlags};
pub use error::InstallError;
pub use orchestrator::{Cleanup, CleanupReason, Installer, RunSummary};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, Compose, SystemRunner};
pub use stage::StageOutcome;
pub use state::{InstallState, InstallStep, Migration};
