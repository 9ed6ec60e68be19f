//! Sentry self-hosted install/upgrade CLI.
//!
//! Run from the root of a self-hosted checkout. Re-running is always safe:
//! every stage checks what is already in place first.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use selfhost_installer::{
    ui, CleanupReason, EnvLayers, InstallConfig, Installer, RunFlags, SystemRunner,
};

/// Install or upgrade Sentry self-hosted.
#[derive(Parser, Debug)]
#[command(
    name = "install",
    about = "Install or upgrade Sentry self-hosted",
    long_about = "Install or upgrade Sentry self-hosted.\n\n\
                  Validates the host, creates volumes and configuration files,\n\
                  runs pending migrations and brings the stack up.\n\n\
                  Settings are read from .env, then .env.custom, then the\n\
                  environment.",
    disable_version_flag = true
)]
struct Cli {
    /// Do not ask to create a user account.
    #[arg(long)]
    no_user_prompt: bool,

    /// Keep nginx and relay up and switch over once the web service is healthy.
    #[arg(long)]
    minimize_downtime: bool,
}

impl Cli {
    fn flags(&self) -> RunFlags {
        RunFlags {
            no_user_prompt: self.no_user_prompt,
            minimize_downtime: self.minimize_downtime,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,selfhost_installer=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let root = std::env::current_dir().context("Failed to determine working directory")?;
    let process_env = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
    let env = EnvLayers::load(&root, process_env)?;
    let config = InstallConfig::from_env(root, &env, cli.flags())?;

    ui::print_banner();
    ui::print_kv("Project", &config.project_name);
    ui::print_kv("Mode", &config.mode.to_string());

    let mut installer = Installer::new(config, Arc::new(SystemRunner))?;
    let cleanup = installer.cleanup();
    let mut pipeline = tokio::spawn(async move { installer.run().await });

    tokio::select! {
        joined = &mut pipeline => match joined {
            Ok(Ok(_)) => Ok(ExitCode::SUCCESS),
            // Already reported and cleaned up by the installer.
            Ok(Err(_)) => Ok(ExitCode::FAILURE),
            Err(e) => {
                cleanup.run(CleanupReason::Exit);
                Err(e).context("Installer task aborted")
            }
        },
        name = shutdown_signal() => {
            info!(signal = name, "Interrupted");
            cleanup.run(CleanupReason::Signal(name));
            // A stage blocked on a child process only notices the abort once it
            // returns; the next command it tries is refused.
            pipeline.abort();
            let _ = pipeline.await;
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
