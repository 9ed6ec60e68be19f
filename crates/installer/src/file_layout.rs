//! Moving flat file storage into the nested `files/` layout.

use anyhow::{Context, Result};
use tracing::info;

use crate::stage::StageContext;

/// Volume holding uploaded files.
pub const DATA_VOLUME: &str = "sentry-data";
/// Directory every entry is moved under.
pub const NESTED_DIR: &str = "files";
/// Owner the web service expects.
pub const DATA_OWNER: &str = "sentry:sentry";

/// Operations the migration needs from a storage volume.
pub trait DataVolume {
    /// Whether the nested directory already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be inspected.
    fn has_nested_layout(&self) -> Result<bool>;

    /// Names of the entries at the top of the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be listed.
    fn top_level_entries(&self) -> Result<Vec<String>>;

    /// Move `entries` under the nested directory, creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be moved.
    fn nest_entries(&self, entries: &[String]) -> Result<()>;

    /// Hand the whole volume back to the service user.
    ///
    /// # Errors
    ///
    /// Returns an error if ownership cannot be changed.
    fn restore_ownership(&self) -> Result<()>;
}

/// Result of the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMigration {
    /// The volume was already nested.
    AlreadyNested,
    /// Nothing stored yet.
    Empty,
    /// Entries were moved.
    Migrated {
        /// Number of top-level entries moved.
        moved: usize,
    },
}

/// Nest a flat volume. A nested or empty volume is left alone.
///
/// # Errors
///
/// Returns an error if any volume operation fails.
pub fn migrate_file_layout<V: DataVolume + ?Sized>(volume: &V) -> Result<LayoutMigration> {
    if volume.has_nested_layout()? {
        return Ok(LayoutMigration::AlreadyNested);
    }

    let entries = volume.top_level_entries()?;
    if entries.is_empty() {
        return Ok(LayoutMigration::Empty);
    }

    volume.nest_entries(&entries)?;
    volume.restore_ownership()?;
    info!(moved = entries.len(), "Migrated file storage layout");
    Ok(LayoutMigration::Migrated {
        moved: entries.len(),
    })
}

/// [`DataVolume`] backed by the named engine volume.
pub struct ContainerVolume<'a> {
    ctx: StageContext<'a>,
}

impl<'a> ContainerVolume<'a> {
    /// Operate on [`DATA_VOLUME`].
    #[must_use]
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    fn mount() -> String {
        format!("{DATA_VOLUME}:/data")
    }
}

impl DataVolume for ContainerVolume<'_> {
    fn has_nested_layout(&self) -> Result<bool> {
        let mount = Self::mount();
        let nested = format!("/data/{NESTED_DIR}");
        let output = self.ctx.tolerated(&self.ctx.docker([
            "run",
            "--rm",
            "-v",
            mount.as_str(),
            "alpine",
            "test",
            "-d",
            nested.as_str(),
        ]))?;
        Ok(output.success())
    }

    fn top_level_entries(&self) -> Result<Vec<String>> {
        let mount = Self::mount();
        let output = self
            .ctx
            .checked(&self.ctx.docker([
                "run",
                "--rm",
                "-v",
                mount.as_str(),
                "alpine",
                "ls",
                "-A1",
                "/data",
            ]))
            .context("Failed to list file storage")?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn nest_entries(&self, entries: &[String]) -> Result<()> {
        let mount = Self::mount();
        let script =
            format!("mkdir -p /data/{NESTED_DIR} && cd /data && mv -- \"$@\" {NESTED_DIR}/");
        let spec = self
            .ctx
            .docker([
                "run",
                "--rm",
                "-v",
                mount.as_str(),
                "alpine",
                "sh",
                "-c",
                script.as_str(),
                "sh",
            ])
            .args(entries.iter().cloned());
        self.ctx
            .checked(&spec)
            .context("Failed to move files into the nested layout")?;
        Ok(())
    }

    fn restore_ownership(&self) -> Result<()> {
        self.ctx
            .checked(&self.ctx.compose.run_rm([
                "--no-deps",
                "--entrypoint",
                "chown",
                "web",
                "-R",
                DATA_OWNER,
                "/data",
            ]))
            .context("Failed to restore file storage ownership")?;
        Ok(())
    }
}
