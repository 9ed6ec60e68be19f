//! Configuration files seeded from example templates.
//!
//! Each configuration file ships as an example next to its final location
//! (`config.example.yml` for `config.yml`). The example is copied into place
//! on first run and never touched again, so local edits survive upgrades.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// What happened to one target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    /// The file was created from its template.
    Created,
    /// The file already existed and was left alone.
    AlreadyPresent,
}

/// Derive the example template path for `target`.
///
/// The marker goes before the final extension: `sentry/sentry.conf.py`
/// becomes `sentry/sentry.conf.example.py`. A file without an extension gets
/// `.example` appended.
#[must_use]
pub fn example_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let example_name = match file_name.rfind('.') {
        Some(dot) if dot > 0 => {
            format!("{}.example{}", &file_name[..dot], &file_name[dot..])
        }
        _ => format!("{file_name}.example"),
    };

    target.with_file_name(example_name)
}

/// Copy the example template to `target` unless `target` already exists.
///
/// # Errors
///
/// Returns an error if the target is missing and its template cannot be
/// copied.
pub fn ensure_from_example(target: &Path) -> Result<Materialized> {
    if target.exists() {
        info!(file = %target.display(), "Config file already exists");
        return Ok(Materialized::AlreadyPresent);
    }

    let example = example_path(target);
    if !example.exists() {
        anyhow::bail!(
            "Cannot create {}: template {} is missing",
            target.display(),
            example.display()
        );
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    std::fs::copy(&example, target).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            example.display(),
            target.display()
        )
    })?;

    info!(
        file = %target.display(),
        template = %example.display(),
        "Created config file from template"
    );
    Ok(Materialized::Created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_example_path() {
        assert_eq!(
            example_path(Path::new("sentry/sentry.conf.py")),
            PathBuf::from("sentry/sentry.conf.example.py")
        );
        assert_eq!(
            example_path(Path::new("relay/config.yml")),
            PathBuf::from("relay/config.example.yml")
        );
        assert_eq!(
            example_path(Path::new("sentry/requirements.txt")),
            PathBuf::from("sentry/requirements.example.txt")
        );
        assert_eq!(
            example_path(Path::new("conf/Makefile")),
            PathBuf::from("conf/Makefile.example")
        );
        assert_eq!(
            example_path(Path::new(".env")),
            PathBuf::from(".env.example")
        );
    }

    #[test]
    fn test_second_run_is_noop() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("relay").join("config.yml");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(example_path(&target), "relay:\n  upstream: http://web:9000/\n").unwrap();

        assert_eq!(ensure_from_example(&target).unwrap(), Materialized::Created);
        let first = std::fs::read(&target).unwrap();

        std::fs::write(example_path(&target), "changed upstream template\n").unwrap();
        assert_eq!(
            ensure_from_example(&target).unwrap(),
            Materialized::AlreadyPresent
        );
        assert_eq!(std::fs::read(&target).unwrap(), first);
    }

    #[test]
    fn test_local_edits_preserved() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("config.yml");
        std::fs::write(example_path(&target), "template\n").unwrap();
        std::fs::write(&target, "edited by operator\n").unwrap();

        ensure_from_example(&target).unwrap();
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "edited by operator\n"
        );
    }

    #[test]
    fn test_missing_template_is_error() {
        let dir = TempDir::new().unwrap();
        let err = ensure_from_example(&dir.path().join("symbolicator.yml")).unwrap_err();
        assert!(err.to_string().contains("template"));
    }
}
