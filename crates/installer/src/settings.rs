//! `sentry.conf.py` handling and the time-series backend migration.
//!
//! The settings file is Python, but the installer only ever needs its
//! top-level `NAME = expression` statements. [`SettingsDocument`] models the
//! file as a list of lines where each unindented single-line assignment is
//! recognised and everything else is carried through untouched, so parsing
//! and serializing a document reproduces it byte for byte.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::fsutil;

/// Setting selecting the time-series backend.
pub const TSDB_SETTING: &str = "SENTRY_TSDB";
/// Setting holding backend options; its presence blocks automatic migration.
pub const TSDB_OPTIONS_SETTING: &str = "SENTRY_TSDB_OPTIONS";
/// Expression selecting the Snuba-backed store.
pub const SNUBA_TSDB: &str = "\"sentry.tsdb.redissnuba.RedisSnubaTSDB\"";
/// How long the old and new stores run side by side.
pub const SWITCHOVER_DAYS: i64 = 90;

/// One line of a settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A top-level `NAME = value` statement.
    Assignment {
        /// Setting name.
        name: String,
        /// Right-hand side, trimmed.
        value: String,
        /// The original text of the line.
        raw: String,
    },
    /// Anything else: comments, blank lines, imports, continuation lines.
    Other(String),
}

impl Line {
    fn parse(raw: &str) -> Self {
        let other = || Self::Other(raw.to_string());

        if raw.starts_with(char::is_whitespace) || raw.starts_with('#') {
            return other();
        }
        let Some((lhs, rhs)) = raw.split_once('=') else {
            return other();
        };
        // `==`, `<=`, `>=`, `!=` and augmented assignment are not statements we touch.
        if rhs.starts_with('=') || lhs.ends_with(['<', '>', '!', '+', '-', '*', '/', '|', '&']) {
            return other();
        }

        let name = lhs.trim();
        let is_identifier = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_identifier {
            return other();
        }

        Self::Assignment {
            name: name.to_string(),
            value: rhs.trim().trim_end_matches('\r').to_string(),
            raw: raw.to_string(),
        }
    }

    fn raw(&self) -> &str {
        match self {
            Self::Assignment { raw, .. } | Self::Other(raw) => raw,
        }
    }
}

/// A parsed settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsDocument {
    lines: Vec<Line>,
}

impl SettingsDocument {
    /// Parse `text` into lines.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(Line::parse).collect(),
        }
    }

    /// Serialize back to text.
    #[must_use]
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(Line::raw)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Value of the last assignment to `name`, as Python would see it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Assignment {
                name: n, value, ..
            } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Whether any assignment to `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every assignment to `name` with `replacement` lines.
    ///
    /// Returns the number of assignments replaced.
    pub fn replace_assignment(&mut self, name: &str, replacement: &[String]) -> usize {
        let mut count = 0;
        let mut lines = Vec::with_capacity(self.lines.len() + replacement.len());

        for line in self.lines.drain(..) {
            match &line {
                Line::Assignment { name: n, .. } if n == name => {
                    count += 1;
                    lines.extend(replacement.iter().map(|r| Line::parse(r)));
                }
                _ => lines.push(line),
            }
        }

        self.lines = lines;
        count
    }
}

/// Result of the TSDB migration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsdbMigration {
    /// The file already selects the Snuba store.
    AlreadyMigrated,
    /// No backend is configured, so the default applies.
    NotConfigured,
    /// The legacy setting was rewritten.
    Migrated,
    /// Manual action is needed; the file was left as it was.
    ManualActionRequired {
        /// Why the rewrite was not done.
        reason: String,
        /// Lines the operator should put in place of the old settings.
        instructions: Vec<String>,
    },
}

/// The lines that select the Snuba store with a switchover `now + 90 days`.
#[must_use]
pub fn snuba_tsdb_block(now: DateTime<Utc>) -> Vec<String> {
    let switchover = now + Duration::days(SWITCHOVER_DAYS);
    vec![
        format!("{TSDB_SETTING} = {SNUBA_TSDB}"),
        String::new(),
        format!(
            "# Automatic switchover {SWITCHOVER_DAYS} days after {}. Can be removed afterwards.",
            now.to_rfc2822()
        ),
        format!(
            "{TSDB_OPTIONS_SETTING} = {{\"switchover_timestamp\": {}}}",
            switchover.timestamp()
        ),
    ]
}

/// Rewrite a legacy time-series backend to the Snuba store in memory.
///
/// Returns the new text, or the outcome explaining why nothing changed.
///
/// # Errors
///
/// Returns the outcome to report when the text is not rewritten.
pub fn migrate_tsdb_text(text: &str, now: DateTime<Utc>) -> Result<String, TsdbMigration> {
    let mut doc = SettingsDocument::parse(text);

    match doc.get(TSDB_SETTING) {
        None => return Err(TsdbMigration::NotConfigured),
        Some(SNUBA_TSDB) => return Err(TsdbMigration::AlreadyMigrated),
        Some(_) => {}
    }

    let block = snuba_tsdb_block(now);

    if doc.contains(TSDB_OPTIONS_SETTING) {
        return Err(TsdbMigration::ManualActionRequired {
            reason: format!("{TSDB_OPTIONS_SETTING} is already set"),
            instructions: block,
        });
    }

    doc.replace_assignment(TSDB_SETTING, &block);
    let rendered = doc.render();

    let reparsed = SettingsDocument::parse(&rendered);
    if reparsed.get(TSDB_SETTING) != Some(SNUBA_TSDB) || !reparsed.contains(TSDB_OPTIONS_SETTING) {
        return Err(TsdbMigration::ManualActionRequired {
            reason: "the rewritten file did not verify".into(),
            instructions: block,
        });
    }

    Ok(rendered)
}

/// Migrate the settings file at `path` if it uses a legacy backend.
///
/// A failed or refused rewrite leaves the file byte-identical and is reported
/// as [`TsdbMigration::ManualActionRequired`] rather than an error.
///
/// # Errors
///
/// Returns an error only if the file cannot be read or written.
pub fn migrate_tsdb(path: &Path, now: DateTime<Utc>) -> Result<TsdbMigration> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    match migrate_tsdb_text(&text, now) {
        Ok(updated) => {
            fsutil::write_atomic(path, updated.as_bytes())?;
            info!(file = %path.display(), "Migrated time-series backend to Snuba");
            Ok(TsdbMigration::Migrated)
        }
        Err(outcome @ TsdbMigration::ManualActionRequired { .. }) => {
            warn!(file = %path.display(), "Automatic time-series migration not possible");
            Ok(outcome)
        }
        Err(outcome) => Ok(outcome),
    }
}
