//! Secret key generation for `sentry/config.yml`.

use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::info;

use crate::fsutil;

/// Settings key holding the secret.
pub const SECRET_KEY: &str = "system.secret-key";
/// Value shipped in the example config.
pub const PLACEHOLDER_VALUE: &str = "!!changeme!!";
/// Characters a generated secret is drawn from.
pub const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789@#%^&*(-_=+)";
/// Generated secret length.
pub const SECRET_LENGTH: usize = 50;

/// The exact line marking an unconfigured secret.
#[must_use]
pub fn placeholder_line() -> String {
    format!("{SECRET_KEY}: '{PLACEHOLDER_VALUE}'")
}

/// Draw a random secret from [`ALPHABET`].
#[must_use]
pub fn generate_secret<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..SECRET_LENGTH)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect()
}

/// Quote `value` as a YAML single-quoted scalar.
#[must_use]
pub fn yaml_single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replace the placeholder line in `contents` with `secret`.
///
/// Returns `None` when no line matches the placeholder exactly.
#[must_use]
pub fn replace_placeholder(contents: &str, secret: &str) -> Option<String> {
    let placeholder = placeholder_line();
    let mut replaced = false;

    let lines: Vec<String> = contents
        .split('\n')
        .map(|line| {
            if !replaced && line.trim_end_matches('\r') == placeholder {
                replaced = true;
                format!("{SECRET_KEY}: {}", yaml_single_quoted(secret))
            } else {
                line.to_string()
            }
        })
        .collect();

    replaced.then(|| lines.join("\n"))
}

/// Generate a secret into `path` if it still holds the placeholder.
///
/// Returns `true` when a new secret was written. The rewritten document is
/// parsed back before it replaces the original, so a malformed result never
/// reaches disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or written, or if the
/// rewritten document does not carry the generated secret.
pub fn ensure_secret_key(path: &Path) -> Result<bool> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let secret = generate_secret(&mut rand::thread_rng());
    let Some(updated) = replace_placeholder(&contents, &secret) else {
        info!(file = %path.display(), "Secret key already configured");
        return Ok(false);
    };

    let written = read_secret(&updated)
        .with_context(|| format!("Rewritten {} is not valid YAML", path.display()))?;
    if written.as_deref() != Some(secret.as_str()) {
        anyhow::bail!(
            "Rewritten {} does not contain the generated secret",
            path.display()
        );
    }

    fsutil::write_atomic(path, updated.as_bytes())?;
    info!(file = %path.display(), "Secret key written");
    Ok(true)
}

/// Read the configured secret from a YAML document.
///
/// # Errors
///
/// Returns an error if `contents` is not valid YAML.
pub fn read_secret(contents: &str) -> Result<Option<String>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(contents).context("Failed to parse YAML")?;
    Ok(doc
        .get(SECRET_KEY)
        .and_then(serde_yaml::Value::as_str)
        .map(str::to_string))
}
