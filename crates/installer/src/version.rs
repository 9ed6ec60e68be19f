//! Dotted version comparison.
//!
//! Versions are folded into a single integer by zero-padding each of the
//! `major.minor.patch` components to three digits, so `19.03.6` becomes
//! `19_003_006` and `19.10.0` becomes `19_010_000`.

use crate::error::InstallError;

const COMPONENTS: usize = 3;
const COMPONENT_MAX: u64 = 999;

/// Normalize a dotted version string into a comparable integer.
///
/// A leading `v` and any build or pre-release suffix (`+dfsg1`, `-desktop.1`)
/// are ignored. Missing trailing components count as zero.
///
/// # Errors
///
/// Returns [`InstallError::InvalidVersion`] for empty input, non-numeric
/// components, more than three components, or a component above 999.
pub fn normalize(version: &str) -> Result<u64, InstallError> {
    let invalid = || InstallError::InvalidVersion(version.to_string());

    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let core = trimmed
        .split(['+', '-'])
        .next()
        .filter(|core| !core.is_empty())
        .ok_or_else(invalid)?;

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > COMPONENTS {
        return Err(invalid());
    }

    let mut value = 0_u64;
    for i in 0..COMPONENTS {
        let component = match parts.get(i) {
            Some(part) => part.parse::<u64>().map_err(|_| invalid())?,
            None => 0,
        };
        if component > COMPONENT_MAX {
            return Err(invalid());
        }
        value = value * 1000 + component;
    }

    Ok(value)
}

/// Check whether `found` is at least `minimum`.
///
/// # Errors
///
/// Returns an error if either version cannot be normalized.
pub fn is_at_least(found: &str, minimum: &str) -> Result<bool, InstallError> {
    Ok(normalize(found)? >= normalize(minimum)?)
}
