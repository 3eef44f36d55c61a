//! Demarcation of payload output inside a bundle's stdout.

use super::ArchiveError;

/// Marker echoed by the run script immediately before the payload starts.
pub const SENTINEL: &str = "--- BEGIN OUTPUT ---";

/// Returns everything after the first sentinel line.
///
/// # Errors
///
/// Returns [`ArchiveError::SentinelMissing`] when the marker never appears,
/// which means the bundle failed before its payload started.
pub fn strip_banner(stream: &str) -> Result<&str, ArchiveError> {
    let (_, rest) = stream
        .split_once(SENTINEL)
        .ok_or(ArchiveError::SentinelMissing { exit_code: None })?;
    Ok(rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest))
}
