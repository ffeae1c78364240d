//! Parsing helpers for raw configuration values.

use std::time::Duration;

use crate::error::ConfigLoadError;

/// Split a comma separated list, dropping blank entries.
pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Split a command line on whitespace. No quoting support; use the config
/// file's array form for arguments containing spaces.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Parse a human-readable duration (`"2s"`, `"5m"`, `"24h"`, `"1h 30m"`).
pub fn parse_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(raw.trim()).map_err(|source| ConfigLoadError::InvalidDuration {
        field,
        value: raw.to_string(),
        source,
    })
}

/// First of the raw values that is set, parsed, or `default`.
pub fn resolve_duration(
    field: &'static str,
    candidates: [Option<&str>; 2],
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match candidates.into_iter().flatten().next() {
        Some(raw) => parse_duration(field, raw),
        None => Ok(default),
    }
}
