//! Shared defaults that align with the configuration knobs.
//!
//! Keeping the values in one place lets the config crate and the daemon agree
//! on what an unset field means without duplicating constants.

use std::time::Duration;

/// Extension (without the dot) of the placeholder link files being mirrored.
pub const DEFAULT_MIRROR_EXTENSION: &str = "strm";

/// Quiet period after the last accepted event before a batch is processed.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Cadence of the authoritative full reconciliation.
pub const DEFAULT_FULL_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortened cadence used after a failed or inconclusive scheduled full sync.
pub const DEFAULT_FULL_SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Consecutive failed batches tolerated for one path before it is quarantined.
pub const DEFAULT_MAX_PATH_RETRIES: u32 = 10;

/// Cadence of the remote refresh job.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Upper bound on a single refresh command run.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How long shutdown waits for each loop before giving up on it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalise an extension the way the mapper and watcher compare them:
/// no leading dot, lower-case.
pub fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_ascii_lowercase()
}
