//! Configuration loading for strm-mirror.
//!
//! Resolution order is `.env` (via `dotenvy`), then the config file (explicit
//! path, `$STRM_MIRROR_CONFIG`, or a default location), then `STRM_MIRROR_*`
//! environment overrides, then defaults shared with `strm-mirror-core`.
//! Guard rails reject configurations the daemon cannot run with; softer
//! findings come back as [`ConfigWarnings`].

pub mod error;
pub mod loader;
pub mod models;
pub mod sources;
pub mod util;
pub mod validation;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader};
pub use models::{ConfigMetadata, ConfigSource, IdentifierConfig, MirrorConfig, RefreshConfig};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
