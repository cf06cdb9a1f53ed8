//! Session configuration file resolution.
//!
//! Priority for the configuration file:
//! 1. `--config <file>` (explicit option)
//! 2. `BRAILINK_CONFIG` (environment override)
//! 3. `{config_dir}/brailink/config.json` (platform config directory)
//!
//! An explicitly named file must exist. The default file is optional; when
//! it is missing the built-in [`SessionConfig`] defaults apply.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use brailink_core::SessionConfig;
use tracing::debug;

/// Where the configuration file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Environment(PathBuf),
    Default(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::Explicit(path)
            | ConfigSource::Environment(path)
            | ConfigSource::Default(path) => path,
        }
    }

    fn is_required(&self) -> bool {
        !matches!(self, ConfigSource::Default(_))
    }
}

/// Find the configuration file with priority fallback.
///
/// Returns `None` when no option or override is given and the platform has
/// no config directory.
pub fn config_source(explicit: Option<&Path>) -> Option<ConfigSource> {
    if let Some(path) = explicit {
        return Some(ConfigSource::Explicit(path.to_path_buf()));
    }

    // Ignore empty, like an unset variable
    if let Ok(path) = env::var("BRAILINK_CONFIG") {
        if !path.is_empty() {
            return Some(ConfigSource::Environment(PathBuf::from(path)));
        }
    }

    dirs::config_dir().map(|dir| ConfigSource::Default(dir.join("brailink").join("config.json")))
}

/// Load the session configuration.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<SessionConfig> {
    let Some(source) = config_source(explicit) else {
        debug!("No config directory, using defaults");
        return Ok(SessionConfig::default());
    };
    let path = source.path();

    if !source.is_required() && !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Ok(SessionConfig::default());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SessionConfig = serde_json::from_str(&text)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}
