use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use vortex_protocol::VortexConfig;

pub const DEFAULT_CONFIG_PATH: &str = "vortex.toml";

/// Load the TOML config at `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<VortexConfig> {
    if !path.exists() {
        tracing::warn!("Config file not found at {}, using defaults", path.display());
        return Ok(VortexConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: VortexConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Config file location: `VORTEX_CONFIG` if set, else `vortex.toml`.
pub fn config_path<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("VORTEX_CONFIG")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load, apply environment overrides and validate.
///
/// Warnings are logged; any error aborts with every error line in the message.
pub fn load_with_env<F>(path: &Path, lookup: F) -> Result<VortexConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = load_config(path)?;
    for issue in config.apply_env_overrides(lookup) {
        tracing::warn!("{issue}");
    }

    if let Err(issues) = config.validate() {
        let (errors, warnings): (Vec<_>, Vec<_>) =
            issues.into_iter().partition(|i| i.starts_with("ERROR"));
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        if !errors.is_empty() {
            for error in &errors {
                tracing::error!("{error}");
            }
            bail!("Invalid configuration:\n{}", errors.join("\n"));
        }
    }
    Ok(config)
}

/// [`load_with_env`] against the process environment.
pub fn from_env() -> Result<VortexConfig> {
    let lookup = |key: &str| std::env::var(key).ok();
    let path = config_path(lookup);
    load_with_env(&path, lookup)
}
