//! Initialize the configuration directory: create ~/.forwarder and a default config file.
//!
//! The default config mirrors `crates/lib/config/config.example.json`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

static DEFAULT_CONFIG: &str = include_str!("../config/config.example.json");

/// Create the config directory and default config if they do not exist. An existing config file
/// is left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::info!("config already exists at {}, leaving it untouched", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}
