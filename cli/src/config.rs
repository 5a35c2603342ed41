// Configuration file handling for the bleman CLI
//
// Without --config the file is looked up in:
// - macOS: ~/Library/Application Support/bleman/config.json
// - Linux: ~/.config/bleman/config.json
// - Windows: %APPDATA%\bleman\config.json
// A missing default file means built-in defaults; a missing --config file is
// an error.

use anyhow::{bail, Context, Result};
use bleman_core::CentralConfig;
use std::path::{Path, PathBuf};

/// Default config file path (cross-platform)
pub fn default_path() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("bleman")
        .join("config.json"))
}

/// Resolve and load the effective configuration
pub fn load(explicit: Option<&Path>) -> Result<CentralConfig> {
    match explicit {
        Some(path) => CentralConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            let path = default_path()?;
            if path.exists() {
                CentralConfig::load(&path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))
            } else {
                Ok(CentralConfig::default())
            }
        }
    }
}

/// Write a default config file, refusing to overwrite an existing one
pub fn init(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    CentralConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}
