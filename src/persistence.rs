use std::path::{Path, PathBuf};
use anyhow::{Result, Context};
use crate::state::Settings;

const APP_DIR: &str = "ReadAloud";
const SETTINGS_FILE: &str = "settings.json";

/// Get the default settings file path
pub fn default_settings_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot find user configuration directory"))?;
    Ok(config_dir.join(APP_DIR).join(SETTINGS_FILE))
}

pub fn load_settings(path: &Path) -> Settings {
    if !path.exists() {
        tracing::info!("No stored settings at {}. Using defaults.", path.display());
        return Settings::default();
    }

    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Failed to read settings file {}: {}. Using defaults.", path.display(), e);
            return Settings::default();
        }
    };

    match serde_json::from_str::<Settings>(&data) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to deserialize stored settings: {}. Using defaults.", e);
            Settings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .context("Failed to create settings directory")?;
    }
    let data = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, data)
        .with_context(|| format!("Failed to write settings to {}", path.display()))?;
    Ok(())
}
