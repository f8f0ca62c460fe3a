use std::path::Path;
use anyhow::Result;

use crate::persistence;
use crate::state::Settings;

pub fn do_config(settings: &Settings, path: &Path, write_default: bool) -> Result<()> {
    if write_default {
        persistence::save_settings(path, &Settings::default())?;
        tracing::info!("Wrote default settings to {}", path.display());
        println!("{}", serde_json::to_string_pretty(&Settings::default())?);
    } else {
        println!("# {}", path.display());
        println!("{}", serde_json::to_string_pretty(settings)?);
    }
    Ok(())
}
