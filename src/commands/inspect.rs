use std::path::Path;
use anyhow::{Result, Context};

use crate::audio::decode::{decode_payload, DecodeOptions};
use crate::audio::timeline::format_time;
use crate::state::Settings;

pub fn do_inspect(settings: &Settings, file: &Path) -> Result<()> {
    let payload = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read payload file {}", file.display()))?;

    let buffer = decode_payload(&payload, DecodeOptions::from(&settings.playback))
        .context("Payload is not playable")?;

    println!("channels:    {}", buffer.channel_count());
    println!("sample rate: {}Hz", buffer.sample_rate());
    println!("frames:      {}", buffer.frames());
    println!("duration:    {} ({:.3}s)", format_time(buffer.duration_seconds()), buffer.duration_seconds());
    Ok(())
}
