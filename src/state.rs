use std::fmt;
use serde::{Serialize, Deserialize};

/// Transport state of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub general: GeneralSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playback: PlaybackSettings::default(),
            general: GeneralSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Sample rate of the raw PCM delivered by the speech backend
    pub sample_rate: u32,
    /// Interleaved channel count of the raw PCM
    pub channels: u16,
    pub progress_interval_ms: u64,
    pub initial_volume: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            progress_interval_ms: 100,
            initial_volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// tracing-subscriber filter used when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&PlaybackState::Playing).unwrap(), "\"playing\"");
        assert_eq!(PlaybackState::Paused.to_string(), "paused");
        assert_eq!(PlaybackState::default(), PlaybackState::Stopped);
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"playback": {"sample_rate": 16000}}"#).unwrap();
        assert_eq!(settings.playback.sample_rate, 16000);
        assert_eq!(settings.playback.channels, 1);
        assert_eq!(settings.playback.progress_interval_ms, 100);
        assert_eq!(settings.general.log_filter, "info");
    }
}
