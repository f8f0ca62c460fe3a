use thiserror::Error;

/// Failures surfaced by the playback core.
///
/// Transport misuse (pausing while stopped, seeking after close, ...) is never an error;
/// those calls are silent no-ops.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Payload was empty or malformed. No session is produced.
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Output device could not be opened or resumed.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
