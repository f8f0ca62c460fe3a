use std::sync::Arc;
use parking_lot::Mutex;

use super::device::{self, AudioDevice};
use super::playback::PlaybackSession;
use crate::error::Result;
use crate::state::PlaybackSettings;

pub type DeviceFactory = Arc<dyn Fn() -> Result<Arc<dyn AudioDevice>> + Send + Sync>;

/// Holds the one live session of the application. Loading a new clip closes the
/// previous session first; each session gets its own device.
pub struct PlayerSlot {
    settings: PlaybackSettings,
    open_device: DeviceFactory,
    current: Mutex<Option<PlaybackSession>>,
}

impl PlayerSlot {
    pub fn new<F>(settings: PlaybackSettings, open_device: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn AudioDevice>> + Send + Sync + 'static,
    {
        Self {
            settings,
            open_device: Arc::new(open_device),
            current: Mutex::new(None),
        }
    }

    pub fn with_default_device(settings: PlaybackSettings) -> Self {
        let device_settings = settings.clone();
        Self::new(settings, move || device::open_default_device(&device_settings))
    }

    /// Replace the current session with one built from `payload`. On failure the
    /// slot is left empty.
    pub async fn load(&self, payload: &str) -> Result<PlaybackSession> {
        self.clear();

        let device = (self.open_device)()?;
        let session = match PlaybackSession::create(payload, Arc::clone(&device), &self.settings).await {
            Ok(session) => session,
            Err(e) => {
                device.close();
                tracing::warn!("Failed to load speech clip: {}", e);
                return Err(e);
            }
        };

        if let Some(previous) = self.current.lock().replace(session.clone()) {
            previous.close();
        }
        Ok(session)
    }

    pub fn current(&self) -> Option<PlaybackSession> {
        self.current.lock().clone()
    }

    /// Close and forget the current session, if any.
    pub fn clear(&self) {
        let previous = self.current.lock().take();
        if let Some(previous) = previous {
            previous.close();
        }
    }
}
