#[cfg(feature = "cpal-output")]
mod cpal_output;
mod simulated;

#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalDevice;
pub use simulated::SimulatedDevice;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use futures_util::future::BoxFuture;
use serde::{Serialize, Deserialize};

use super::buffer::AudioBuffer;
use crate::error::Result;
use crate::state::PlaybackSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Running,
    Suspended,
    Closed,
}

/// Runs when a voice stops, whether it reached the end of the buffer or was stopped.
pub type EndedHandler = Box<dyn FnOnce() + Send + 'static>;

/// An output device with its own clock. Owns the render path; sessions only
/// schedule voices on it.
pub trait AudioDevice: Send + Sync {
    fn state(&self) -> DeviceState;

    /// Resume a suspended device. Resolves once the clock is running again.
    fn resume(&self) -> BoxFuture<'_, Result<()>>;

    fn suspend(&self);

    /// Device clock in seconds. Monotonic, frozen while suspended.
    fn current_time(&self) -> f64;

    /// Allocate a one-shot voice bound to `buffer` and routed through `gain`.
    /// Fails with `DeviceUnavailable` once the device is closed or when the buffer
    /// cannot be rendered at the device rate.
    fn create_voice(&self, buffer: Arc<AudioBuffer>, gain: Arc<GainStage>) -> Result<Box<dyn Voice>>;

    /// Release the device. Idempotent.
    fn close(&self);
}

/// One hardware-scheduled run of a buffer from a given offset. Never restarted.
pub trait Voice: Send {
    /// Replace the ended handler. `None` detaches it.
    fn set_on_ended(&mut self, handler: Option<EndedHandler>);

    fn start(&mut self, offset_seconds: f64);

    /// Halt output. An attached ended handler fires, so detach it first for a
    /// programmatic stop.
    fn stop(&mut self);

    /// Remove the voice from the output graph.
    fn disconnect(&mut self);
}

/// Linear output gain shared by every voice a session creates.
#[derive(Debug)]
pub struct GainStage {
    level_bits: AtomicU32,
    connected: AtomicBool,
}

impl GainStage {
    pub fn new(level: f32) -> Self {
        Self {
            level_bits: AtomicU32::new(level.to_bits()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_level(&self, level: f32) {
        self.level_bits.store(level.to_bits(), Ordering::Release);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Acquire))
    }

    /// Gain actually applied to output: silence once disconnected.
    pub fn effective_level(&self) -> f32 {
        if self.is_connected() {
            self.level()
        } else {
            0.0
        }
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Open the platform's default output device.
#[cfg(feature = "cpal-output")]
pub fn open_default_device(settings: &PlaybackSettings) -> Result<Arc<dyn AudioDevice>> {
    Ok(Arc::new(CpalDevice::open(settings.sample_rate)?))
}

/// Open the platform's default output device.
#[cfg(not(feature = "cpal-output"))]
pub fn open_default_device(_settings: &PlaybackSettings) -> Result<Arc<dyn AudioDevice>> {
    Err(crate::error::PlaybackError::DeviceUnavailable(
        "built without the `cpal-output` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_applies_until_disconnected() {
        let gain = GainStage::new(0.8);
        assert_eq!(gain.effective_level(), 0.8);
        gain.set_level(0.3);
        assert_eq!(gain.level(), 0.3);
        gain.disconnect();
        assert!(!gain.is_connected());
        assert_eq!(gain.effective_level(), 0.0);
        assert_eq!(gain.level(), 0.3);
    }
}
