// Silent output device clocked by the tokio timer.
// Under tokio's paused test clock, simulated seconds pass deterministically.
// Voices finish on the device clock, so nothing completes while suspended.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::{AudioDevice, DeviceState, EndedHandler, GainStage, Voice};
use crate::audio::buffer::AudioBuffer;
use crate::error::{PlaybackError, Result};

struct Clock {
    state: DeviceState,
    accumulated: f64,
    running_since: Option<Instant>,
}

impl Clock {
    fn now(&self) -> f64 {
        self.accumulated
            + self
                .running_since
                .map(|since| since.elapsed().as_secs_f64())
                .unwrap_or(0.0)
    }

    fn freeze(&mut self) {
        self.accumulated = self.now();
        self.running_since = None;
    }
}

pub struct SimulatedDevice {
    clock: Arc<Mutex<Clock>>,
    state_tx: watch::Sender<DeviceState>,
    runtime: Handle,
    active_voices: Arc<AtomicUsize>,
    voices_created: AtomicUsize,
}

impl SimulatedDevice {
    /// Create a running device. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_state(DeviceState::Running)
    }

    /// Create a device that starts suspended, the way browsers hold audio until a user gesture.
    pub fn new_suspended() -> Self {
        Self::with_state(DeviceState::Suspended)
    }

    fn with_state(state: DeviceState) -> Self {
        let running_since = match state {
            DeviceState::Running => Some(Instant::now()),
            _ => None,
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            clock: Arc::new(Mutex::new(Clock {
                state,
                accumulated: 0.0,
                running_since,
            })),
            state_tx,
            runtime: Handle::current(),
            active_voices: Arc::new(AtomicUsize::new(0)),
            voices_created: AtomicUsize::new(0),
        }
    }

    /// Voices started and not yet stopped or finished
    pub fn active_voices(&self) -> usize {
        self.active_voices.load(Ordering::SeqCst)
    }

    pub fn voices_created(&self) -> usize {
        self.voices_created.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for SimulatedDevice {
    fn state(&self) -> DeviceState {
        self.clock.lock().state
    }

    fn resume(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut clock = self.clock.lock();
            match clock.state {
                DeviceState::Closed => Err(PlaybackError::DeviceUnavailable("device is closed".into())),
                DeviceState::Running => Ok(()),
                DeviceState::Suspended => {
                    clock.state = DeviceState::Running;
                    clock.running_since = Some(Instant::now());
                    self.state_tx.send_replace(DeviceState::Running);
                    Ok(())
                }
            }
        })
    }

    fn suspend(&self) {
        let mut clock = self.clock.lock();
        if clock.state == DeviceState::Running {
            clock.freeze();
            clock.state = DeviceState::Suspended;
            self.state_tx.send_replace(DeviceState::Suspended);
        }
    }

    fn current_time(&self) -> f64 {
        self.clock.lock().now()
    }

    fn create_voice(&self, buffer: Arc<AudioBuffer>, _gain: Arc<GainStage>) -> Result<Box<dyn Voice>> {
        if self.state() == DeviceState::Closed {
            return Err(PlaybackError::DeviceUnavailable("device is closed".into()));
        }
        self.voices_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedVoice {
            duration: buffer.duration_seconds(),
            clock: Arc::clone(&self.clock),
            state_changes: self.state_tx.subscribe(),
            runtime: self.runtime.clone(),
            handler: Arc::new(Mutex::new(None)),
            timer: None,
            sounding: Arc::new(AtomicBool::new(false)),
            active_voices: Arc::clone(&self.active_voices),
            started: false,
        }))
    }

    fn close(&self) {
        let mut clock = self.clock.lock();
        if clock.state != DeviceState::Closed {
            clock.freeze();
            clock.state = DeviceState::Closed;
            self.state_tx.send_replace(DeviceState::Closed);
            tracing::debug!("Simulated device closed at {:.3}s", clock.accumulated);
        }
    }
}

struct SimulatedVoice {
    duration: f64,
    clock: Arc<Mutex<Clock>>,
    state_changes: watch::Receiver<DeviceState>,
    runtime: Handle,
    handler: Arc<Mutex<Option<EndedHandler>>>,
    timer: Option<JoinHandle<()>>,
    sounding: Arc<AtomicBool>,
    active_voices: Arc<AtomicUsize>,
    started: bool,
}

impl SimulatedVoice {
    fn release(&self) {
        if self.sounding.swap(false, Ordering::SeqCst) {
            self.active_voices.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Voice for SimulatedVoice {
    fn set_on_ended(&mut self, handler: Option<EndedHandler>) {
        *self.handler.lock() = handler;
    }

    fn start(&mut self, offset_seconds: f64) {
        if self.started {
            return;
        }
        self.started = true;
        self.sounding.store(true, Ordering::SeqCst);
        self.active_voices.fetch_add(1, Ordering::SeqCst);

        let remaining = (self.duration - offset_seconds).max(0.0);
        let clock = Arc::clone(&self.clock);
        let ends_at = clock.lock().now() + remaining;
        let mut state_changes = self.state_changes.clone();
        let handler = Arc::clone(&self.handler);
        let sounding = Arc::clone(&self.sounding);
        let active_voices = Arc::clone(&self.active_voices);
        self.timer = Some(self.runtime.spawn(async move {
            loop {
                state_changes.borrow_and_update();
                let left = {
                    let clock = clock.lock();
                    match clock.state {
                        DeviceState::Closed => return,
                        DeviceState::Suspended => None,
                        DeviceState::Running => Some(ends_at - clock.now()),
                    }
                };
                match left {
                    // Sub-microsecond leftovers are float noise, not audio
                    Some(left) if left <= 1e-6 => break,
                    Some(left) => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs_f64(left)) => {}
                            changed = state_changes.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if state_changes.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
            if sounding.swap(false, Ordering::SeqCst) {
                active_voices.fetch_sub(1, Ordering::SeqCst);
            }
            let ended = handler.lock().take();
            if let Some(ended) = ended {
                ended();
            }
        }));
    }

    fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let was_sounding = self.sounding.load(Ordering::SeqCst);
        self.release();
        if was_sounding {
            let ended = self.handler.lock().take();
            if let Some(ended) = ended {
                ended();
            }
        }
    }

    fn disconnect(&mut self) {
        // Output is silent either way; the timer keeps running like a detached source would.
    }
}

impl Drop for SimulatedVoice {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_second_buffer() -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::from_planar(vec![vec![0.0; 1000]], 1000))
    }

    #[tokio::test(start_paused = true)]
    async fn clock_is_frozen_while_suspended() {
        let device = SimulatedDevice::new_suspended();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(device.current_time(), 0.0);

        device.resume().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!((device.current_time() - 3.0).abs() < 1e-6);

        device.suspend();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((device.current_time() - 3.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn voice_fires_ended_at_end_of_buffer() {
        let device = SimulatedDevice::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut voice = device
            .create_voice(one_second_buffer(), Arc::new(GainStage::new(1.0)))
            .unwrap();
        let counter = Arc::clone(&fired);
        voice.set_on_ended(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        voice.start(0.25);
        assert_eq!(device.active_voices(), 1);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(device.active_voices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fires_attached_handler_but_not_detached_one() {
        let device = SimulatedDevice::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let mut attached = device
            .create_voice(one_second_buffer(), Arc::new(GainStage::new(1.0)))
            .unwrap();
        let counter = Arc::clone(&fired);
        attached.set_on_ended(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        attached.start(0.0);
        attached.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let mut detached = device
            .create_voice(one_second_buffer(), Arc::new(GainStage::new(1.0)))
            .unwrap();
        let counter = Arc::clone(&fired);
        detached.set_on_ended(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        detached.start(0.0);
        detached.set_on_ended(None);
        detached.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(device.active_voices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_device_holds_voice_completion() {
        let device = SimulatedDevice::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut voice = device
            .create_voice(one_second_buffer(), Arc::new(GainStage::new(1.0)))
            .unwrap();
        let counter = Arc::clone(&fired);
        voice.set_on_ended(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        voice.start(0.0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        device.suspend();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(device.active_voices(), 1);

        device.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(device.active_voices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_device_drops_pending_completion() {
        let device = SimulatedDevice::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut voice = device
            .create_voice(one_second_buffer(), Arc::new(GainStage::new(1.0)))
            .unwrap();
        let counter = Arc::clone(&fired);
        voice.set_on_ended(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        voice.start(0.0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        device.close();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_device_refuses_voices_and_resume() {
        let device = SimulatedDevice::new();
        device.close();
        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(device
            .create_voice(one_second_buffer(), Arc::new(GainStage::new(1.0)))
            .is_err());
        assert!(matches!(device.resume().await, Err(PlaybackError::DeviceUnavailable(_))));
    }
}
