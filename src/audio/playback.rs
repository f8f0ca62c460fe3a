//! Playback session: one decoded clip behind a seekable, pausable transport.
//!
//! A session owns its buffer, a gain stage shared by every voice it creates, and at
//! most one live [`Voice`]. Voices are created on every transition into `playing` and
//! destroyed on every transition out of it. Position is an accumulator updated only at
//! those boundaries; see [`timeline`](super::timeline).

use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use super::buffer::AudioBuffer;
use super::decode::{self, DecodeOptions};
use super::device::{AudioDevice, DeviceState, GainStage, Voice};
use super::timeline;
use crate::error::{PlaybackError, Result};
use crate::state::{PlaybackSettings, PlaybackState};

type StateCallback = Arc<dyn Fn(PlaybackState) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(f64, f64) + Send + Sync>;
type EndedCallback = Arc<dyn Fn() + Send + Sync>;

/// Single-slot observers: registering replaces the previous callback.
#[derive(Default)]
struct Callbacks {
    on_state_change: Option<StateCallback>,
    on_progress: Option<ProgressCallback>,
    on_ended: Option<EndedCallback>,
}

/// Collected under the transport lock, delivered after it is released.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Notification {
    State(PlaybackState),
    Progress(f64),
    Ended,
}

struct Transport {
    state: PlaybackState,
    logical_position: f64,
    clock_at_start: f64,
    voice: Option<Box<dyn Voice>>,
    voice_generation: u64,
    ticker: Option<JoinHandle<()>>,
    closed: bool,
    callbacks: Callbacks,
}

impl Transport {
    fn release_voice(&mut self) {
        if let Some(mut voice) = self.voice.take() {
            // Detach first so the forced stop is not reported as natural completion
            voice.set_on_ended(None);
            voice.stop();
            voice.disconnect();
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    fn teardown(&mut self, gain: &GainStage, device: &dyn AudioDevice) {
        self.closed = true;
        self.release_voice();
        self.stop_ticker();
        self.state = PlaybackState::Stopped;
        gain.disconnect();
        device.close();
    }
}

struct Shared {
    buffer: Arc<AudioBuffer>,
    duration: f64,
    device: Arc<dyn AudioDevice>,
    gain: Arc<GainStage>,
    progress_interval: Duration,
    runtime: Handle,
    transport: Mutex<Transport>,
}

impl Shared {
    fn position_locked(&self, t: &Transport) -> f64 {
        timeline::current_position(
            t.state,
            t.logical_position,
            t.clock_at_start,
            self.device.current_time(),
            self.duration,
        )
    }

    /// Start a fresh voice at `offset`. An offset equal to the duration yields a voice
    /// that completes at once.
    fn start_locked(self: &Arc<Self>, t: &mut Transport, offset: f64) -> Result<Vec<Notification>> {
        if t.closed || t.state == PlaybackState::Playing {
            return Ok(Vec::new());
        }
        let mut voice = self.device.create_voice(Arc::clone(&self.buffer), Arc::clone(&self.gain))?;

        t.voice_generation += 1;
        let generation = t.voice_generation;
        let weak = Arc::downgrade(self);
        voice.set_on_ended(Some(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.finish_naturally(generation);
            }
        })));

        t.logical_position = offset;
        t.clock_at_start = self.device.current_time();
        voice.start(offset);

        t.voice = Some(voice);
        t.state = PlaybackState::Playing;
        t.stop_ticker();
        t.ticker = Some(self.spawn_ticker());

        tracing::debug!("Playing from {:.3}s (voice #{})", offset, generation);
        Ok(vec![Notification::State(PlaybackState::Playing)])
    }

    fn pause_locked(&self, t: &mut Transport) -> Vec<Notification> {
        if t.closed || t.state != PlaybackState::Playing {
            return Vec::new();
        }
        let now = self.device.current_time();
        t.logical_position = timeline::accumulate(t.logical_position, t.clock_at_start, now).min(self.duration);
        t.release_voice();
        t.stop_ticker();
        t.state = PlaybackState::Paused;

        tracing::debug!("Paused at {:.3}s", t.logical_position);
        vec![Notification::State(PlaybackState::Paused)]
    }

    /// Ended handler of voice `generation`. Ignored unless that voice is still the
    /// active one and the session is still playing.
    fn finish_naturally(&self, generation: u64) {
        let notes = {
            let mut t = self.transport.lock();
            if t.closed || t.state != PlaybackState::Playing || t.voice_generation != generation {
                return;
            }
            t.stop_ticker();
            if let Some(mut voice) = t.voice.take() {
                voice.disconnect();
            }
            t.state = PlaybackState::Stopped;
            t.logical_position = 0.0;
            vec![Notification::State(PlaybackState::Stopped), Notification::Ended]
        };
        tracing::debug!("Playback reached end of clip");
        self.dispatch(notes);
    }

    fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let period = self.progress_interval;
        self.runtime.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let report = {
                    let t = shared.transport.lock();
                    if t.closed || t.state != PlaybackState::Playing {
                        None
                    } else {
                        Some((shared.position_locked(&t), t.callbacks.on_progress.clone()))
                    }
                };
                match report {
                    None => break,
                    Some((position, Some(callback))) => callback(position, shared.duration),
                    Some((_, None)) => {}
                }
            }
        })
    }

    fn dispatch(&self, notes: Vec<Notification>) {
        for note in notes {
            match note {
                Notification::State(state) => {
                    let callback = self.transport.lock().callbacks.on_state_change.clone();
                    if let Some(callback) = callback {
                        callback(state);
                    }
                }
                Notification::Progress(position) => {
                    let callback = self.transport.lock().callbacks.on_progress.clone();
                    if let Some(callback) = callback {
                        callback(position, self.duration);
                    }
                }
                Notification::Ended => {
                    let callback = self.transport.lock().callbacks.on_ended.clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let transport = self.transport.get_mut();
        if !transport.closed {
            transport.teardown(&self.gain, self.device.as_ref());
        }
    }
}

/// Handle to a playback session. Clones share the same session; the session is
/// closed when the last handle is dropped.
#[derive(Clone)]
pub struct PlaybackSession {
    shared: Arc<Shared>,
}

impl PlaybackSession {
    /// Decode `payload` and bind it to `device`. Decoding runs on the blocking pool.
    pub async fn create(
        payload: &str,
        device: Arc<dyn AudioDevice>,
        settings: &PlaybackSettings,
    ) -> Result<Self> {
        let options = DecodeOptions::from(settings);
        let payload = payload.to_owned();
        let buffer = tokio::task::spawn_blocking(move || decode::decode_payload(&payload, options))
            .await
            .map_err(|e| PlaybackError::Decode(format!("decode task failed: {}", e)))??;
        Self::create_from_buffer(Arc::new(buffer), device, settings)
    }

    /// Bind an already decoded buffer. Must be called from within a tokio runtime.
    pub fn create_from_buffer(
        buffer: Arc<AudioBuffer>,
        device: Arc<dyn AudioDevice>,
        settings: &PlaybackSettings,
    ) -> Result<Self> {
        if buffer.is_empty() || buffer.sample_rate() == 0 {
            return Err(PlaybackError::Decode("buffer contains no audio frames".into()));
        }
        let runtime = Handle::try_current()
            .map_err(|e| PlaybackError::DeviceUnavailable(format!("no timer runtime: {}", e)))?;

        let duration = buffer.duration_seconds();
        tracing::info!(
            "Playback session created ({:.2}s, {} channel(s) at {}Hz)",
            duration,
            buffer.channel_count(),
            buffer.sample_rate()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                buffer,
                duration,
                device,
                gain: Arc::new(GainStage::new(settings.initial_volume.clamp(0.0, 1.0))),
                progress_interval: Duration::from_millis(settings.progress_interval_ms.max(1)),
                runtime,
                transport: Mutex::new(Transport {
                    state: PlaybackState::Stopped,
                    logical_position: 0.0,
                    clock_at_start: 0.0,
                    voice: None,
                    voice_generation: 0,
                    ticker: None,
                    closed: false,
                    callbacks: Callbacks::default(),
                }),
            }),
        })
    }

    /// Start or resume playback. Resolves once the device is running and the voice
    /// is scheduled. No-op while playing or after close. A position at the end of
    /// the clip restarts from the beginning.
    pub async fn play(&self) -> Result<()> {
        {
            let t = self.shared.transport.lock();
            if t.closed || t.state == PlaybackState::Playing {
                return Ok(());
            }
        }

        if self.shared.device.state() == DeviceState::Suspended {
            self.shared.device.resume().await?;
        }

        let notes = {
            let mut t = self.shared.transport.lock();
            let offset = timeline::start_offset(t.logical_position, self.shared.duration);
            self.shared.start_locked(&mut t, offset)?
        };
        self.shared.dispatch(notes);
        Ok(())
    }

    pub fn pause(&self) {
        let notes = {
            let mut t = self.shared.transport.lock();
            self.shared.pause_locked(&mut t)
        };
        self.shared.dispatch(notes);
    }

    /// Reposition to `seconds`, clamped to the clip. Playback continues from the new
    /// position if it was running.
    pub fn seek(&self, seconds: f64) {
        let (notes, resume_async) = {
            let mut t = self.shared.transport.lock();
            if t.closed {
                return;
            }
            let target = timeline::clamp_seek(seconds, self.shared.duration);
            let was_playing = t.state == PlaybackState::Playing;

            let mut notes = self.shared.pause_locked(&mut t);
            t.logical_position = target;
            notes.push(Notification::Progress(target));

            let mut resume_async = false;
            if was_playing {
                if self.shared.device.state() == DeviceState::Running {
                    // Seeking to the very end plays out the remainder, which is nothing
                    match self.shared.start_locked(&mut t, target) {
                        Ok(started) => notes.extend(started),
                        Err(e) => tracing::warn!("Failed to restart after seek: {}", e),
                    }
                } else {
                    resume_async = true;
                }
            }
            (notes, resume_async)
        };
        self.shared.dispatch(notes);

        if resume_async {
            let session = self.clone();
            self.shared.runtime.spawn(async move {
                if let Err(e) = session.resume_in_place().await {
                    tracing::warn!("Failed to resume after seek: {}", e);
                }
            });
        }
    }

    /// Resume the device, then start from the logical position as is.
    async fn resume_in_place(&self) -> Result<()> {
        if self.shared.device.state() == DeviceState::Suspended {
            self.shared.device.resume().await?;
        }
        let notes = {
            let mut t = self.shared.transport.lock();
            let offset = t.logical_position;
            self.shared.start_locked(&mut t, offset)?
        };
        self.shared.dispatch(notes);
        Ok(())
    }

    /// Seek to a fraction of the clip, as from a click on a progress bar.
    pub fn seek_fraction(&self, fraction: f64) {
        if self.shared.duration <= 0.0 || fraction.is_nan() {
            return;
        }
        self.seek(fraction.clamp(0.0, 1.0) * self.shared.duration);
    }

    /// Set the linear output gain. Clamped to [0, 1]; non-finite values are ignored.
    pub fn set_volume(&self, level: f32) {
        if !level.is_finite() || self.is_closed() {
            return;
        }
        self.shared.gain.set_level(level.clamp(0.0, 1.0));
    }

    /// Nudge the volume by `delta`, rounded to one decimal. Returns the new level.
    pub fn step_volume(&self, delta: f32) -> f32 {
        let next = ((self.volume() + delta).clamp(0.0, 1.0) * 10.0).round() / 10.0;
        self.set_volume(next);
        self.volume()
    }

    /// Pause when playing, otherwise play.
    pub async fn toggle(&self) -> Result<()> {
        if self.state() == PlaybackState::Playing {
            self.pause();
            Ok(())
        } else {
            self.play().await
        }
    }

    /// Tear everything down. Safe to call repeatedly and from any state; every
    /// transport call afterwards is a no-op.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut t = shared.transport.lock();
        if t.closed {
            return;
        }
        t.teardown(&shared.gain, shared.device.as_ref());
        tracing::info!("Playback session closed");
    }

    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(PlaybackState) + Send + Sync + 'static,
    {
        self.shared.transport.lock().callbacks.on_state_change = Some(Arc::new(callback));
    }

    /// Called with `(position, duration)` in seconds on every ticker period while
    /// playing, and once after each seek.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(f64, f64) + Send + Sync + 'static,
    {
        self.shared.transport.lock().callbacks.on_progress = Some(Arc::new(callback));
    }

    pub fn on_ended<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.transport.lock().callbacks.on_ended = Some(Arc::new(callback));
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.transport.lock().state
    }

    pub fn position(&self) -> f64 {
        let t = self.shared.transport.lock();
        self.shared.position_locked(&t)
    }

    pub fn duration(&self) -> f64 {
        self.shared.duration
    }

    pub fn volume(&self) -> f32 {
        self.shared.gain.level()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.transport.lock().closed
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.shared.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::SimulatedDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn clip(seconds: usize) -> Arc<AudioBuffer> {
        Arc::new(AudioBuffer::from_planar(vec![vec![0.0; seconds * 100]], 100))
    }

    fn session(seconds: usize) -> (PlaybackSession, Arc<SimulatedDevice>) {
        let device = Arc::new(SimulatedDevice::new());
        let session = PlaybackSession::create_from_buffer(
            clip(seconds),
            device.clone(),
            &PlaybackSettings::default(),
        )
        .unwrap();
        (session, device)
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_is_stopped_at_zero() {
        let (session, device) = session(3);
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert_eq!(session.position(), 0.0);
        assert!((session.duration() - 3.0).abs() < 1e-12);
        assert_eq!(device.voices_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn play_is_idempotent() {
        let (session, device) = session(5);
        session.play().await.unwrap();
        session.play().await.unwrap();
        assert_eq!(device.voices_created(), 1);
        assert_eq!(device.active_voices(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_play_gets_a_fresh_voice() {
        let (session, device) = session(5);
        for _ in 0..3 {
            session.play().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            session.pause();
            assert_eq!(device.active_voices(), 0);
        }
        assert_eq!(device.voices_created(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn misuse_is_a_silent_no_op() {
        let (session, _device) = session(2);
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        session.on_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.pause();
        session.pause();
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_may_reenter_the_session() {
        let (session, _device) = session(1);
        let inner = session.clone();
        session.on_ended(move || inner.seek(0.5));

        session.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(session.state(), PlaybackState::Stopped);
        assert!((session.position() - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_handle_closes_device() {
        let (session, device) = session(4);
        session.play().await.unwrap();
        drop(session);
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(device.active_voices(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_device_is_resumed_by_play() {
        let device = Arc::new(SimulatedDevice::new_suspended());
        let session = PlaybackSession::create_from_buffer(clip(2), device.clone(), &PlaybackSettings::default())
            .unwrap();
        session.play().await.unwrap();
        assert_eq!(device.state(), DeviceState::Running);
        assert_eq!(session.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn play_on_externally_closed_device_fails() {
        let (session, device) = session(2);
        device.close();

        let result = session.play().await;

        assert!(matches!(result, Err(PlaybackError::DeviceUnavailable(_))));
        assert_eq!(session.state(), PlaybackState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_skips_missed_ticks_after_a_stall() {
        let (session, _device) = session(5);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        session.on_progress(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.play().await.unwrap();
        // Jump past three periods at once: one late tick, then back on the 100ms grid
        tokio::time::advance(Duration::from_millis(350)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_buffer_is_rejected() {
        let device = Arc::new(SimulatedDevice::new());
        let empty = Arc::new(AudioBuffer::from_planar(vec![Vec::new()], 24000));
        let result = PlaybackSession::create_from_buffer(empty, device, &PlaybackSettings::default());
        assert!(matches!(result, Err(PlaybackError::Decode(_))));
    }

    #[test]
    fn creating_outside_a_runtime_reports_unavailable() {
        let device: Arc<dyn AudioDevice> = {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let _guard = rt.enter();
            Arc::new(SimulatedDevice::new())
        };
        let result = PlaybackSession::create_from_buffer(clip(1), device, &PlaybackSettings::default());
        assert!(matches!(result, Err(PlaybackError::DeviceUnavailable(_))));
    }
}
