// Hardware output via cpal.
// The render callback mixes active voices through their gain stage; the device
// clock is the number of frames the hardware has pulled.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{AudioDevice, DeviceState, EndedHandler, GainStage, Voice};
use crate::audio::buffer::AudioBuffer;
use crate::audio::processing;
use crate::error::{PlaybackError, Result};

struct OutputStream(cpal::Stream);

// Safety: cpal::Stream wraps a platform handle (CoreAudio AudioUnit, ALSA pcm, WASAPI client)
// that is only touched through play/pause/drop. CpalDevice keeps it behind a Mutex, so those
// calls are never concurrent.
unsafe impl Send for OutputStream {}
unsafe impl Sync for OutputStream {}

struct VoiceTrack {
    buffer: Arc<AudioBuffer>,
    cursor: AtomicUsize,
    gain: Arc<GainStage>,
    finished: AtomicBool,
    done: Notify,
}

impl VoiceTrack {
    fn sample_at(&self, frame_offset: usize, channel: usize) -> f32 {
        if self.finished.load(Ordering::Acquire) {
            return 0.0;
        }
        let frame = self.cursor.load(Ordering::Relaxed) + frame_offset;
        if frame >= self.buffer.frames() {
            return 0.0;
        }
        let source = channel % self.buffer.channel_count();
        self.buffer.channel(source)[frame] * self.gain.effective_level()
    }

    fn advance(&self, frames: usize) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let next = self.cursor.load(Ordering::Relaxed) + frames;
        self.cursor.store(next, Ordering::Relaxed);
        if next >= self.buffer.frames() {
            self.finished.store(true, Ordering::Release);
            self.done.notify_one();
        }
    }
}

#[derive(Default)]
struct Mixer {
    voices: Mutex<Vec<Arc<VoiceTrack>>>,
    frames_rendered: AtomicU64,
}

impl Mixer {
    fn render<T: cpal::SizedSample + cpal::FromSample<f32>>(&self, data: &mut [T], channels: usize) {
        let voices = self.voices.lock();
        let frames = data.len() / channels;

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            for (ch, out) in frame.iter_mut().enumerate() {
                let value: f32 = voices.iter().map(|v| v.sample_at(i, ch)).sum();
                *out = T::from_sample(value);
            }
        }

        for voice in voices.iter() {
            voice.advance(frames);
        }
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }

    fn remove(&self, track: &Arc<VoiceTrack>) {
        self.voices.lock().retain(|v| !Arc::ptr_eq(v, track));
    }
}

pub struct CpalDevice {
    stream: Mutex<Option<OutputStream>>,
    mixer: Arc<Mixer>,
    state: Mutex<DeviceState>,
    sample_rate: u32,
    runtime: Handle,
    prepared: Mutex<Option<(Weak<AudioBuffer>, Arc<AudioBuffer>)>>,
}

impl CpalDevice {
    /// Open the default output device, preferring a stream at `target_rate`.
    pub fn open(target_rate: u32) -> Result<Self> {
        let unavailable = |msg: String| PlaybackError::DeviceUnavailable(msg);
        let runtime = Handle::try_current()
            .map_err(|e| unavailable(format!("No tokio runtime for completion events: {}", e)))?;

        let host = cpal::default_host();
        let device = host.default_output_device()
            .ok_or_else(|| unavailable("No output device available".into()))?;

        let preferred = device
            .supported_output_configs()
            .ok()
            .and_then(|mut ranges| {
                ranges.find(|r| {
                    r.sample_format() == SampleFormat::F32
                        && r.min_sample_rate().0 <= target_rate
                        && r.max_sample_rate().0 >= target_rate
                })
            })
            .map(|r| r.with_sample_rate(SampleRate(target_rate)));

        let config = match preferred {
            Some(config) => config,
            None => device.default_output_config()
                .map_err(|e| unavailable(format!("Failed to get default output config: {}", e)))?,
        };

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let sample_format = config.sample_format();
        let stream_config: StreamConfig = config.into();
        let mixer = Arc::new(Mixer::default());

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &stream_config, channels, Arc::clone(&mixer)),
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &stream_config, channels, Arc::clone(&mixer)),
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &stream_config, channels, Arc::clone(&mixer)),
            format => return Err(unavailable(format!("Unsupported sample format: {:?}", format))),
        }?;

        stream.play()
            .map_err(|e| unavailable(format!("Failed to start output stream: {}", e)))?;

        tracing::info!(
            "Audio output opened ({}Hz, {} channels, {:?}; payload rate {}Hz)",
            sample_rate, channels, sample_format, target_rate
        );

        Ok(Self {
            stream: Mutex::new(Some(OutputStream(stream))),
            mixer,
            state: Mutex::new(DeviceState::Running),
            sample_rate,
            runtime,
            prepared: Mutex::new(None),
        })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        channels: usize,
        mixer: Arc<Mixer>,
    ) -> Result<cpal::Stream> {
        device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixer.render(data, channels);
            },
            |err| {
                tracing::error!("Audio output error: {}", err);
            },
            None,
        ).map_err(|e| PlaybackError::DeviceUnavailable(format!("Failed to build output stream: {}", e)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffer at the device rate, resampled once per source buffer.
    fn prepare(&self, buffer: Arc<AudioBuffer>) -> Result<Arc<AudioBuffer>> {
        if buffer.sample_rate() == self.sample_rate {
            return Ok(buffer);
        }

        let mut prepared = self.prepared.lock();
        if let Some((source, converted)) = prepared.as_ref() {
            if Weak::ptr_eq(source, &Arc::downgrade(&buffer)) {
                return Ok(Arc::clone(converted));
            }
        }

        let converted = Arc::new(convert_to_rate(&buffer, self.sample_rate)?);
        *prepared = Some((Arc::downgrade(&buffer), Arc::clone(&converted)));
        Ok(converted)
    }
}

/// The mixer advances one buffer frame per device frame, so a buffer must match the
/// device rate exactly before it can be voiced.
fn convert_to_rate(buffer: &AudioBuffer, device_rate: u32) -> Result<AudioBuffer> {
    let channels: Vec<Vec<f32>> = (0..buffer.channel_count())
        .map(|ch| buffer.channel(ch).to_vec())
        .collect();
    let resampled = processing::resample_channels(&channels, buffer.sample_rate(), device_rate)
        .map_err(|e| {
            tracing::warn!("Resampling {}Hz -> {}Hz failed: {}", buffer.sample_rate(), device_rate, e);
            PlaybackError::DeviceUnavailable(format!(
                "Cannot render {}Hz audio on a {}Hz device: {}",
                buffer.sample_rate(), device_rate, e
            ))
        })?;
    Ok(AudioBuffer::from_planar(resampled, device_rate))
}

impl AudioDevice for CpalDevice {
    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn resume(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            match *state {
                DeviceState::Running => Ok(()),
                DeviceState::Closed => Err(PlaybackError::DeviceUnavailable("device is closed".into())),
                DeviceState::Suspended => {
                    if let Some(stream) = self.stream.lock().as_ref() {
                        stream.0.play().map_err(|e| {
                            PlaybackError::DeviceUnavailable(format!("Failed to resume output stream: {}", e))
                        })?;
                    }
                    *state = DeviceState::Running;
                    Ok(())
                }
            }
        })
    }

    fn suspend(&self) {
        let mut state = self.state.lock();
        if *state != DeviceState::Running {
            return;
        }
        if let Some(stream) = self.stream.lock().as_ref() {
            if let Err(e) = stream.0.pause() {
                tracing::warn!("Failed to suspend output stream: {}", e);
                return;
            }
        }
        *state = DeviceState::Suspended;
    }

    fn current_time(&self) -> f64 {
        self.mixer.frames_rendered.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn create_voice(&self, buffer: Arc<AudioBuffer>, gain: Arc<GainStage>) -> Result<Box<dyn Voice>> {
        if self.state() == DeviceState::Closed {
            return Err(PlaybackError::DeviceUnavailable("device is closed".into()));
        }
        let buffer = self.prepare(buffer)?;
        Ok(Box::new(CpalVoice {
            track: Arc::new(VoiceTrack {
                buffer,
                cursor: AtomicUsize::new(0),
                gain,
                finished: AtomicBool::new(false),
                done: Notify::new(),
            }),
            mixer: Arc::clone(&self.mixer),
            runtime: self.runtime.clone(),
            handler: Arc::new(Mutex::new(None)),
            watcher: None,
            started: false,
        }))
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if *state == DeviceState::Closed {
            return;
        }
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.0.pause();
        }
        self.mixer.voices.lock().clear();
        *state = DeviceState::Closed;
        tracing::info!("Audio output closed");
    }
}

struct CpalVoice {
    track: Arc<VoiceTrack>,
    mixer: Arc<Mixer>,
    runtime: Handle,
    handler: Arc<Mutex<Option<EndedHandler>>>,
    watcher: Option<JoinHandle<()>>,
    started: bool,
}

impl Voice for CpalVoice {
    fn set_on_ended(&mut self, handler: Option<EndedHandler>) {
        *self.handler.lock() = handler;
    }

    fn start(&mut self, offset_seconds: f64) {
        if self.started {
            return;
        }
        self.started = true;

        let rate = self.track.buffer.sample_rate() as f64;
        let frame = (offset_seconds.max(0.0) * rate) as usize;
        self.track.cursor.store(frame, Ordering::Relaxed);
        self.mixer.voices.lock().push(Arc::clone(&self.track));

        let track = Arc::clone(&self.track);
        let handler = Arc::clone(&self.handler);
        self.watcher = Some(self.runtime.spawn(async move {
            track.done.notified().await;
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
        self.mixer.remove(&self.track);
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if !self.track.finished.swap(true, Ordering::AcqRel) {
            let ended = self.handler.lock().take();
            if let Some(ended) = ended {
                ended();
            }
        }
    }

    fn disconnect(&mut self) {
        self.mixer.remove(&self.track);
    }
}

impl Drop for CpalVoice {
    fn drop(&mut self) {
        self.mixer.remove(&self.track);
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_matches_device_rate() {
        let buffer = AudioBuffer::from_planar(vec![vec![0.0; 2400], vec![0.0; 2400]], 24000);
        let converted = convert_to_rate(&buffer, 48000).unwrap();
        assert_eq!(converted.sample_rate(), 48000);
        assert_eq!(converted.channel_count(), 2);
        assert!((converted.duration_seconds() - 0.1).abs() < 0.01);
    }

    #[test]
    fn unconvertible_buffer_is_refused() {
        let buffer = AudioBuffer::from_planar(vec![vec![0.0; 100]], 0);
        assert!(matches!(
            convert_to_rate(&buffer, 48000),
            Err(PlaybackError::DeviceUnavailable(_))
        ));
    }
}
