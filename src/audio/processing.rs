use anyhow::Result;
use rubato::{SincFixedIn, SincInterpolationType, SincInterpolationParameters, WindowFunction, Resampler};

use crate::error::PlaybackError;

const I16_SCALE: f32 = 32768.0;

/// Splits interleaved signed 16-bit little-endian PCM into planar f32 channels in [-1, 1).
pub fn deinterleave_s16le(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>, PlaybackError> {
    if channels == 0 {
        return Err(PlaybackError::Decode("channel count must be at least 1".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(PlaybackError::Decode(format!(
            "PCM payload has odd length ({} bytes)",
            bytes.len()
        )));
    }

    let sample_count = bytes.len() / 2;
    if sample_count % channels != 0 {
        return Err(PlaybackError::Decode(format!(
            "PCM payload ends with a partial frame ({} samples, {} channels)",
            sample_count, channels
        )));
    }

    let frame_count = sample_count / channels;
    let mut planar = vec![Vec::with_capacity(frame_count); channels];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        planar[i % channels].push(sample as f32 / I16_SCALE);
    }

    Ok(planar)
}

/// Splits interleaved f32 samples into planar channels. A trailing partial frame is dropped.
pub fn deinterleave_f32(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    if channels == 0 {
        return Vec::new();
    }
    let frame_count = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frame_count); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample);
        }
    }
    planar
}

pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let mut out = resample_channels(&[samples.to_vec()], from_rate, to_rate)?;
    Ok(out.pop().unwrap_or_default())
}

/// Resamples every channel in one pass so they stay frame-aligned.
pub fn resample_channels(channels: &[Vec<f32>], from_rate: u32, to_rate: u32) -> Result<Vec<Vec<f32>>> {
    if from_rate == 0 || to_rate == 0 {
        anyhow::bail!("Cannot resample between {}Hz and {}Hz", from_rate, to_rate);
    }
    let frames = channels.first().map(Vec::len).unwrap_or(0);
    if from_rate == to_rate || frames == 0 {
        return Ok(channels.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0,
        params,
        frames,
        channels.len(),
    )?;

    let output = resampler.process(channels, None)?;
    Ok(output)
}
