// Payload decoding: base64 text -> binary -> planar f32 buffer at the target rate

use std::io::Cursor;
use base64::{engine::general_purpose::STANDARD, Engine};
use hound::{SampleFormat, WavReader};

use super::buffer::AudioBuffer;
use super::processing;
use crate::error::{PlaybackError, Result};
use crate::state::PlaybackSettings;

/// Format of raw (header-less) PCM payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::from(&PlaybackSettings::default())
    }
}

impl From<&PlaybackSettings> for DecodeOptions {
    fn from(settings: &PlaybackSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            channels: settings.channels,
        }
    }
}

/// Decode a base64 speech payload into a playable buffer.
pub fn decode_payload(payload: &str, options: DecodeOptions) -> Result<AudioBuffer> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| PlaybackError::Decode(format!("invalid base64 payload: {}", e)))?;
    decode_bytes(&bytes, options)
}

/// Decode binary audio: a RIFF/WAVE container, or raw interleaved s16le PCM.
pub fn decode_bytes(bytes: &[u8], options: DecodeOptions) -> Result<AudioBuffer> {
    if bytes.is_empty() {
        return Err(PlaybackError::Decode("empty payload".into()));
    }
    if options.sample_rate == 0 {
        return Err(PlaybackError::Decode("target sample rate must be non-zero".into()));
    }

    let buffer = if is_wav(bytes) {
        decode_wav(bytes, options.sample_rate)?
    } else {
        let planar = processing::deinterleave_s16le(bytes, options.channels as usize)?;
        AudioBuffer::from_planar(planar, options.sample_rate)
    };

    if buffer.is_empty() {
        return Err(PlaybackError::Decode("payload contains no audio frames".into()));
    }

    tracing::debug!(
        "Decoded {} frames x {} channels at {}Hz ({:.2}s)",
        buffer.frames(),
        buffer.channel_count(),
        buffer.sample_rate(),
        buffer.duration_seconds()
    );
    Ok(buffer)
}

fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8], target_rate: u32) -> Result<AudioBuffer> {
    let wav_err = |e: hound::Error| PlaybackError::Decode(format!("invalid WAV payload: {}", e));

    let mut reader = WavReader::new(Cursor::new(bytes)).map_err(wav_err)?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(PlaybackError::Decode("WAV payload declares zero channels".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(wav_err)?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_err)?
        }
    };

    let planar = processing::deinterleave_f32(&interleaved, spec.channels as usize);
    let planar = if spec.sample_rate != target_rate {
        tracing::debug!("Resampling WAV payload {}Hz -> {}Hz", spec.sample_rate, target_rate);
        processing::resample_channels(&planar, spec.sample_rate, target_rate)
            .map_err(|e| PlaybackError::Decode(format!("resampling failed: {}", e)))?
    } else {
        planar
    };

    Ok(AudioBuffer::from_planar(planar, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_payload(samples: &[i16]) -> String {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        STANDARD.encode(bytes)
    }

    fn mono(rate: u32) -> DecodeOptions {
        DecodeOptions { sample_rate: rate, channels: 1 }
    }

    #[test]
    fn raw_pcm_payload_decodes_at_target_rate() {
        let payload = pcm_payload(&vec![8192; 24000]);
        let buffer = decode_payload(&payload, DecodeOptions::default()).unwrap();
        assert_eq!(buffer.sample_rate(), 24000);
        assert_eq!(buffer.channel_count(), 1);
        assert!((buffer.duration_seconds() - 1.0).abs() < 1e-9);
        assert_eq!(buffer.channel(0)[0], 0.25);
    }

    #[test]
    fn whitespace_in_payload_is_ignored() {
        let payload = pcm_payload(&[1, 2, 3, 4]);
        let (head, tail) = payload.split_at(4);
        let wrapped = format!("{}\n  {}\r\n", head, tail);
        let buffer = decode_payload(&wrapped, mono(8000)).unwrap();
        assert_eq!(buffer.frames(), 4);
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert_eq!(
            decode_payload("", DecodeOptions::default()),
            Err(PlaybackError::Decode("empty payload".into()))
        );
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = decode_payload("not*base64!", DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, PlaybackError::Decode(_)));
    }

    #[test]
    fn odd_length_pcm_is_rejected() {
        let payload = STANDARD.encode([1u8, 2, 3]);
        let err = decode_payload(&payload, DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, PlaybackError::Decode(_)));
    }

    #[test]
    fn wav_payload_is_parsed_and_resampled() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..4800 {
                writer.write_sample(16384i16).unwrap();
                writer.write_sample(-16384i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let buffer = decode_bytes(cursor.get_ref(), mono(24000)).unwrap();
        assert_eq!(buffer.sample_rate(), 24000);
        assert_eq!(buffer.channel_count(), 2);
        // 0.1s of audio, give or take resampler edge frames
        assert!((buffer.duration_seconds() - 0.1).abs() < 0.01);
    }

    #[test]
    fn wav_at_target_rate_keeps_samples() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 24000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for sample in [0.5f32, -0.5, 0.25] {
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }

        let buffer = decode_bytes(cursor.get_ref(), DecodeOptions::default()).unwrap();
        assert_eq!(buffer.channel(0), &[0.5, -0.5, 0.25]);
    }
}
