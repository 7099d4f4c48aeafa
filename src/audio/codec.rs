//! PCM sample conversion and level utilities
//!
//! The wire representation of audio is interleaved 32-bit float samples in
//! little-endian byte order, base64 encoded where it travels inside JSON.
//! Synthesized speech may also arrive as a complete WAV file.

use crate::error::{Result, VocalsError};
use base64::Engine;
use std::io::Cursor;

/// Pack samples as little-endian f32 bytes
pub fn encode_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Unpack little-endian f32 bytes; a trailing partial sample is an error
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(VocalsError::parse(format!(
            "PCM payload of {} bytes is not a whole number of f32 samples",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn encode_base64(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_bytes(samples))
}

pub fn decode_base64(encoded: &str) -> Result<Vec<f32>> {
    decode_bytes(&base64_bytes(encoded)?)
}

fn base64_bytes(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| VocalsError::parse(format!("invalid base64 audio: {}", e)))
}

/// Samples decoded from a speech payload
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decode a base64 speech payload.
///
/// Payloads starting with a RIFF header are read as WAV and carry their own
/// rate and channel count; anything else is `pcm_f32le` at `sample_rate`.
pub fn decode_payload(encoded: &str, sample_rate: u32) -> Result<DecodedAudio> {
    let bytes = base64_bytes(encoded)?;

    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return decode_wav(&bytes);
    }

    Ok(DecodedAudio {
        samples: decode_bytes(&bytes)?,
        sample_rate,
        channels: 1,
    })
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    read_wav(hound::WavReader::new(Cursor::new(bytes))?)
}

/// Read every sample of a WAV stream as f32 in [-1, 1]
pub fn read_wav<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<DecodedAudio> {
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Mean absolute amplitude
pub fn mean_abs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Largest absolute amplitude
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Smallest absolute amplitude, 0 for an empty slice
pub fn min_abs(samples: &[f32]) -> f32 {
    samples
        .iter()
        .map(|s| s.abs())
        .reduce(f32::min)
        .unwrap_or(0.0)
}

/// Scale so the loudest sample sits at 0.95; silence is returned unchanged
pub fn normalize(samples: &[f32]) -> Vec<f32> {
    let max = peak(samples);
    if max == 0.0 {
        return samples.to_vec();
    }
    let scale = 0.95 / max;
    samples.iter().map(|s| s * scale).collect()
}

/// Apply gain in decibels, clamping to [-1, 1]
pub fn apply_gain_db(samples: &[f32], gain_db: f32) -> Vec<f32> {
    let factor = 10f32.powf(gain_db / 20.0);
    samples
        .iter()
        .map(|s| (s * factor).clamp(-1.0, 1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip_is_bit_exact() {
        let samples = vec![0.0, -0.0, 1.0, -1.0, 0.123_456_79, f32::MIN_POSITIVE, 3.5e-12];
        let decoded = decode_base64(&encode_base64(&samples)).unwrap();

        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn rejects_truncated_payload() {
        assert!(decode_bytes(&[0, 0, 128]).is_err());
        assert!(decode_base64("%%%").is_err());
    }

    #[test]
    fn levels() {
        let samples = [0.5, -0.5, 0.25, -0.25];
        assert!((mean_abs(&samples) - 0.375).abs() < 1e-6);
        assert!((peak(&samples) - 0.5).abs() < 1e-6);
        assert!((min_abs(&samples) - 0.25).abs() < 1e-6);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
        assert_eq!(mean_abs(&[]), 0.0);
    }

    #[test]
    fn normalize_and_gain() {
        let normalized = normalize(&[0.1, -0.5]);
        assert!((normalized[1] + 0.95).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);

        let louder = apply_gain_db(&[0.1, 0.9], 20.0);
        assert!((louder[0] - 1.0).abs() < 1e-5);
        assert_eq!(louder[1], 1.0);
    }

    #[test]
    fn decodes_wav_payload() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(-16384i16).unwrap();
            writer.finalize().unwrap();
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(cursor.into_inner());

        let decoded = decode_payload(&encoded, 24000).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.samples.len(), 2);
        assert!((decoded.samples[0] - 0.5).abs() < 1e-4);
    }
}
