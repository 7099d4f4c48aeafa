use super::codec;
use crate::error::Result;
use hound::WavReader;
use std::path::Path;
use tracing::info;

/// A WAV file loaded as float samples
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples in [-1, 1]
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let audio = codec::read_wav(WavReader::open(path)?)?;
        let (samples, sample_rate, channels) = (audio.samples, audio.sample_rate, audio.channels);

        let duration_seconds =
            samples.len() as f64 / (sample_rate as f64 * channels.max(1) as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            sample_rate,
            channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate,
            channels,
            samples,
        })
    }

    /// Split into chunks of `frames` frames, the last one possibly shorter
    pub fn chunks(&self, frames: usize) -> impl Iterator<Item = &[f32]> {
        let len = frames.max(1) * self.channels.max(1) as usize;
        self.samples.chunks(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    #[test]
    fn int_samples_are_scaled_and_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..500 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(-8192i16).unwrap();
        }
        writer.finalize().unwrap();

        let file = AudioFile::open(&path).unwrap();
        assert_eq!(file.sample_rate, 16000);
        assert_eq!(file.channels, 2);
        assert_eq!(file.samples.len(), 1000);
        assert_eq!(&file.samples[..2], &[0.5, -0.25]);
        assert!((file.duration_seconds - 500.0 / 16000.0).abs() < 1e-9);

        let chunks: Vec<usize> = file.chunks(200).map(<[f32]>::len).collect();
        assert_eq!(chunks, vec![400, 400, 200]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AudioFile::open("/nonexistent/speech.wav").is_err());
    }
}
