pub mod backend;
pub mod codec;
pub mod cpal_backend;
pub mod device;
pub mod dump;
pub mod engine;
pub mod file;
pub mod queue;
pub mod segment;

use crate::error::{Result, VocalsError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub use backend::{AudioBackend, CaptureCallback, RenderCallback, StreamErrorCallback, StreamHandle, StreamSpec};
pub use cpal_backend::CpalBackend;
pub use device::{DeviceInfo, DeviceManager, Direction};
pub use dump::SegmentDumper;
pub use engine::{AudioEngine, FrameSink, PlaybackControl};
pub use file::AudioFile;
pub use queue::{EnqueueOutcome, PlaybackQueue};
pub use segment::{SegmentKey, SpeechSegment};

/// Audio capture and playback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Capture channel count (1 = mono, 2 = stereo)
    pub channels: u16,

    /// Wire format tag for captured audio
    pub format: String,

    /// Frames per capture callback delivered to the sink
    pub buffer_size: usize,

    /// Capture device index; host default when unset
    pub device_index: Option<usize>,

    /// Playback device index; host default when unset
    pub output_device_index: Option<usize>,

    /// Start playing as soon as a segment is queued
    pub auto_playback: bool,

    /// Write every decoded speech segment here as WAV when set
    pub debug_dump_dir: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            format: "pcm_f32le".to_string(),
            buffer_size: 1024,
            device_index: None,
            output_device_index: None,
            auto_playback: true,
            debug_dump_dir: None,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VocalsError::config("sample rate must be positive"));
        }
        if self.channels == 0 {
            return Err(VocalsError::config("channel count must be positive"));
        }
        if self.buffer_size == 0 {
            return Err(VocalsError::config("buffer size must be positive"));
        }
        if self.format.trim().is_empty() {
            return Err(VocalsError::config("audio format must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn capture_spec(&self) -> StreamSpec {
        StreamSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
            buffer_size: self.buffer_size as u32,
            device_index: self.device_index,
        }
    }
}

/// One buffer of captured audio
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved samples in [-1, 1]
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Milliseconds since recording started
    pub timestamp_ms: u64,
    /// Mean absolute amplitude of `samples`
    pub amplitude: f32,
    /// When the frame left the capture callback
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, timestamp_ms: u64) -> Self {
        let amplitude = codec::mean_abs(&samples);
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            timestamp_ms,
            amplitude,
            captured_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Queued,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.buffer_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_values() {
        let config = AudioConfig {
            buffer_size: 0,
            ..AudioConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn recording_states_are_the_reachable_ones() {
        for name in ["idle", "recording", "error"] {
            let state: RecordingState = serde_json::from_str(&format!("\"{}\"", name)).unwrap();
            assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{}\"", name));
        }
        assert!(serde_json::from_str::<RecordingState>("\"completed\"").is_err());
    }
}
