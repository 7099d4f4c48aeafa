use crate::protocol::TtsAudio;
use std::fmt;

/// Identity of a speech segment: segment id plus sentence ordinal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub segment_id: String,
    pub sentence_number: u32,
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.segment_id, self.sentence_number)
    }
}

/// One unit of synthesized speech waiting for playback
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    /// Identifier shared by all sentences of one response
    pub segment_id: String,

    /// Position of this sentence within the response
    pub sentence_number: u32,

    /// Base64 encoded payload (raw `pcm_f32le` or WAV)
    pub audio_data: String,

    /// Sample rate of a raw payload in Hz
    pub sample_rate: u32,

    /// Text that was synthesized
    pub text: String,

    /// Payload format tag
    pub format: String,

    /// Nominal duration reported by the service, 0 if unknown
    pub duration_seconds: f64,
}

impl SpeechSegment {
    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            segment_id: self.segment_id.clone(),
            sentence_number: self.sentence_number,
        }
    }
}

impl From<TtsAudio> for SpeechSegment {
    fn from(tts: TtsAudio) -> Self {
        Self {
            segment_id: tts.segment_id,
            sentence_number: tts.sentence_number,
            audio_data: tts.audio_data,
            sample_rate: tts.sample_rate,
            text: tts.text,
            format: tts.format,
            duration_seconds: tts.duration_seconds,
        }
    }
}
