//! Wire messages exchanged with the voice service

pub mod messages;

pub use messages::{InboundEvent, InboundMessage, OutboundMessage, TtsAudio, DEFAULT_TTS_SAMPLE_RATE};
