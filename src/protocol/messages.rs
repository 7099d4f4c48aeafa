use crate::audio::codec;
use crate::error::{Result, VocalsError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Message sent to the voice service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event: String,

    #[serde(default)]
    pub data: Value,

    /// Audio format tag, only set on `media` messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Sample rate, only set on `media` messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl OutboundMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            format: None,
            sample_rate: None,
        }
    }

    /// Captured microphone audio, base64 `pcm_f32le` inside the data object
    pub fn audio_data(samples: &[f32], sample_rate: u32, format: &str) -> Self {
        Self::new(
            "audio_data",
            json!({
                "audio": codec::encode_base64(samples),
                "sample_rate": sample_rate,
                "format": format,
            }),
        )
    }

    /// Raw audio bytes with format and rate carried at the top level
    pub fn media(samples: &[f32], sample_rate: u32, format: &str) -> Self {
        Self {
            event: "media".to_string(),
            data: Value::String(codec::encode_base64(samples)),
            format: Some(format.to_string()),
            sample_rate: Some(sample_rate),
        }
    }

    /// Stream parameters, sent once per connection
    pub fn settings(format: &str, sample_rate: u32, channels: u16) -> Self {
        Self::new(
            "settings",
            json!({
                "format": format,
                "sample_rate": sample_rate,
                "channels": channels,
            }),
        )
    }

    pub fn ai_prompt(prompt: &str, language: &str) -> Self {
        Self::new("ai_prompt", json!({ "prompt": prompt, "language": language }))
    }

    pub fn interrupt(reason: &str) -> Self {
        Self::new("interrupt", json!({ "reason": reason }))
    }

    pub fn text_input(text: &str) -> Self {
        Self::new("text_input", json!({ "text": text }))
    }

    /// Control command; `params` are merged next to the `command` key
    pub fn control(command: &str, params: Map<String, Value>) -> Self {
        let mut data = params;
        data.insert("command".to_string(), Value::String(command.to_string()));
        Self::new("control", Value::Object(data))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message received from the voice service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub data: Value,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let message: InboundMessage = serde_json::from_str(text)?;
        if message.kind.is_none() && message.event.is_none() {
            return Err(VocalsError::parse("message has neither type nor event"));
        }
        Ok(message)
    }

    /// Convenience constructor used by handlers and tests
    pub fn typed(kind: &str, data: Value) -> Self {
        Self {
            event: None,
            kind: Some(kind.to_string()),
            data,
        }
    }

    /// The discriminator: `type`, falling back to `event`
    pub fn message_type(&self) -> &str {
        self.kind
            .as_deref()
            .or(self.event.as_deref())
            .unwrap_or("unknown")
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    fn string(&self, key: &str) -> String {
        self.str_field(key).unwrap_or_default().to_string()
    }

    fn bool_field(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn u64_field(&self, key: &str) -> u64 {
        match self.data.get(key) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn f64_field(&self, key: &str) -> f64 {
        self.data.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    /// Decode into a typed event, rejecting messages missing mandatory fields
    pub fn event(&self) -> Result<InboundEvent> {
        let event = match self.message_type() {
            "transcription" => InboundEvent::Transcription {
                text: self.string("text"),
                is_final: self.bool_field("is_final"),
                segment_id: self.str_field("segment_id").map(str::to_string),
            },
            "partial_transcription" => InboundEvent::PartialTranscription {
                text: self.string("text"),
            },
            "tts_audio" => InboundEvent::TtsAudio(self.tts_audio()?),
            "response" => InboundEvent::Response {
                text: self.string("text"),
            },
            "interruption" => InboundEvent::Interruption,
            "error" => InboundEvent::Error {
                message: self.string("message"),
                code: self.str_field("code").map(str::to_string),
            },
            other => InboundEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }

    fn tts_audio(&self) -> Result<TtsAudio> {
        let segment_id = self.string("segment_id");
        if segment_id.is_empty() {
            return Err(VocalsError::parse("tts_audio without segment_id"));
        }
        let audio_data = self.string("audio_data");
        if audio_data.is_empty() {
            return Err(VocalsError::parse("tts_audio without audio_data")
                .with_detail("segment_id", segment_id));
        }

        let sample_rate = match self.u64_field("sample_rate") {
            0 => DEFAULT_TTS_SAMPLE_RATE,
            rate => rate as u32,
        };

        Ok(TtsAudio {
            segment_id,
            sentence_number: self.u64_field("sentence_number") as u32,
            audio_data,
            sample_rate,
            text: self.string("text"),
            format: self.str_field("format").unwrap_or("pcm_f32le").to_string(),
            duration_seconds: self.f64_field("duration_seconds"),
            generation_time_ms: self.u64_field("generation_time_ms"),
        })
    }
}

/// Sample rate assumed for speech payloads that do not state one
pub const DEFAULT_TTS_SAMPLE_RATE: u32 = 24000;

/// Synthesized speech payload as received
#[derive(Debug, Clone, PartialEq)]
pub struct TtsAudio {
    pub segment_id: String,
    pub sentence_number: u32,
    /// Base64 payload, raw `pcm_f32le` or a WAV file
    pub audio_data: String,
    pub sample_rate: u32,
    pub text: String,
    pub format: String,
    pub duration_seconds: f64,
    pub generation_time_ms: u64,
}

/// Typed view of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Transcription {
        text: String,
        is_final: bool,
        segment_id: Option<String>,
    },
    PartialTranscription {
        text: String,
    },
    TtsAudio(TtsAudio),
    Response {
        text: String,
    },
    Interruption,
    Error {
        message: String,
        code: Option<String>,
    },
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_takes_precedence_over_event() {
        let msg = InboundMessage::parse(r#"{"event":"media","type":"response","data":{}}"#).unwrap();
        assert_eq!(msg.message_type(), "response");

        let msg = InboundMessage::parse(r#"{"event":"response"}"#).unwrap();
        assert_eq!(msg.message_type(), "response");
    }

    #[test]
    fn rejects_message_without_discriminator() {
        assert!(InboundMessage::parse(r#"{"data":{"text":"hi"}}"#).is_err());
        assert!(InboundMessage::parse("not json").is_err());
    }

    #[test]
    fn control_merges_params() {
        let mut params = Map::new();
        params.insert("volume".to_string(), json!(0.5));
        let msg = OutboundMessage::control("set_volume", params);
        assert_eq!(msg.data["command"], "set_volume");
        assert_eq!(msg.data["volume"], 0.5);
    }
}
