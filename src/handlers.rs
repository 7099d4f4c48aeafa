//! Ready-made subscribers
//!
//! Each factory returns a closure suitable for one of the client's `on_*`
//! registration points.

use crate::audio::{codec, AudioFrame, SpeechSegment};
use crate::connection::ConnectionState;
use crate::error::VocalsError;
use crate::protocol::{InboundEvent, InboundMessage};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Log every inbound message; `verbose` includes the payload
pub fn logging_handler(verbose: bool) -> impl Fn(InboundMessage) + Send + Sync + 'static {
    move |message: InboundMessage| {
        if verbose {
            info!("Received {}: {}", message.message_type(), message.data);
        } else {
            info!("Received {}", message.message_type());
        }
    }
}

/// Call `callback(text, is_final)` for non-empty transcriptions, partial or final
pub fn transcription_handler<F>(callback: F) -> impl Fn(InboundMessage) + Send + Sync + 'static
where
    F: Fn(&str, bool) + Send + Sync + 'static,
{
    move |message: InboundMessage| {
        let (text, is_final) = match message.event() {
            Ok(InboundEvent::Transcription { text, is_final, .. }) => (text, is_final),
            Ok(InboundEvent::PartialTranscription { text }) => (text, false),
            _ => return,
        };
        if text.is_empty() {
            debug!("Empty transcription text");
            return;
        }
        callback(&text, is_final);
    }
}

/// Call `callback` with each well-formed speech segment
pub fn tts_handler<F>(callback: F) -> impl Fn(InboundMessage) + Send + Sync + 'static
where
    F: Fn(SpeechSegment) + Send + Sync + 'static,
{
    move |message: InboundMessage| {
        if message.message_type() != "tts_audio" {
            return;
        }
        match message.event() {
            Ok(InboundEvent::TtsAudio(tts)) => callback(SpeechSegment::from(tts)),
            Ok(_) => {}
            Err(e) => warn!("Invalid speech segment: {}", e),
        }
    }
}

/// Call `callback` with the text of each non-empty AI response
pub fn response_handler<F>(callback: F) -> impl Fn(InboundMessage) + Send + Sync + 'static
where
    F: Fn(&str) + Send + Sync + 'static,
{
    move |message: InboundMessage| {
        if let Ok(InboundEvent::Response { text }) = message.event() {
            if text.is_empty() {
                debug!("Empty response text");
            } else {
                callback(&text);
            }
        }
    }
}

pub fn interruption_handler<F>(callback: F) -> impl Fn(InboundMessage) + Send + Sync + 'static
where
    F: Fn() + Send + Sync + 'static,
{
    move |message: InboundMessage| {
        if message.message_type() == "interruption" {
            callback();
        }
    }
}

/// Forward only messages of one type to `handler`
pub fn type_filter<F>(
    message_type: impl Into<String>,
    handler: F,
) -> impl Fn(InboundMessage) + Send + Sync + 'static
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    let message_type = message_type.into();
    move |message: InboundMessage| {
        if message.message_type() == message_type {
            handler(message);
        }
    }
}

pub fn error_logging_handler(prefix: impl Into<String>) -> impl Fn(VocalsError) + Send + Sync + 'static {
    let prefix = prefix.into();
    move |err: VocalsError| {
        warn!(code = err.code.as_str(), "{} error: {}", prefix, err.message);
    }
}

/// Log each state change, then call `callback` if given
pub fn connection_status_handler<F>(
    callback: Option<F>,
) -> impl Fn(ConnectionState) + Send + Sync + 'static
where
    F: Fn(ConnectionState) + Send + Sync + 'static,
{
    move |state: ConnectionState| {
        info!("Connection state changed to {}", state);
        if let Some(callback) = &callback {
            callback(state);
        }
    }
}

/// Call `callback(average, peak)` with each frame's absolute levels
pub fn level_monitor<F>(callback: F) -> impl Fn(AudioFrame) + Send + Sync + 'static
where
    F: Fn(f32, f32) + Send + Sync + 'static,
{
    move |frame: AudioFrame| {
        if frame.is_empty() {
            return;
        }
        callback(frame.amplitude, codec::peak(&frame.samples));
    }
}

/// Call `callback` with each frame's RMS level
pub fn rms_visualizer<F>(callback: F) -> impl Fn(AudioFrame) + Send + Sync + 'static
where
    F: Fn(f32) + Send + Sync + 'static,
{
    move |frame: AudioFrame| {
        if !frame.is_empty() {
            callback(codec::rms(&frame.samples));
        }
    }
}

/// Call `callback` once each time the level stays below `threshold` for `duration`
pub fn silence_detector<F>(
    threshold: f32,
    duration: Duration,
    callback: F,
) -> impl Fn(AudioFrame) + Send + Sync + 'static
where
    F: Fn() + Send + Sync + 'static,
{
    let silence_start: Mutex<Option<Instant>> = Mutex::new(None);
    move |frame: AudioFrame| {
        if frame.is_empty() {
            return;
        }
        let mut start = silence_start.lock();
        if frame.amplitude >= threshold {
            *start = None;
            return;
        }
        match *start {
            None => *start = Some(Instant::now()),
            Some(since) if since.elapsed() >= duration => {
                *start = None;
                callback();
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn transcription_handler_skips_empty_text_and_other_types() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = transcription_handler(move |text, is_final| {
            sink.lock().push((text.to_string(), is_final));
        });

        handler(InboundMessage::typed("transcription", json!({"text": "hi", "is_final": true})));
        handler(InboundMessage::typed("partial_transcription", json!({"text": "h"})));
        handler(InboundMessage::typed("transcription", json!({"text": ""})));
        handler(InboundMessage::typed("response", json!({"text": "no"})));

        assert_eq!(
            *seen.lock(),
            vec![("hi".to_string(), true), ("h".to_string(), false)]
        );
    }

    #[test]
    fn type_filter_passes_matching_messages() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handler = type_filter("interruption", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handler(InboundMessage::typed("interruption", json!({})));
        handler(InboundMessage::typed("response", json!({"text": "x"})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn silence_detector_fires_after_duration() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handler = silence_detector(0.1, Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let quiet = AudioFrame::new(vec![0.0; 16], 16000, 1, 0);
        handler(quiet.clone());
        handler(quiet);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
