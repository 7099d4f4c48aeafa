// End-to-end tests of the client wiring
//
// Every client runs against the in-memory transport and audio backend.

mod common;

use common::{wait_for, MockAudioBackend, MockTransport};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vocals::audio::{codec, AudioConfig};
use vocals::{
    ConnectionState, ErrorCode, RecordingState, StatsCallbacks, VocalsClient, VocalsConfig,
};

fn config() -> VocalsConfig {
    VocalsConfig {
        use_token_auth: false,
        reconnect_delay: 0.01,
        ..VocalsConfig::default()
    }
}

fn client(transport: Arc<MockTransport>, backend: Arc<MockAudioBackend>) -> VocalsClient {
    VocalsClient::builder(config())
        .transport(transport)
        .audio_backend(backend)
        .audio_config(AudioConfig {
            buffer_size: 240,
            ..AudioConfig::default()
        })
        .build()
        .unwrap()
}

#[test]
fn test_build_outside_runtime_fails() {
    let err = VocalsClient::builder(config())
        .transport(MockTransport::new())
        .audio_backend(MockAudioBackend::new())
        .build()
        .err()
        .unwrap();
    assert_eq!(err.code, ErrorCode::ConfigInvalid);
}

#[tokio::test]
async fn test_token_auth_needs_credentials() -> anyhow::Result<()> {
    let err = VocalsClient::builder(VocalsConfig::default())
        .transport(MockTransport::new())
        .audio_backend(MockAudioBackend::new())
        .build()
        .err()
        .unwrap();
    assert_eq!(err.code, ErrorCode::ConfigInvalid);
    Ok(())
}

#[tokio::test]
async fn test_connect_sends_settings_first() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let client = client(Arc::clone(&transport), MockAudioBackend::new());

    client.connect().await?;
    assert!(client.is_connected());
    client.send_text_input("hello").await?;

    assert_eq!(transport.sent_events(), vec!["settings", "text_input"]);
    let settings = &transport.sent_json()[0];
    assert_eq!(settings["data"]["format"], "pcm_f32le");
    assert_eq!(settings["data"]["sample_rate"], 24000);
    Ok(())
}

#[tokio::test]
async fn test_settings_handshake_can_be_disabled() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let client = VocalsClient::builder(config())
        .transport(Arc::clone(&transport) as _)
        .audio_backend(MockAudioBackend::new())
        .send_settings(false)
        .build()?;

    client.connect().await?;
    assert!(transport.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tts_audio_is_queued_and_played() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let backend = MockAudioBackend::new();
    let client = client(Arc::clone(&transport), Arc::clone(&backend));
    client.connect().await?;

    let speech = json!({
        "type": "tts_audio",
        "data": {
            "segment_id": "reply-1",
            "sentence_number": 0,
            "audio_data": codec::encode_base64(&vec![0.5f32; 2400]),
            "sample_rate": 24000,
            "text": "Hello there",
        }
    });
    transport.push(&speech.to_string());
    // Redelivery of the same sentence is ignored
    transport.push(&speech.to_string());

    assert!(wait_for(Duration::from_secs(5), || client.audio().completed_segments() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.outputs_opened(), 1);
    assert_eq!(backend.first_samples(), vec![0.5]);
    Ok(())
}

#[tokio::test]
async fn test_malformed_speech_is_not_queued() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let client = VocalsClient::builder(config())
        .transport(Arc::clone(&transport) as _)
        .audio_backend(MockAudioBackend::new())
        .audio_config(AudioConfig {
            auto_playback: false,
            ..AudioConfig::default()
        })
        .build()?;
    client.connect().await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    client.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    transport.push(r#"{"type": "tts_audio", "data": {"segment_id": "x"}}"#);
    assert!(wait_for(Duration::from_secs(1), || seen.load(Ordering::SeqCst) == 1).await);
    assert_eq!(client.queue_len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_final_transcription_prompts_ai() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let client = client(Arc::clone(&transport), MockAudioBackend::new());
    client.connect().await?;

    transport.push(r#"{"type": "transcription", "data": {"text": "what's up", "is_final": true}}"#);

    assert!(
        wait_for(Duration::from_secs(1), || transport
            .sent_events()
            .contains(&"ai_prompt".to_string()))
        .await
    );
    let history = client.conversation().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "what's up");
    Ok(())
}

#[tokio::test]
async fn test_stream_microphone_with_stats() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let client = client(Arc::clone(&transport), MockAudioBackend::with_level(0.3));
    client.connect().await?;

    let levels = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&levels);
    let callbacks = StatsCallbacks::new().on_level(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let stats = client
        .stream_microphone_with_stats(Duration::from_millis(300), 0.05, callbacks)
        .await?;

    assert_eq!(client.recording_state(), RecordingState::Idle);
    assert!(stats.total_samples > 0);
    assert_eq!(stats.total_samples % 240, 0);
    assert!(stats.voice_activity_ratio > 0.5);
    assert!(stats.is_healthy());
    assert!(levels.load(Ordering::SeqCst) > 0);

    assert!(wait_for(Duration::from_secs(1), || client.packets_sent() > 0).await);
    let audio = transport
        .sent_json()
        .into_iter()
        .find(|m| m["event"] == "audio_data")
        .unwrap();
    assert_eq!(audio["data"]["sample_rate"], 24000);
    assert_eq!(audio["data"]["format"], "pcm_f32le");
    Ok(())
}

#[tokio::test]
async fn test_stats_cover_every_captured_frame() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let backend = MockAudioBackend::with_level(0.3);
    let client = client(Arc::clone(&transport), Arc::clone(&backend));
    client.connect().await?;

    // Much slower than capture, so frames pile up behind the observer
    let callbacks = StatsCallbacks::new().on_level(|_, _| {
        std::thread::sleep(Duration::from_millis(25));
    });

    let stats = client
        .stream_microphone_with_stats(Duration::from_millis(300), 0.05, callbacks)
        .await?;

    let captured = backend.captured_buffers() as u64;
    assert!(captured > 12);
    assert_eq!(stats.frames, captured);
    assert_eq!(stats.total_samples, captured * 240);
    assert!(stats.duration_secs < 1.0, "duration ends when capture stops");
    assert!(stats.voice_activity_ratio > 0.5);
    Ok(())
}

#[tokio::test]
async fn test_stream_audio_file_sends_chunks() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("speech.wav");
    let spec = WavSpec {
        channels: 1,
        sample_rate: 24000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&path, spec)?;
    for n in 0..4800 {
        writer.write_sample(((n % 100) as i16 - 50) * 100)?;
    }
    writer.finalize()?;

    let transport = MockTransport::new();
    let client = client(Arc::clone(&transport), MockAudioBackend::new());

    let err = client.stream_audio_file(&path).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotConnected);

    client.connect().await?;
    assert_eq!(client.stream_audio_file(&path).await?, 20);

    let chunks = transport
        .sent_events()
        .iter()
        .filter(|e| *e == "audio_data")
        .count();
    assert_eq!(chunks, 20);
    assert_eq!(client.packets_sent(), 20);
    Ok(())
}

#[tokio::test]
async fn test_cleanup_stops_everything() -> anyhow::Result<()> {
    let transport = MockTransport::new();
    let client = client(Arc::clone(&transport), MockAudioBackend::with_level(0.2));
    client.connect().await?;
    client.start_recording()?;
    assert!(client.is_recording());

    client.cleanup().await;

    assert!(!client.is_recording());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    Ok(())
}
