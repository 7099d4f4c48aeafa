//! Session orchestration
//!
//! `VocalsClient` owns one connection, one audio engine and one conversation
//! engine, and wires them together:
//! - inbound `tts_audio` messages are queued for playback
//! - inbound messages drive the conversation state
//! - captured frames feed the auto-interrupt check and the uplink, which
//!   sends them as `audio_data` messages from a Tokio task

use crate::audio::{
    AudioBackend, AudioConfig, AudioEngine, AudioFile, AudioFrame, CpalBackend, EnqueueOutcome,
    FrameSink, PlaybackState, RecordingState, SegmentKey, SpeechSegment,
};
use crate::config::VocalsConfig;
use crate::connection::{
    ApiKeySigner, ConnectionManager, ConnectionSettings, ConnectionState, CredentialProvider,
    HttpTokenProvider, TokenManager, Transport, WebSocketTransport,
};
use crate::conversation::{ConversationConfig, ConversationEngine};
use crate::error::{Result, VocalsError};
use crate::protocol::{InboundEvent, InboundMessage, OutboundMessage};
use crate::stats::{StatsAggregator, StatsCallbacks, StreamStats};
use crate::subscription::{HandlerRegistry, Subscription};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest wait for the stats observer to handle frames already captured
const STATS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a [`VocalsClient`]; the defaults talk to real devices and a real socket
pub struct VocalsClientBuilder {
    config: VocalsConfig,
    audio: AudioConfig,
    conversation: ConversationConfig,
    transport: Option<Arc<dyn Transport>>,
    backend: Option<Arc<dyn AudioBackend>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    send_settings: bool,
}

impl Default for VocalsClientBuilder {
    fn default() -> Self {
        Self::new(VocalsConfig::default())
    }
}

impl VocalsClientBuilder {
    pub fn new(config: VocalsConfig) -> Self {
        Self {
            config,
            audio: AudioConfig::default(),
            conversation: ConversationConfig::default(),
            transport: None,
            backend: None,
            credentials: None,
            send_settings: true,
        }
    }

    pub fn audio_config(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn conversation_config(mut self, conversation: ConversationConfig) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn audio_backend(mut self, backend: Arc<dyn AudioBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use `provider` for bearer tokens instead of the configured source
    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Send the `settings` message at the start of every connection (default on)
    pub fn send_settings(mut self, enabled: bool) -> Self {
        self.send_settings = enabled;
        self
    }

    /// Must be called inside a Tokio runtime
    pub fn build(self) -> Result<VocalsClient> {
        let runtime = Handle::try_current()
            .map_err(|_| VocalsError::config("VocalsClient must be built inside a Tokio runtime"))?;

        let provider = match self.credentials {
            Some(provider) => Some(provider),
            None => {
                self.config.ensure_valid()?;
                credential_provider(&self.config)?
            }
        };
        let tokens = provider.map(|provider| {
            let buffer = Duration::from_secs_f64(self.config.token_refresh_buffer.max(0.0));
            Arc::new(TokenManager::new(provider, buffer))
        });

        let mut audio = self.audio;
        if audio.device_index.is_none() {
            audio.device_index = self.config.audio_device_id;
        }

        let mut settings = ConnectionSettings::from_config(&self.config);
        if self.send_settings {
            settings.handshake = Some(OutboundMessage::settings(
                &audio.format,
                audio.sample_rate,
                audio.channels,
            ));
        }

        let errors = HandlerRegistry::new("error");
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(CpalBackend::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));

        let audio_engine = AudioEngine::new(audio, backend, errors.clone())?;
        audio_engine.set_debug_audio(self.config.debug_audio);

        let connection = ConnectionManager::new(settings, transport, tokens, errors.clone());
        let conversation = ConversationEngine::new(
            self.conversation,
            Arc::new(connection.clone()),
            Arc::new(audio_engine.clone()),
            runtime.clone(),
        );

        let (uplink, outbound) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            session_id: Uuid::new_v4(),
            config: self.config,
            connection,
            audio: audio_engine,
            conversation,
            errors,
            uplink,
            packets_sent: AtomicU64::new(0),
            stats: Arc::new(Mutex::new(None)),
            internal: Mutex::new(Vec::new()),
            runtime,
        });

        let client = VocalsClient { inner };
        client.wire_internal_handlers();
        client.spawn_uplink(outbound);

        info!(session = %client.inner.session_id, "Vocals client ready");

        if client.inner.config.auto_connect {
            let auto = client.clone();
            client.inner.runtime.spawn(async move {
                if let Err(e) = auto.connect().await {
                    warn!("Auto-connect failed: {}", e);
                }
            });
        }

        Ok(client)
    }
}

/// Token source implied by the configuration, if token auth is on
fn credential_provider(config: &VocalsConfig) -> Result<Option<Arc<dyn CredentialProvider>>> {
    if !config.use_token_auth {
        return Ok(None);
    }
    if let Some(endpoint) = &config.token_endpoint {
        let provider = HttpTokenProvider::new(endpoint.clone(), config.headers.clone())?;
        return Ok(Some(Arc::new(provider)));
    }
    match &config.dev_api_key {
        Some(key) => {
            let signer = ApiKeySigner::new(key.clone(), config.user_id.clone())?;
            Ok(Some(Arc::new(signer)))
        }
        None => Err(VocalsError::config(
            "token auth needs VOCALS_DEV_API_KEY or VOCALS_TOKEN_ENDPOINT",
        )),
    }
}

struct ClientInner {
    session_id: Uuid,
    config: VocalsConfig,
    connection: ConnectionManager,
    audio: AudioEngine,
    conversation: ConversationEngine,
    errors: HandlerRegistry<VocalsError>,

    /// Captured audio waiting to be sent
    uplink: mpsc::UnboundedSender<OutboundMessage>,
    packets_sent: AtomicU64,
    /// Aggregator of the stats-collecting stream in progress
    stats: Arc<Mutex<Option<Arc<StatsAggregator>>>>,
    internal: Mutex<Vec<Subscription>>,
    runtime: Handle,
}

/// One voice session against the service
#[derive(Clone)]
pub struct VocalsClient {
    inner: Arc<ClientInner>,
}

impl VocalsClient {
    pub fn builder(config: VocalsConfig) -> VocalsClientBuilder {
        VocalsClientBuilder::new(config)
    }

    fn wire_internal_handlers(&self) {
        let mut internal = self.inner.internal.lock();

        let audio = self.inner.audio.clone();
        internal.push(self.inner.connection.on_message(move |message: InboundMessage| {
            if message.message_type() != "tts_audio" {
                return;
            }
            match message.event() {
                Ok(InboundEvent::TtsAudio(tts)) => {
                    let segment = SpeechSegment::from(tts);
                    if let EnqueueOutcome::Queued(len) = audio.enqueue(segment) {
                        debug!("Speech queued ({} pending)", len);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Dropping speech segment: {}", e),
            }
        }));

        let conversation = self.inner.conversation.clone();
        internal.push(
            self.inner
                .connection
                .on_message(move |message: InboundMessage| conversation.handle_message(&message)),
        );

        let conversation = self.inner.conversation.clone();
        internal.push(
            self.inner
                .audio
                .on_frame(move |frame: AudioFrame| conversation.observe_frame(&frame)),
        );

        let stats = Arc::clone(&self.inner.stats);
        internal.push(self.inner.connection.on_state_change(move |state| {
            if state == ConnectionState::Reconnecting {
                if let Some(aggregator) = stats.lock().as_ref() {
                    aggregator.record_reconnect();
                }
            }
        }));
    }

    fn spawn_uplink(&self, mut outbound: mpsc::UnboundedReceiver<OutboundMessage>) {
        // Weak so the task does not keep the client alive
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            while let Some(message) = outbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match inner.connection.send_message(&message).await {
                    Ok(()) => {
                        inner.packets_sent.fetch_add(1, Ordering::Relaxed);
                        if let Some(aggregator) = inner.stats.lock().as_ref() {
                            aggregator.record_packet();
                        }
                    }
                    Err(e) => debug!("Audio packet not sent: {}", e),
                }
            }
            debug!("Uplink stopped");
        });
    }

    // ── Connection ─────────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        self.inner.connection.send_message(message).await
    }

    /// Send typed text to the service as a `text_input` message
    pub async fn send_text_input(&self, text: &str) -> Result<()> {
        self.send_message(&OutboundMessage::text_input(text)).await
    }

    // ── Capture ────────────────────────────────────────────────────────────

    /// Capture from the microphone and stream every frame to the service
    pub fn start_recording(&self) -> Result<()> {
        let uplink = self.inner.uplink.clone();
        let format = self.inner.audio.config().format.clone();
        let sink: FrameSink = Box::new(move |frame: &AudioFrame| {
            let message = OutboundMessage::audio_data(&frame.samples, frame.sample_rate, &format);
            if uplink.send(message).is_err() {
                debug!("Uplink closed, dropping frame");
            }
        });
        self.inner.audio.start_recording(sink)
    }

    pub fn stop_recording(&self) {
        self.inner.audio.stop_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.audio.is_recording()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.inner.audio.recording_state()
    }

    pub fn current_amplitude(&self) -> f32 {
        self.inner.audio.current_amplitude()
    }

    /// Record for `duration`, then stop
    pub async fn stream_microphone(&self, duration: Duration) -> Result<()> {
        self.start_recording()?;
        tokio::time::sleep(duration).await;
        self.stop_recording();
        Ok(())
    }

    /// Record for `duration` while aggregating stream statistics
    pub async fn stream_microphone_with_stats(
        &self,
        duration: Duration,
        silence_threshold: f32,
        callbacks: StatsCallbacks,
    ) -> Result<StreamStats> {
        let aggregator = Arc::new(StatsAggregator::new(silence_threshold, callbacks));
        *self.inner.stats.lock() = Some(Arc::clone(&aggregator));

        let observer = Arc::clone(&aggregator);
        let subscription = self
            .inner
            .audio
            .on_frame(move |frame: AudioFrame| observer.observe(&frame));

        let result = self.stream_microphone(duration).await;
        let stopped = Instant::now();

        // Capture has stopped; let the observer catch up before finalizing
        let drained = tokio::task::spawn_blocking(move || {
            subscription.unsubscribe_and_drain(STATS_DRAIN_TIMEOUT)
        })
        .await
        .unwrap_or(false);
        if !drained {
            warn!(
                "Stats observer still busy after {:?}; final stats may be partial",
                STATS_DRAIN_TIMEOUT
            );
        }
        self.inner.stats.lock().take();
        result?;

        let stats = aggregator.finish_at(stopped);
        info!(
            "Stream finished: {:.1}s, {} samples, {:.0}% voice activity",
            stats.duration_secs,
            stats.total_samples,
            stats.voice_activity_percentage()
        );
        Ok(stats)
    }

    /// Send a WAV file as `audio_data` chunks, paced in real time.
    ///
    /// Returns the number of chunks sent.
    pub async fn stream_audio_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let file = AudioFile::open(path)?;
        let config = self.inner.audio.config();
        let mut sent = 0;

        for chunk in file.chunks(config.buffer_size) {
            let message = OutboundMessage::audio_data(chunk, file.sample_rate, &config.format);
            self.inner.connection.send_message(&message).await?;
            self.inner.packets_sent.fetch_add(1, Ordering::Relaxed);
            sent += 1;

            let frames = chunk.len() / file.channels.max(1) as usize;
            let pace = Duration::from_secs_f64(frames as f64 / file.sample_rate.max(1) as f64);
            tokio::time::sleep(pace).await;
        }

        info!("Streamed {} chunks from {}", sent, file.path);
        Ok(sent)
    }

    /// Audio packets delivered to the service so far
    pub fn packets_sent(&self) -> u64 {
        self.inner.packets_sent.load(Ordering::Relaxed)
    }

    // ── Playback ───────────────────────────────────────────────────────────

    pub fn playback_state(&self) -> PlaybackState {
        self.inner.audio.playback_state()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.audio.queue_len()
    }

    pub fn current_segment(&self) -> Option<SegmentKey> {
        self.inner.audio.current_segment()
    }

    pub fn clear_queue(&self) {
        self.inner.audio.clear_queue()
    }

    pub fn pause_playback(&self) -> Result<()> {
        self.inner.audio.pause()
    }

    pub fn resume_playback(&self) -> Result<()> {
        self.inner.audio.resume()
    }

    pub fn stop_playback(&self) {
        self.inner.audio.stop_playback()
    }

    pub fn fade_out(&self, duration: Duration) {
        self.inner.audio.fade_out(duration)
    }

    /// Start playing queued speech when auto playback is off
    pub fn play_queued(&self) -> bool {
        self.inner.audio.play_queued()
    }

    pub fn set_auto_playback(&self, enabled: bool) {
        self.inner.audio.set_auto_playback(enabled)
    }

    /// Hand queued segments to `callback` instead of the speaker
    pub fn process_queue<F>(&self, callback: F, consume_all: bool) -> usize
    where
        F: FnMut(SpeechSegment),
    {
        self.inner.audio.process_queue(callback, consume_all)
    }

    // ── Subscriptions ──────────────────────────────────────────────────────

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.inner.connection.on_message(handler)
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.connection.on_state_change(handler)
    }

    /// Connection, capture and playback errors
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(VocalsError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(handler)
    }

    pub fn on_audio_frame<F>(&self, handler: F) -> Subscription
    where
        F: Fn(AudioFrame) + Send + Sync + 'static,
    {
        self.inner.audio.on_frame(handler)
    }

    // ── Parts ──────────────────────────────────────────────────────────────

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn config(&self) -> &VocalsConfig {
        &self.inner.config
    }

    pub fn conversation(&self) -> &ConversationEngine {
        &self.inner.conversation
    }

    pub fn audio(&self) -> &AudioEngine {
        &self.inner.audio
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Stop capture and playback, disconnect and drop internal subscriptions
    pub async fn cleanup(&self) {
        self.inner.audio.cleanup();
        self.inner.conversation.cleanup();
        self.inner.connection.disconnect().await;
        for subscription in self.inner.internal.lock().drain(..) {
            subscription.unsubscribe();
        }
        info!(session = %self.inner.session_id, "Vocals client cleaned up");
    }
}
