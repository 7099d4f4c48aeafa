//! Turn-taking conversation state
//!
//! This module provides:
//! - `ConversationEngine`: reacts to transcription, response and interruption
//!   messages, keeps a bounded turn history and prompts the AI on final turns
//! - `InterruptDebouncer`: fires the interrupt path on sustained loud input
//! - `ConversationTracker`: counts of transcriptions and responses seen

mod interrupt;

pub use interrupt::{InterruptDebouncer, INTERRUPT_DEBOUNCE};

use crate::audio::{AudioFrame, PlaybackControl};
use crate::connection::MessageSender;
use crate::error::{ErrorCode, Result, VocalsError};
use crate::protocol::{InboundEvent, InboundMessage, OutboundMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Fade applied to speech when the user talks over it
pub const INTERRUPT_FADE: Duration = Duration::from_millis(500);

const INTERRUPT_REASON: &str = "user_interrupt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// System prompt placed before the history
    pub prompt: String,

    /// Turns kept in history
    pub max_history: usize,

    /// Interrupt speech when capture stays loud
    pub auto_interrupt: bool,

    /// Amplitude in [0, 1] that counts as talking over playback
    pub interrupt_threshold: f32,

    pub language: String,

    /// Wait for a reply to each prompt
    #[serde(with = "secs")]
    pub response_timeout: Duration,

    /// Characters kept in the pending utterance
    pub max_text_length: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            prompt: "You are a helpful assistant.".to_string(),
            max_history: 20,
            auto_interrupt: true,
            interrupt_threshold: 0.5,
            language: "en-US".to_string(),
            response_timeout: Duration::from_secs(30),
            max_text_length: 1000,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Every transcription fragment and response seen since the last clear
#[derive(Debug, Clone, Default)]
pub struct ConversationTracker {
    transcriptions: Vec<String>,
    responses: Vec<String>,
}

impl ConversationTracker {
    pub fn transcription_count(&self) -> usize {
        self.transcriptions.len()
    }

    pub fn response_count(&self) -> usize {
        self.responses.len()
    }

    pub fn last_transcription(&self) -> Option<&str> {
        self.transcriptions.last().map(String::as_str)
    }

    pub fn last_response(&self) -> Option<&str> {
        self.responses.last().map(String::as_str)
    }

    pub fn transcriptions(&self) -> &[String] {
        &self.transcriptions
    }

    pub fn responses(&self) -> &[String] {
        &self.responses
    }
}

struct State {
    config: ConversationConfig,
    history: VecDeque<ConversationTurn>,
    pending: String,
    tracker: ConversationTracker,
    /// Completed by the next `response` message
    waiter: Option<oneshot::Sender<String>>,
}

impl State {
    fn commit(&mut self, role: Role, content: String) {
        if content.is_empty() {
            return;
        }
        debug!(%role, "Turn added: {}", preview(&content));
        self.history.push_back(ConversationTurn { role, content });
        self.evict();
    }

    fn evict(&mut self) {
        let max = self.config.max_history.max(1);
        while self.history.len() > max {
            self.history.pop_front();
        }
    }

    fn prompt(&self) -> Option<String> {
        if self.history.is_empty() {
            return None;
        }
        let mut prompt = String::new();
        if !self.config.prompt.is_empty() {
            prompt.push_str(&self.config.prompt);
            prompt.push('\n');
        }
        for turn in &self.history {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
        Some(prompt)
    }
}

struct Inner {
    state: Mutex<State>,
    sender: Arc<dyn MessageSender>,
    playback: Arc<dyn PlaybackControl>,
    runtime: Handle,
    debouncer: InterruptDebouncer,
    interrupts: AtomicU64,
}

/// Conversation turn state for one client
#[derive(Clone)]
pub struct ConversationEngine {
    inner: Arc<Inner>,
}

impl ConversationEngine {
    pub fn new(
        config: ConversationConfig,
        sender: Arc<dyn MessageSender>,
        playback: Arc<dyn PlaybackControl>,
        runtime: Handle,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let on_fire = move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                info!("Sustained input over playback, interrupting");
                let engine = ConversationEngine { inner };
                engine.inner.runtime.clone().spawn(async move {
                    if let Err(e) = engine.interrupt().await {
                        warn!("Auto-interrupt failed: {}", e);
                    }
                });
            };

            Inner {
                state: Mutex::new(State {
                    config,
                    history: VecDeque::new(),
                    pending: String::new(),
                    tracker: ConversationTracker::default(),
                    waiter: None,
                }),
                sender,
                playback,
                debouncer: InterruptDebouncer::new(runtime.clone(), on_fire),
                runtime,
                interrupts: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Apply one inbound message to the turn state
    pub fn handle_message(&self, message: &InboundMessage) {
        let event = match message.event() {
            Ok(event) => event,
            Err(e) => {
                debug!("Ignoring {} message: {}", message.message_type(), e);
                return;
            }
        };

        match event {
            InboundEvent::Transcription { text, is_final, .. } => {
                let finished = {
                    let mut state = self.inner.state.lock();
                    let room = state
                        .config
                        .max_text_length
                        .saturating_sub(state.pending.chars().count());
                    let text: String = text.chars().take(room).collect();
                    state.pending.push_str(&text);
                    state.tracker.transcriptions.push(text);

                    if is_final {
                        let utterance = std::mem::take(&mut state.pending);
                        state.commit(Role::User, utterance);
                    }
                    is_final
                };
                if finished {
                    self.spawn_prompt();
                }
            }
            InboundEvent::PartialTranscription { text } => {
                debug!("Partial transcription: {}", text);
            }
            InboundEvent::Response { text } => {
                let mut state = self.inner.state.lock();
                state.commit(Role::Assistant, text.clone());
                state.tracker.responses.push(text.clone());
                if let Some(waiter) = state.waiter.take() {
                    let _ = waiter.send(text);
                }
            }
            InboundEvent::Interruption => {
                info!("Interruption reported by server");
                let engine = self.clone();
                self.inner.runtime.spawn(async move {
                    if let Err(e) = engine.interrupt().await {
                        warn!("Interrupt failed: {}", e);
                    }
                });
            }
            InboundEvent::Error { message, code } => {
                error!(
                    code = code.as_deref().unwrap_or("UNKNOWN_ERROR"),
                    "Conversation error: {}", message
                );
            }
            InboundEvent::TtsAudio(_) => {}
            InboundEvent::Unknown(kind) => debug!("Unhandled message type: {}", kind),
        }
    }

    /// Feed one capture frame to the auto-interrupt check.
    ///
    /// Uses the playback side's live amplitude, which the capture path
    /// updates before subscribers see the frame.
    pub fn observe_frame(&self, _frame: &AudioFrame) {
        self.observe_amplitude(self.inner.playback.current_amplitude());
    }

    pub fn observe_amplitude(&self, amplitude: f32) {
        let (enabled, threshold) = {
            let state = self.inner.state.lock();
            (state.config.auto_interrupt, state.config.interrupt_threshold)
        };
        if enabled {
            self.inner.debouncer.observe(amplitude, threshold);
        }
    }

    /// Tell the service to stop speaking, fade local playback, drop pending text
    pub async fn interrupt(&self) -> Result<()> {
        self.inner
            .sender
            .send(OutboundMessage::interrupt(INTERRUPT_REASON))
            .await
            .map_err(|e| {
                VocalsError::new(ErrorCode::InterruptFailed, e.message.clone())
                    .with_detail("cause_code", e.code.as_str())
            })?;

        self.inner.interrupts.fetch_add(1, Ordering::SeqCst);
        info!("Sent interruption signal");
        self.inner.playback.fade_out(INTERRUPT_FADE);
        self.inner.state.lock().pending.clear();
        Ok(())
    }

    /// Commit `text` as a user turn and prompt the AI with it
    pub fn send_text(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(VocalsError::new(ErrorCode::TranscriptionFailed, "empty text"));
        }
        self.inner.state.lock().commit(Role::User, text.to_string());
        self.spawn_prompt();
        Ok(())
    }

    fn spawn_prompt(&self) {
        let engine = self.clone();
        self.inner.runtime.spawn(async move {
            engine.send_to_ai().await;
        });
    }

    /// Send the history as one prompt and wait for a single reply.
    ///
    /// Returns the reply, or `None` on send failure or timeout.
    pub async fn send_to_ai(&self) -> Option<String> {
        let (rx, message, timeout) = {
            let mut state = self.inner.state.lock();
            let prompt = state.prompt()?;
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            (
                rx,
                OutboundMessage::ai_prompt(&prompt, &state.config.language),
                state.config.response_timeout,
            )
        };

        if let Err(e) = self.inner.sender.send(message).await {
            warn!("Failed to send AI prompt: {}", e);
            self.inner.state.lock().waiter = None;
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                debug!("AI response: {}", preview(&reply));
                Some(reply)
            }
            Ok(Err(_)) => {
                debug!("Prompt superseded before a reply arrived");
                None
            }
            Err(_) => {
                warn!("AI response timeout after {:?}", timeout);
                None
            }
        }
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    /// Text of the utterance still being transcribed
    pub fn pending_text(&self) -> String {
        self.inner.state.lock().pending.clone()
    }

    pub fn tracker(&self) -> ConversationTracker {
        self.inner.state.lock().tracker.clone()
    }

    /// Interrupt signals sent so far
    pub fn interrupt_count(&self) -> u64 {
        self.inner.interrupts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> ConversationConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn clear_history(&self) {
        let mut state = self.inner.state.lock();
        state.history.clear();
        state.pending.clear();
        state.tracker = ConversationTracker::default();
        info!("Conversation history cleared");
    }

    pub fn set_prompt(&self, prompt: impl Into<String>) {
        self.inner.state.lock().config.prompt = prompt.into();
    }

    /// Values below 1 become 1; excess turns are evicted immediately
    pub fn set_max_history(&self, max: usize) {
        let mut state = self.inner.state.lock();
        state.config.max_history = max.max(1);
        state.evict();
    }

    /// An empty language falls back to `en-US`
    pub fn set_language(&self, language: &str) {
        let language = if language.is_empty() { "en-US" } else { language };
        self.inner.state.lock().config.language = language.to_string();
    }

    pub fn set_auto_interrupt(&self, enabled: bool) {
        self.inner.state.lock().config.auto_interrupt = enabled;
        if !enabled {
            self.inner.debouncer.disarm();
        }
    }

    /// Values outside [0, 1] reset to 0.5
    pub fn set_interrupt_threshold(&self, threshold: f32) {
        let threshold = if (0.0..=1.0).contains(&threshold) {
            threshold
        } else {
            0.5
        };
        self.inner.state.lock().config.interrupt_threshold = threshold;
    }

    /// A zero timeout resets to 30 seconds
    pub fn set_response_timeout(&self, timeout: Duration) {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            timeout
        };
        self.inner.state.lock().config.response_timeout = timeout;
    }

    /// Zero resets to 1000 characters
    pub fn set_max_text_length(&self, length: usize) {
        self.inner.state.lock().config.max_text_length = if length == 0 { 1000 } else { length };
    }

    /// Write the history as a pretty JSON list of `{role, content}`
    pub fn export_history(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.history())?;
        std::fs::write(path, json)?;
        info!("Exported history to {}", path.display());
        Ok(())
    }

    /// Replace the history with the turns stored at `path`
    pub fn import_history(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let turns: Vec<ConversationTurn> = serde_json::from_str(&json)?;
        let count = turns.len();

        let mut state = self.inner.state.lock();
        state.history = turns.into();
        state.evict();
        info!("Imported {} turns from {}", count, path.display());
        Ok(count)
    }

    /// Stop the interrupt timer and forget all state
    pub fn cleanup(&self) {
        self.inner.debouncer.disarm();
        self.inner.state.lock().waiter = None;
        self.clear_history();
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 50 {
        let head: String = text.chars().take(50).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl MessageSender for Recorder {
        async fn send(&self, message: OutboundMessage) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Silent;

    impl PlaybackControl for Silent {
        fn fade_out(&self, _duration: Duration) {}

        fn current_amplitude(&self) -> f32 {
            0.0
        }
    }

    fn engine() -> ConversationEngine {
        ConversationEngine::new(
            ConversationConfig::default(),
            Arc::new(Recorder::default()),
            Arc::new(Silent),
            Handle::current(),
        )
    }

    fn transcription(text: &str, is_final: bool) -> InboundMessage {
        InboundMessage::typed(
            "transcription",
            serde_json::json!({ "text": text, "is_final": is_final }),
        )
    }

    #[tokio::test]
    async fn pending_text_is_truncated() {
        let engine = engine();
        engine.set_max_text_length(8);
        engine.handle_message(&transcription("hello ", false));
        engine.handle_message(&transcription("world", false));
        assert_eq!(engine.pending_text(), "hello wo");
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn prompt_lists_turns_after_system_prompt() {
        let engine = engine();
        {
            let mut state = engine.inner.state.lock();
            state.commit(Role::User, "hi".to_string());
            state.commit(Role::Assistant, "hello".to_string());
            assert_eq!(
                state.prompt().as_deref(),
                Some("You are a helpful assistant.\nuser: hi\nassistant: hello\n")
            );
        }
    }

    #[tokio::test]
    async fn setters_clamp() {
        let engine = engine();
        engine.set_interrupt_threshold(1.5);
        engine.set_language("");
        engine.set_response_timeout(Duration::ZERO);
        engine.set_max_history(0);

        let config = engine.config();
        assert_eq!(config.interrupt_threshold, 0.5);
        assert_eq!(config.language, "en-US");
        assert_eq!(config.response_timeout, Duration::from_secs(30));
        assert_eq!(config.max_history, 1);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let turn = ConversationTurn::new(Role::Assistant, "ok");
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
    }
}
