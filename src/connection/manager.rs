//! Connection state machine
//!
//! `connect` drives Disconnected → Connecting → Connected with a bounded
//! number of attempts separated by a fixed delay. Once connected, a read
//! task dispatches every decoded message to message subscribers. A read
//! failure while Connected moves to Reconnecting and retries in the
//! background with the same bound; exhausting it ends in Error.

use super::state::ConnectionState;
use super::token::TokenManager;
use super::transport::{Transport, TransportSink, TransportStream};
use crate::config::VocalsConfig;
use crate::error::{ErrorCode, Result, VocalsError};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::subscription::{HandlerRegistry, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// WebSocket endpoint URL
    pub endpoint: String,

    /// Extra handshake headers
    pub headers: Vec<(String, String)>,

    /// Attempts per connect or reconnect; 0 behaves as 1
    pub max_attempts: u32,

    /// Pause between failed attempts
    pub reconnect_delay: Duration,

    /// Log every message sent and received
    pub debug_websocket: bool,

    /// Sent first on every new connection
    pub handshake: Option<OutboundMessage>,
}

impl ConnectionSettings {
    pub fn from_config(config: &VocalsConfig) -> Self {
        Self {
            endpoint: config.ws_endpoint.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            max_attempts: config.max_reconnect_attempts,
            reconnect_delay: Duration::from_secs_f64(config.reconnect_delay.max(0.0)),
            debug_websocket: config.debug_websocket,
            handshake: None,
        }
    }
}

/// Anything that can deliver an outbound message to the service
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

struct Inner {
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    tokens: Option<Arc<TokenManager>>,

    state: Mutex<ConnectionState>,
    messages: HandlerRegistry<InboundMessage>,
    states: HandlerRegistry<ConnectionState>,
    errors: HandlerRegistry<VocalsError>,

    writer: tokio::sync::Mutex<Option<Box<dyn TransportSink>>>,
    /// Serializes connect and reconnect attempts
    connect_lock: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    should_reconnect: AtomicBool,
    attempts: AtomicU32,
    reconnects: AtomicU32,
}

/// Owns the duplex connection to the voice service
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn Transport>,
        tokens: Option<Arc<TokenManager>>,
        errors: HandlerRegistry<VocalsError>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                tokens,
                state: Mutex::new(ConnectionState::Disconnected),
                messages: HandlerRegistry::new("message"),
                states: HandlerRegistry::new("connection"),
                errors,
                writer: tokio::sync::Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                should_reconnect: AtomicBool::new(true),
                attempts: AtomicU32::new(0),
                reconnects: AtomicU32::new(0),
            }),
        }
    }

    /// Connect, retrying up to the configured number of attempts
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.is_active() {
                return Err(VocalsError::new(
                    ErrorCode::AlreadyActive,
                    format!("connection already {}", state),
                ));
            }
            *state = ConnectionState::Connecting;
        }
        self.inner.states.dispatch(ConnectionState::Connecting);
        info!("Connecting to {}", self.inner.settings.endpoint);

        // A fresh session token; stops any background reconnect still running
        let cancel = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.inner.cancel.lock(), cancel.clone());
        previous.cancel();

        self.inner.should_reconnect.store(true, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);

        connect_with_retry(&self.inner, cancel, false).await
    }

    /// Close the connection and stop reconnecting; safe to call repeatedly
    pub async fn disconnect(&self) {
        self.inner.should_reconnect.store(false, Ordering::SeqCst);
        self.inner.cancel.lock().cancel();

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                debug!("Error closing connection: {}", e);
            }
        }

        if self.inner.set_state(ConnectionState::Disconnected) {
            info!("Disconnected from {}", self.inner.settings.endpoint);
        }
    }

    /// Serialize and write one message; fails unless Connected
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(VocalsError::not_connected());
        }

        let text = message.to_json()?;
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(VocalsError::not_connected)?;

        if self.inner.settings.debug_websocket {
            debug!("Sending {} message ({} bytes)", message.event, text.len());
        }
        writer.send_text(text).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Failed attempts in the current connect or reconnect run
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Times the connection dropped and a reconnect started
    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn token_manager(&self) -> Option<&Arc<TokenManager>> {
        self.inner.tokens.as_ref()
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(handler)
    }

    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.states.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(VocalsError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(handler)
    }
}

#[async_trait]
impl MessageSender for ConnectionManager {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.send_message(&message).await
    }
}

impl Inner {
    /// Returns true if the state changed; observers hear only real changes
    fn set_state(&self, next: ConnectionState) -> bool {
        {
            let mut state = self.state.lock();
            if *state == next {
                return false;
            }
            debug!("Connection state {} -> {}", *state, next);
            *state = next;
        }
        self.states.dispatch(next);
        true
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// One attempt: credentials, transport handshake, then the settings message
    async fn establish(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let mut headers = Vec::new();
        if let Some(tokens) = &self.tokens {
            let token = tokens.get_token().await?;
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        headers.extend(self.settings.headers.iter().cloned());

        let (mut sink, stream) = self
            .transport
            .connect(&self.settings.endpoint, &headers)
            .await?;

        if let Some(handshake) = &self.settings.handshake {
            sink.send_text(handshake.to_json()?).await?;
        }

        Ok((sink, stream))
    }
}

fn cancelled() -> VocalsError {
    VocalsError::connection("connection attempt cancelled")
}

async fn connect_with_retry(
    inner: &Arc<Inner>,
    cancel: CancellationToken,
    reconnecting: bool,
) -> Result<()> {
    let _guard = inner.connect_lock.lock().await;
    let max = inner.settings.max_attempts.max(1);
    let mut last_error: Option<VocalsError> = None;
    let mut made = 0;

    for attempt in 1..=max {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        made = attempt;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = inner.establish() => result,
        };

        match result {
            Ok((mut sink, stream)) => {
                let mut writer = inner.writer.lock().await;
                // disconnect() cancels before taking the writer lock
                if cancel.is_cancelled() {
                    drop(writer);
                    if let Err(e) = sink.close().await {
                        debug!("Error closing abandoned connection: {}", e);
                    }
                    return Err(cancelled());
                }
                *writer = Some(sink);
                inner.attempts.store(0, Ordering::SeqCst);
                inner.set_state(ConnectionState::Connected);
                drop(writer);
                info!("Connected to {} on attempt {}", inner.settings.endpoint, attempt);

                tokio::spawn(read_loop(Arc::clone(inner), stream, cancel));
                return Ok(());
            }
            Err(e) => {
                inner.attempts.store(attempt, Ordering::SeqCst);
                warn!("Connection attempt {}/{} failed: {}", attempt, max, e);
                let critical = e.is_critical();
                last_error = Some(e);
                if critical {
                    break;
                }
            }
        }

        if attempt < max {
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(inner.settings.reconnect_delay) => {}
            }
        }
    }

    let cause = last_error.unwrap_or_else(|| VocalsError::connection("no attempt made"));
    let code = if reconnecting {
        ErrorCode::ReconnectFailed
    } else {
        ErrorCode::ConnectionFailed
    };
    let err = VocalsError::new(
        code,
        format!("failed to connect after {} attempt(s): {}", made, cause.message),
    )
    .with_detail("attempts", made)
    .with_detail("endpoint", inner.settings.endpoint.clone())
    .with_detail("cause", cause.message.clone())
    .with_detail("cause_code", cause.code.as_str());

    error!("{}", err);
    inner.set_state(ConnectionState::Error);
    inner.errors.dispatch(err.clone());
    Err(err)
}

async fn read_loop(inner: Arc<Inner>, mut stream: Box<dyn TransportStream>, cancel: CancellationToken) {
    debug!("Read loop started");
    let failure = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Read loop cancelled");
                return;
            }
            next = stream.next_text() => next,
        };

        match next {
            Some(Ok(text)) => match InboundMessage::parse(&text) {
                Ok(message) => {
                    if inner.settings.debug_websocket {
                        debug!("Received {} message", message.message_type());
                    }
                    inner.messages.dispatch(message);
                }
                Err(e) => warn!("Dropping malformed message: {}", e),
            },
            Some(Err(e)) => break e,
            None => break VocalsError::websocket("connection closed by server"),
        }
    };

    warn!("Connection lost: {}", failure);
    inner.writer.lock().await.take();
    inner.errors.dispatch(failure);

    let should_reconnect = inner.should_reconnect.load(Ordering::SeqCst) && !cancel.is_cancelled();
    if should_reconnect && inner.state() == ConnectionState::Connected {
        inner.reconnects.fetch_add(1, Ordering::SeqCst);
        inner.set_state(ConnectionState::Reconnecting);
        tokio::spawn(reconnect(inner, cancel));
    } else if !should_reconnect {
        debug!("Not reconnecting");
    }
}

// Boxed so the connect → read → reconnect cycle has a nameable future type
fn reconnect(inner: Arc<Inner>, cancel: CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        if inner.state() != ConnectionState::Reconnecting || cancel.is_cancelled() {
            return;
        }
        info!("Reconnecting to {}", inner.settings.endpoint);
        if let Err(e) = connect_with_retry(&inner, cancel, true).await {
            debug!("Reconnect ended: {}", e);
        }
    })
}
