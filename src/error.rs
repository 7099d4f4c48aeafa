//! Error model shared by every component of the SDK.
//!
//! Failures are classified by [`ErrorCode`] rather than by type. A single
//! [`VocalsError`] carries the code, a human message, a detail bag for
//! diagnosis and, when backtraces are enabled, the stack at construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Machine-readable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    ReconnectFailed,
    TokenExpired,
    TokenGenerationFailed,
    #[serde(rename = "AUDIO_DEVICE_ERROR")]
    AudioDevice,
    #[serde(rename = "PLAYBACK_ERROR")]
    Playback,
    #[serde(rename = "WEBSOCKET_ERROR")]
    WebSocket,
    TranscriptionFailed,
    ResponseFailed,
    InterruptFailed,
    ConfigInvalid,
    #[serde(rename = "JSON_PARSE_ERROR")]
    Parse,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    AuthFailed,
    AlreadyActive,
    NotConnected,
    AlreadyRecording,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ReconnectFailed => "RECONNECT_FAILED",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::TokenGenerationFailed => "TOKEN_GENERATION_FAILED",
            ErrorCode::AudioDevice => "AUDIO_DEVICE_ERROR",
            ErrorCode::Playback => "PLAYBACK_ERROR",
            ErrorCode::WebSocket => "WEBSOCKET_ERROR",
            ErrorCode::TranscriptionFailed => "TRANSCRIPTION_FAILED",
            ErrorCode::ResponseFailed => "RESPONSE_FAILED",
            ErrorCode::InterruptFailed => "INTERRUPT_FAILED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::Parse => "JSON_PARSE_ERROR",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::AlreadyActive => "ALREADY_ACTIVE",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::AlreadyRecording => "ALREADY_RECORDING",
            ErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Codes that the connection layer retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ReconnectFailed
                | ErrorCode::WebSocket
                | ErrorCode::Timeout
        )
    }

    /// Codes that must halt dependent operations and are never retried.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed
                | ErrorCode::TokenExpired
                | ErrorCode::TokenGenerationFailed
                | ErrorCode::ConfigInvalid
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure carrier used across component boundaries.
#[derive(Debug, Clone, Error)]
#[error("{message} ({code})")]
pub struct VocalsError {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    details: BTreeMap<String, Value>,
    stack: Option<String>,
}

impl VocalsError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let backtrace = Backtrace::capture();
        let stack = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };

        Self {
            code,
            message: message.into(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
            stack,
        }
    }

    /// Builder-style detail append.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn add_detail(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.details.insert(key.into(), value.into());
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_critical(&self) -> bool {
        self.code.is_critical()
    }

    /// Wrap a foreign error, keeping its text under `original_error`.
    pub fn wrap(code: ErrorCode, err: impl fmt::Display) -> Self {
        let text = err.to_string();
        Self::new(code, text.clone()).with_detail("original_error", text)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, message)
    }

    pub fn websocket(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WebSocket, message)
    }

    pub fn audio_device(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AudioDevice, message)
    }

    pub fn playback(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Playback, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Parse, message)
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "not connected")
    }
}

impl From<serde_json::Error> for VocalsError {
    fn from(err: serde_json::Error) -> Self {
        VocalsError::wrap(ErrorCode::Parse, err)
    }
}

impl From<std::io::Error> for VocalsError {
    fn from(err: std::io::Error) -> Self {
        VocalsError::wrap(ErrorCode::Unknown, err)
    }
}

impl From<hound::Error> for VocalsError {
    fn from(err: hound::Error) -> Self {
        VocalsError::wrap(ErrorCode::Playback, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VocalsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VocalsError::wrap(ErrorCode::WebSocket, err)
    }
}

impl From<cpal::DevicesError> for VocalsError {
    fn from(err: cpal::DevicesError) -> Self {
        VocalsError::wrap(ErrorCode::AudioDevice, err)
    }
}

impl From<cpal::DefaultStreamConfigError> for VocalsError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VocalsError::wrap(ErrorCode::AudioDevice, err)
    }
}

impl From<cpal::SupportedStreamConfigsError> for VocalsError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        VocalsError::wrap(ErrorCode::AudioDevice, err)
    }
}

impl From<cpal::BuildStreamError> for VocalsError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VocalsError::wrap(ErrorCode::AudioDevice, err)
    }
}

impl From<cpal::PlayStreamError> for VocalsError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VocalsError::wrap(ErrorCode::AudioDevice, err)
    }
}

pub type Result<T> = std::result::Result<T, VocalsError>;
