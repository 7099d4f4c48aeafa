//! Connection to the voice service
//!
//! This module provides:
//! - `ConnectionManager`: the connect/reconnect state machine and inbound fan-out
//! - `Transport`: the duplex text channel, WebSocket by default
//! - `TokenManager` and `CredentialProvider`: bearer tokens for the handshake

mod manager;
mod state;
pub mod token;
mod transport;

pub use manager::{ConnectionManager, ConnectionSettings, MessageSender};
pub use state::ConnectionState;
pub use token::{
    decode_token, validate_api_key, ApiKeySigner, CredentialProvider, HttpTokenProvider, Token,
    TokenManager,
};
pub use transport::{Transport, TransportSink, TransportStream, WebSocketTransport};
