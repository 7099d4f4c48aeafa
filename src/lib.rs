pub mod audio;
pub mod client;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod stats;
pub mod subscription;

pub use audio::{
    AudioBackend, AudioConfig, AudioEngine, AudioFile, AudioFrame, CpalBackend, DeviceInfo,
    DeviceManager, Direction, PlaybackState, RecordingState, SegmentKey, SpeechSegment,
};
pub use client::{VocalsClient, VocalsClientBuilder};
pub use config::VocalsConfig;
pub use connection::{ConnectionManager, ConnectionState, Token, TokenManager};
pub use conversation::{ConversationConfig, ConversationEngine, ConversationTurn, Role};
pub use error::{ErrorCode, Result, VocalsError};
pub use protocol::{InboundEvent, InboundMessage, OutboundMessage};
pub use stats::{StatsAggregator, StatsCallbacks, StreamStats};
pub use subscription::{HandlerRegistry, Subscription};
