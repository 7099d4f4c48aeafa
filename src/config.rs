use crate::connection::token::{key_hint, API_KEY_MIN_LENGTH, API_KEY_PREFIX};
use crate::error::{Result, VocalsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_WS_ENDPOINT: &str = "ws://localhost:8000/v1/stream/conversation";

const DEBUG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR"];

/// Connection and session settings.
///
/// Loaded from defaults, then an optional config file, then `VOCALS_*`
/// environment variables (a `.env` file in the working directory counts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocalsConfig {
    /// WebSocket endpoint of the voice service
    pub ws_endpoint: String,

    /// HTTP endpoint issuing bearer tokens; local signing is used when unset
    pub token_endpoint: Option<String>,

    /// Extra headers sent with the handshake and token requests
    pub headers: BTreeMap<String, String>,

    /// Connect as soon as the client is built
    pub auto_connect: bool,

    /// Attempts per connect or reconnect
    pub max_reconnect_attempts: u32,

    /// Seconds between failed attempts
    pub reconnect_delay: f64,

    /// Refresh a cached token this many seconds before it expires
    pub token_refresh_buffer: f64,

    /// Attach a bearer token to the handshake
    pub use_token_auth: bool,

    /// DEBUG, INFO, WARNING or ERROR
    pub debug_level: String,

    pub debug_websocket: bool,

    pub debug_audio: bool,

    /// Capture device index
    pub audio_device_id: Option<usize>,

    /// Developer API key used for local token signing
    pub dev_api_key: Option<String>,

    /// User id embedded in locally signed tokens
    pub user_id: Option<String>,
}

impl Default for VocalsConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: DEFAULT_WS_ENDPOINT.to_string(),
            token_endpoint: None,
            headers: BTreeMap::new(),
            auto_connect: false,
            max_reconnect_attempts: 3,
            reconnect_delay: 1.0,
            token_refresh_buffer: 60.0,
            use_token_auth: true,
            debug_level: "INFO".to_string(),
            debug_websocket: false,
            debug_audio: false,
            audio_device_id: None,
            dev_api_key: None,
            user_id: None,
        }
    }
}

impl VocalsConfig {
    /// Load settings from the environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load settings, layering `path` (if given) under the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", env_file.display());
        }

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("VOCALS").try_parsing(true))
            .build()
            .map_err(|e| VocalsError::config(format!("failed to load configuration: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| VocalsError::config(format!("invalid configuration: {}", e)))
    }

    /// Human-readable problems; empty when the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.use_token_auth && self.token_endpoint.is_none() {
            match self.dev_api_key.as_deref() {
                None | Some("") => issues.push("VOCALS_DEV_API_KEY is not set".to_string()),
                Some(key) if !key.starts_with(API_KEY_PREFIX) => issues.push(format!(
                    "Invalid API key format (should start with '{}')",
                    API_KEY_PREFIX
                )),
                Some(key) if key.len() < API_KEY_MIN_LENGTH => issues.push(format!(
                    "API key too short (at least {} characters)",
                    API_KEY_MIN_LENGTH
                )),
                Some(_) => {}
            }
        }

        if !(self.ws_endpoint.starts_with("ws://") || self.ws_endpoint.starts_with("wss://")) {
            issues.push(format!("Invalid WebSocket endpoint: {}", self.ws_endpoint));
        }

        if let Some(endpoint) = &self.token_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                issues.push(format!("Invalid token endpoint: {}", endpoint));
            }
        }

        if !DEBUG_LEVELS.contains(&self.debug_level.to_ascii_uppercase().as_str()) {
            issues.push(format!("Invalid debug level: {}", self.debug_level));
        }

        if self.reconnect_delay < 0.0 {
            issues.push("Reconnect delay must not be negative".to_string());
        }
        if self.token_refresh_buffer < 0.0 {
            issues.push("Token refresh buffer must not be negative".to_string());
        }

        issues
    }

    /// Fail with `ConfigInvalid` listing every issue
    pub fn ensure_valid(&self) -> Result<()> {
        let issues = self.validate();
        if issues.is_empty() {
            return Ok(());
        }
        Err(VocalsError::config(issues.join("; ")).with_detail("issues", issues))
    }

    /// `tracing` filter directive for the configured debug level
    pub fn log_filter(&self) -> &'static str {
        match self.debug_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }

    /// API key with everything after the first 10 characters hidden
    pub fn masked_api_key(&self) -> String {
        match self.dev_api_key.as_deref() {
            Some(key) if key.chars().count() > 10 => key_hint(key, 10),
            Some(key) if !key.is_empty() => "***".to_string(),
            _ => "NOT SET".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> VocalsConfig {
        VocalsConfig {
            dev_api_key: Some("vdev_0123456789abcdef0123456789abcdef".to_string()),
            ..VocalsConfig::default()
        }
    }

    #[test]
    fn defaults() {
        let config = VocalsConfig::default();
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, 1.0);
        assert_eq!(config.token_refresh_buffer, 60.0);
        assert!(config.use_token_auth);
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn validation_reports_each_issue() {
        assert!(valid().validate().is_empty());
        assert!(valid().ensure_valid().is_ok());

        let config = VocalsConfig {
            dev_api_key: None,
            ws_endpoint: "http://example.com".to_string(),
            debug_level: "TRACE".to_string(),
            reconnect_delay: -1.0,
            ..VocalsConfig::default()
        };
        let issues = config.validate();
        assert_eq!(issues.len(), 4);

        let err = config.ensure_valid().unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn api_key_not_required_with_token_endpoint_or_without_auth() {
        let with_endpoint = VocalsConfig {
            token_endpoint: Some("https://example.com/api/wstoken".to_string()),
            ..VocalsConfig::default()
        };
        assert!(with_endpoint.validate().is_empty());

        let no_auth = VocalsConfig {
            use_token_auth: false,
            ..VocalsConfig::default()
        };
        assert!(no_auth.validate().is_empty());
    }

    #[test]
    fn masked_key_counts_characters() {
        assert_eq!(valid().masked_api_key(), "vdev_01234...");

        let accented = VocalsConfig {
            dev_api_key: Some(format!("vdev_abcdé{}", "x".repeat(30))),
            ..VocalsConfig::default()
        };
        assert_eq!(accented.masked_api_key(), "vdev_abcdé...");
        assert_eq!(VocalsConfig::default().masked_api_key(), "NOT SET");
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocals.toml");
        std::fs::write(
            &path,
            "ws_endpoint = \"wss://voice.example.com/stream\"\nmax_reconnect_attempts = 5\n",
        )
        .unwrap();

        let config = VocalsConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ws_endpoint, "wss://voice.example.com/stream");
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, 1.0);
    }
}
