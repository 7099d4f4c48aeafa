//! Bearer tokens for the connection handshake
//!
//! A token comes either from an HTTP refresh endpoint or from signing a
//! short-lived HS256 token locally with a developer API key. Both sit behind
//! [`CredentialProvider`]; [`TokenManager`] caches whichever is configured and
//! refreshes it before it gets within the refresh buffer of expiry.

use crate::error::{ErrorCode, Result, VocalsError};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Prefix every developer API key carries
pub const API_KEY_PREFIX: &str = "vdev_";

pub const API_KEY_MIN_LENGTH: usize = 32;

/// Lifetime of locally signed tokens
pub const SIGNED_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Opaque bearer token and its expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Remaining lifetime, zero once expired
    pub fn time_left(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Still valid `buffer` from now
    pub fn is_valid_for(&self, buffer: Duration) -> bool {
        self.time_left() > buffer
    }
}

/// Source of bearer tokens
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> Result<Token>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Check an API key's shape without contacting the service
pub fn validate_api_key(api_key: &str) -> Result<()> {
    if api_key.len() >= API_KEY_MIN_LENGTH && api_key.starts_with(API_KEY_PREFIX) {
        Ok(())
    } else {
        Err(VocalsError::new(ErrorCode::AuthFailed, "invalid API key format")
            .with_detail("expected_prefix", API_KEY_PREFIX)
            .with_detail("min_length", API_KEY_MIN_LENGTH))
    }
}

/// The first `chars` characters of `api_key` followed by `...`
pub(crate) fn key_hint(api_key: &str, chars: usize) -> String {
    let prefix: String = api_key.chars().take(chars).collect();
    format!("{}...", prefix)
}

/// Signs HS256 tokens locally from a developer API key
#[derive(Clone)]
pub struct ApiKeySigner {
    api_key: String,
    user_id: Option<String>,
    ttl: Duration,
}

impl ApiKeySigner {
    pub fn new(api_key: impl Into<String>, user_id: Option<String>) -> Result<Self> {
        let api_key = api_key.into();
        validate_api_key(&api_key)?;
        Ok(Self {
            api_key,
            user_id,
            ttl: SIGNED_TOKEN_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn sign(&self) -> Result<Token> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl)
                .map_err(|e| VocalsError::new(ErrorCode::TokenGenerationFailed, e.to_string()))?;

        let mut claims = json!({
            "apiKey": key_hint(&self.api_key, 8),
            "exp": expires_at.timestamp(),
        });
        if let Some(user_id) = &self.user_id {
            claims["userId"] = Value::String(user_id.clone());
        }

        let token = sign_hs256(&claims, self.api_key.as_bytes())?;
        Ok(Token { token, expires_at })
    }
}

impl std::fmt::Debug for ApiKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeySigner")
            .field("api_key", &key_hint(&self.api_key, 8))
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for ApiKeySigner {
    async fn fetch(&self) -> Result<Token> {
        self.sign()
    }

    fn name(&self) -> &str {
        "api-key"
    }
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key)
        .map_err(|e| VocalsError::new(ErrorCode::TokenGenerationFailed, e.to_string()))
}

fn sign_hs256(claims: &Value, key: &[u8]) -> Result<String> {
    let header = json!({ "alg": "HS256", "typ": "JWT" });
    let signing_input = format!(
        "{}.{}",
        b64(&serde_json::to_vec(&header)?),
        b64(&serde_json::to_vec(claims)?)
    );

    let mut mac = mac(key)?;
    mac.update(signing_input.as_bytes());
    let signature = mac.finalize().into_bytes();

    Ok(format!("{}.{}", signing_input, b64(&signature)))
}

/// Verify an HS256 token against `api_key` and return its claims
pub fn decode_token(token: &str, api_key: &str) -> Result<Value> {
    let invalid = |reason: &str| VocalsError::new(ErrorCode::AuthFailed, format!("invalid token: {}", reason));

    let mut parts = token.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => (h, p, s),
        _ => return Err(invalid("expected three segments")),
    };

    let signature = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| invalid("bad signature encoding"))?;
    let mut mac = mac(api_key.as_bytes())?;
    mac.update(format!("{}.{}", header, payload).as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| invalid("signature mismatch"))?;

    let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| invalid("bad payload encoding"))?;
    Ok(serde_json::from_slice(&claims)?)
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: f64,
}

/// Fetches tokens from an HTTP refresh endpoint
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>, headers: BTreeMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VocalsError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            headers,
        })
    }
}

#[async_trait]
impl CredentialProvider for HttpTokenProvider {
    async fn fetch(&self) -> Result<Token> {
        let mut request = self.client.post(&self.endpoint).json(&json!({}));
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            VocalsError::new(ErrorCode::TokenGenerationFailed, format!("token request failed: {}", e))
                .with_detail("endpoint", self.endpoint.clone())
        })?;

        let status = response.status();
        if !status.is_success() {
            let code = if status.as_u16() == 401 || status.as_u16() == 403 {
                ErrorCode::AuthFailed
            } else {
                ErrorCode::TokenGenerationFailed
            };
            return Err(VocalsError::new(code, format!("failed to refresh token: {}", status))
                .with_detail("status_code", status.as_u16())
                .with_detail("endpoint", self.endpoint.clone()));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            VocalsError::new(ErrorCode::TokenGenerationFailed, format!("invalid token response: {}", e))
        })?;
        if body.token.is_empty() {
            return Err(VocalsError::new(ErrorCode::TokenGenerationFailed, "no token received"));
        }

        let expires_at = Utc
            .timestamp_millis_opt(body.expires_at as i64)
            .single()
            .ok_or_else(|| VocalsError::new(ErrorCode::TokenGenerationFailed, "invalid expiresAt"))?;

        Ok(Token {
            token: body.token,
            expires_at,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Caches a provider's token and refreshes it ahead of expiry
pub struct TokenManager {
    provider: Arc<dyn CredentialProvider>,
    refresh_buffer: Duration,
    cached: Mutex<Option<Token>>,
}

impl TokenManager {
    pub fn new(provider: Arc<dyn CredentialProvider>, refresh_buffer: Duration) -> Self {
        Self {
            provider,
            refresh_buffer,
            cached: Mutex::new(None),
        }
    }

    /// A token valid for at least the refresh buffer, fetching if needed
    pub async fn get_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_valid_for(self.refresh_buffer) {
                return Ok(token.token.clone());
            }
            debug!("Cached token within refresh buffer, refreshing");
        }

        let token = self.provider.fetch().await?;
        info!(
            "Obtained token from {} provider, expires at {}",
            self.provider.name(),
            token.expires_at
        );
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    pub async fn clear(&self) {
        *self.cached.lock().await = None;
    }

    /// The cached token, if any
    pub async fn token_info(&self) -> Option<Token> {
        self.cached.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: &str = "vdev_0123456789abcdef0123456789abcdef";

    struct CountingProvider {
        calls: AtomicUsize,
        ttl: chrono::Duration,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn fetch(&self) -> Result<Token> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Token {
                token: format!("token-{}", n),
                expires_at: Utc::now() + self.ttl,
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn api_key_format() {
        assert!(validate_api_key(KEY).is_ok());
        assert!(validate_api_key("vdev_short").is_err());
        assert!(validate_api_key("prod_0123456789abcdef0123456789abcdef").is_err());
    }

    #[test]
    fn signed_token_verifies_and_carries_claims() {
        let signer = ApiKeySigner::new(KEY, Some("user-1".to_string())).unwrap();
        let token = signer.sign().unwrap();
        assert!(!token.is_expired());
        assert!(token.time_left() > Duration::from_secs(590));

        let claims = decode_token(&token.token, KEY).unwrap();
        assert_eq!(claims["apiKey"], "vdev_012...");
        assert_eq!(claims["userId"], "user-1");
        assert_eq!(claims["exp"], token.expires_at.timestamp());

        assert!(decode_token(&token.token, "vdev_another_key_that_is_long_enough").is_err());
    }

    #[test]
    fn non_ascii_key_signs_without_panicking() {
        let key = format!("vdev_abé{}", "x".repeat(30));
        let signer = ApiKeySigner::new(key.clone(), None).unwrap();
        let token = signer.sign().unwrap();

        let claims = decode_token(&token.token, &key).unwrap();
        assert_eq!(claims["apiKey"], "vdev_abé...");
        assert!(format!("{:?}", signer).contains("vdev_abé..."));
    }

    #[tokio::test]
    async fn reuses_token_outside_refresh_buffer() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            ttl: chrono::Duration::minutes(10),
        });
        let manager = TokenManager::new(provider.clone(), Duration::from_secs(60));

        assert_eq!(manager.get_token().await.unwrap(), "token-0");
        assert_eq!(manager.get_token().await.unwrap(), "token-0");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        manager.clear().await;
        assert!(manager.token_info().await.is_none());
        assert_eq!(manager.get_token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn refreshes_inside_refresh_buffer() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            ttl: chrono::Duration::seconds(30),
        });
        let manager = TokenManager::new(provider.clone(), Duration::from_secs(60));

        manager.get_token().await.unwrap();
        manager.get_token().await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
