//! Bearer credentials and their renewal.
//!
//! The [`TokenManager`] owns the current [`Token`] for one client. Renewal
//! is coalesced: however many callers notice an expired or rejected token
//! at once, the [`CredentialSource`] is asked exactly once and everyone
//! else picks up the result.

use crate::config::ClientConfig;
use crate::error::{FreeseekError, Result};
use crate::transport::{HttpRequest, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// A bearer credential.
#[derive(Clone)]
pub struct Token {
    value: SecretString,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    generation: u64,
}

impl Token {
    /// A token valid for `ttl` from now.
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(5_200));
        Self {
            value: SecretString::from(value.into()),
            issued_at,
            expires_at: issued_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            generation: 0,
        }
    }

    /// The secret value.
    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    /// When the token was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the token stops being valid.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Position of this token in the manager's refresh sequence.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `Authorization` header value, marked sensitive.
    pub(crate) fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.value.expose_secret()))
            .map_err(|_| FreeseekError::Auth {
                status: 0,
                message: "token contains characters not allowed in a header".into(),
            })?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Obtains fresh bearer credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Issue a new token for the given configuration.
    async fn fetch_token(&self, config: &ClientConfig) -> Result<Token>;
}

/// Uses the API key itself as the bearer credential.
///
/// The token is re-issued every `token_ttl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiKeyCredentials;

#[async_trait]
impl CredentialSource for ApiKeyCredentials {
    async fn fetch_token(&self, config: &ClientConfig) -> Result<Token> {
        Ok(Token::new(config.api_key.expose_secret(), config.token_ttl))
    }
}

/// Exchanges the API key for a short-lived token at `POST {base_url}/auth/token`.
pub struct TokenExchange {
    transport: Arc<dyn Transport>,
    path: String,
}

#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenExchange {
    /// Exchange through the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            path: "auth/token".to_string(),
        }
    }

    /// Use a different exchange path, relative to the base URL.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

impl fmt::Debug for TokenExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenExchange")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialSource for TokenExchange {
    async fn fetch_token(&self, config: &ClientConfig) -> Result<Token> {
        let key = Token::new(config.api_key.expose_secret(), config.token_ttl);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, key.header_value()?);

        let request = HttpRequest {
            method: Method::POST,
            url: config.endpoint_url(&self.path),
            headers,
            body: None,
            timeout: config.timeout,
            streaming: false,
        };

        let body = match self.transport.send(request).await {
            Ok(response) => response.into_json().await?,
            Err(FreeseekError::Http { status, message }) if status == 403 => {
                return Err(FreeseekError::Auth { status, message });
            }
            Err(e) => return Err(e),
        };

        let grant: TokenGrant = serde_json::from_value(body)?;
        let ttl = grant
            .expires_in
            .map_or(config.token_ttl, Duration::from_secs);
        Ok(Token::new(grant.access_token, ttl))
    }
}

/// Owns the current token and serializes its renewal.
pub struct TokenManager {
    source: Arc<dyn CredentialSource>,
    current: RwLock<Option<Arc<Token>>>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshes: AtomicU64,
}

impl TokenManager {
    /// Create a manager with no token yet; the first call fetches one.
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// A valid token, fetching one if none is held or it has expired.
    pub async fn token(&self, config: &ClientConfig) -> Result<Arc<Token>> {
        let seen = self.generation.load(Ordering::Acquire);
        if let Some(token) = self.current.read().as_ref() {
            if !token.is_expired() {
                return Ok(Arc::clone(token));
            }
            debug!(generation = token.generation, "Token expired, renewing");
        }
        self.renew(config, seen).await
    }

    /// Renew after the service rejected `rejected`.
    ///
    /// Returns the already-renewed token if another caller got there first.
    pub async fn refresh_rejected(
        &self,
        config: &ClientConfig,
        rejected: &Token,
    ) -> Result<Arc<Token>> {
        self.renew(config, rejected.generation).await
    }

    /// Unconditionally fetch a new token.
    pub async fn refresh(&self, config: &ClientConfig) -> Result<Arc<Token>> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_locked(config).await
    }

    /// Renewals performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// The token currently held, if any.
    pub fn current(&self) -> Option<Arc<Token>> {
        self.current.read().clone()
    }

    async fn renew(&self, config: &ClientConfig, seen: u64) -> Result<Arc<Token>> {
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(token) = self.current.read().as_ref() {
                if !token.is_expired() {
                    return Ok(Arc::clone(token));
                }
            }
        }

        self.fetch_locked(config).await
    }

    /// Caller must hold `refresh_lock`.
    async fn fetch_locked(&self, config: &ClientConfig) -> Result<Arc<Token>> {
        let mut token = self.source.fetch_token(config).await?;
        let generation = self.generation.load(Ordering::Acquire) + 1;
        token.generation = generation;

        let token = Arc::new(token);
        *self.current.write() = Some(Arc::clone(&token));
        self.generation.store(generation, Ordering::Release);
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        info!(generation, expires_at = %token.expires_at, "Bearer token renewed");
        Ok(token)
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("refreshes", &self.refreshes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawResponse;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
        ttl: Duration,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fetch_token(&self, _config: &ClientConfig) -> Result<Token> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Token::new(format!("tok-{n}"), self.ttl))
        }
    }

    fn counting(ttl: Duration) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            ttl,
        })
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let source = counting(Duration::from_secs(60));
        let manager = TokenManager::new(source.clone());
        let config = ClientConfig::new("key");

        let a = manager.token(&config).await.unwrap();
        let b = manager.token(&config).await.unwrap();
        assert_eq!(a.secret().expose_secret(), "tok-1");
        assert_eq!(b.generation(), a.generation());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed() {
        let source = counting(Duration::ZERO);
        let manager = TokenManager::new(source.clone());
        let config = ClientConfig::new("key");

        manager.token(&config).await.unwrap();
        let renewed = manager.token(&config).await.unwrap();
        assert_eq!(renewed.secret().expose_secret(), "tok-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_rejections_coalesce() {
        let source = counting(Duration::from_secs(60));
        let manager = Arc::new(TokenManager::new(source.clone()));
        let config = Arc::new(ClientConfig::new("key"));
        let rejected = manager.token(&config).await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let config = Arc::clone(&config);
                let rejected = Arc::clone(&rejected);
                tokio::spawn(async move { manager.refresh_rejected(&config, &rejected).await })
            })
            .collect();

        for task in tasks {
            let token = task.await.unwrap().unwrap();
            assert_eq!(token.secret().expose_secret(), "tok-2");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_forced_refresh_always_fetches() {
        let source = counting(Duration::from_secs(60));
        let manager = TokenManager::new(source.clone());
        let config = ClientConfig::new("key");

        manager.refresh(&config).await.unwrap();
        manager.refresh(&config).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.current().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_api_key_credentials() {
        let mut config = ClientConfig::new("my-key");
        config.token_ttl = Duration::from_secs(10);
        let token = ApiKeyCredentials.fetch_token(&config).await.unwrap();

        assert_eq!(token.secret().expose_secret(), "my-key");
        assert!(!token.is_expired());
        assert_eq!((token.expires_at() - token.issued_at()).num_seconds(), 10);
        assert!(!format!("{token:?}").contains("my-key"));
    }

    struct GrantTransport;

    #[async_trait]
    impl Transport for GrantTransport {
        async fn send(&self, request: HttpRequest) -> Result<RawResponse> {
            assert_eq!(request.url, "https://api.freeseek.com/v1/auth/token");
            assert_eq!(request.bearer_token(), Some("api-key"));
            Ok(RawResponse::json(&serde_json::json!({
                "access_token": "exchanged",
                "expires_in": 120
            })))
        }
    }

    #[tokio::test]
    async fn test_token_exchange() {
        let exchange = TokenExchange::new(Arc::new(GrantTransport));
        let token = exchange
            .fetch_token(&ClientConfig::new("api-key"))
            .await
            .unwrap();

        assert_eq!(token.secret().expose_secret(), "exchanged");
        assert_eq!((token.expires_at() - token.issued_at()).num_seconds(), 120);
    }
}
