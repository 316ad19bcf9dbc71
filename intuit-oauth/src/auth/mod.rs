mod error;
mod token;

pub use error::AuthError;
pub use token::{EnvFileSink, TokenSink, TokenState};

use std::time::Duration;

use base64::Engine;
use reqwest::{header, Client};
use token::AuthTokenResponse;
use url::Url;

pub const DEFAULT_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";

/// Tokens expiring sooner than this are renewed before they are handed out.
const PROACTIVE_REFRESH_SKEW_SECS: i64 = 300;
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    fn basic_header(&self) -> String {
        let pair = format!("{}:{}", self.client_id, self.client_secret);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(pair)
        )
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Owns the access/refresh token pair shared by every worker of a run.
///
/// Refreshes are single-flight: workers that saw the same expired token and
/// call [`TokenManager::refresh_if_stale`] together cause exactly one request
/// to the token endpoint, and all of them get the new access token back.
pub struct TokenManager {
    http: Client,
    token_url: String,
    credentials: ClientCredentials,
    state: async_lock::RwLock<TokenState>,
    refresh_lock: async_lock::Mutex<()>,
    sink: Option<Box<dyn TokenSink>>,
}

impl TokenManager {
    pub fn new(credentials: ClientCredentials, initial: TokenState) -> Self {
        Self {
            http: Client::new(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            credentials,
            state: async_lock::RwLock::new(initial),
            refresh_lock: async_lock::Mutex::new(()),
            sink: None,
        }
    }

    /// Points refreshes at another endpoint, mostly useful against a mock
    /// server.
    pub fn with_token_url(mut self, token_url: &str) -> Result<Self, AuthError> {
        self.token_url = Url::parse(token_url)?.to_string();
        Ok(self)
    }

    #[must_use]
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: impl TokenSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub async fn snapshot(&self) -> TokenState {
        self.state.read().await.clone()
    }

    /// Current access token, renewed first if it is known to be close to
    /// expiry.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let current = self.snapshot().await;
        if current.expires_within(chrono::Duration::seconds(PROACTIVE_REFRESH_SKEW_SECS)) {
            log::debug!("Access token expires soon, refreshing ahead of time");
            return self.refresh_if_stale(&current.access_token).await;
        }
        Ok(current.access_token)
    }

    /// Unconditionally exchanges the refresh token for a new pair.
    pub async fn refresh(&self) -> Result<TokenState, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.exchange().await
    }

    /// Refreshes only if `stale` is still the token in use. When another
    /// caller already replaced it, the replacement is returned without a
    /// network round trip.
    pub async fn refresh_if_stale(&self, stale: &str) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        {
            let current = self.state.read().await;
            if current.access_token != stale {
                log::debug!("Access token already refreshed by another worker");
                return Ok(current.access_token.clone());
            }
        }
        Ok(self.exchange().await?.access_token)
    }

    /// Must be called with `refresh_lock` held.
    async fn exchange(&self) -> Result<TokenState, AuthError> {
        let refresh_token = self.state.read().await.refresh_token.clone();
        if refresh_token.is_empty() {
            return Err(AuthError::NoRefreshToken);
        }

        let response = self
            .http
            .post(self.token_url.as_str())
            .header(header::AUTHORIZATION, self.credentials.basic_header())
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Token refresh rejected with {status}: {body}");
            return Err(AuthError::Rejected { status, body });
        }

        let AuthTokenResponse {
            access_token,
            refresh_token: rotated,
            expires_in,
            ..
        } = response.json().await?;

        let access_token = access_token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::NoAccessToken)?;
        let next = TokenState {
            access_token,
            refresh_token: rotated
                .filter(|token| !token.is_empty())
                .unwrap_or(refresh_token),
            expires_at: expires_in
                .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
        };

        *self.state.write().await = next.clone();

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&next) {
                log::error!("Could not persist rotated tokens: {e}");
            }
        }
        log::info!("Refreshed QuickBooks access token");
        Ok(next)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_url", &self.token_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}
