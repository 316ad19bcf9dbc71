//! # `QuickBooks` Online API Context
//!
//! [`QBContext`] is the one handle every poster shares. It carries the realm,
//! base URL and minor version used to build endpoint URLs, and funnels each
//! request through the same pipeline:
//!
//! 1. wait for a slot on the shared [`RateLimiter`];
//! 2. attach the bearer token from the shared [`TokenManager`];
//! 3. on HTTP 429, back off exponentially (honouring `Retry-After`) and try
//!    again, up to [`ThrottlePolicy::max_retries`] times;
//! 4. on HTTP 401/403, refresh the token once (single-flight across workers)
//!    and repeat the request; a second rejection is returned as
//!    [`APIError::Unauthorized`].
//!
//! ### Rate Limits
//!
//! - Production: 500 requests per minute, 10 requests per second
//! - Batch operations: 30 requests per batch, 40 batches per minute
use std::{sync::Arc, time::Duration};

use intuit_oauth::{EnvFileSink, TokenManager};
use rand::Rng;
use reqwest::{header, Client, Method, StatusCode};
use serde_json::Value;
use url::Url;

use super::{entity_path, HttpReply};
use crate::{config::PorterConfig, limiter::RateLimiter, APIError, APIResult, Environment};

/// Exponential backoff applied to HTTP 429 replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ThrottlePolicy {
    /// Delay before retry number `attempt` (1-based), with up to 25% jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        exp.mul_f64(1.0 + jitter).min(self.max_delay)
    }
}

pub struct QBContext {
    pub(crate) environment: Environment,
    pub(crate) company_id: String,
    base_url: Url,
    minor_version: u32,
    timeout: Duration,
    http: Client,
    tokens: Arc<TokenManager>,
    limiter: RateLimiter,
    throttle: ThrottlePolicy,
}

impl QBContext {
    pub fn new(
        environment: Environment,
        company_id: impl Into<String>,
        tokens: Arc<TokenManager>,
        limiter: RateLimiter,
    ) -> APIResult<Self> {
        Ok(Self {
            environment,
            company_id: company_id.into(),
            base_url: Url::parse(environment.endpoint_url())?,
            minor_version: crate::config::DEFAULT_MINOR_VERSION,
            timeout: crate::config::DEFAULT_TIMEOUT,
            http: Client::new(),
            tokens,
            limiter,
            throttle: ThrottlePolicy::default(),
        })
    }

    /// Builds the token manager, limiter and context described by `config`.
    ///
    /// Rotated tokens are written back to `./.env` when that file exists.
    pub fn from_config(config: &PorterConfig) -> APIResult<Self> {
        let mut tokens = TokenManager::new(config.credentials(), config.initial_tokens());
        if std::path::Path::new(".env").exists() {
            tokens = tokens.with_sink(EnvFileSink::new(".env"));
        }
        Ok(Self::new(
            config.environment,
            &config.realm_id,
            Arc::new(tokens),
            RateLimiter::new(config.max_rps),
        )?
        .with_minor_version(config.minor_version)
        .with_timeout(config.timeout))
    }

    /// Overrides the `.../v3/` API root, e.g. to target a mock server.
    pub fn with_base_url(mut self, base_url: &str) -> APIResult<Self> {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = Url::parse(&base_url)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_minor_version(mut self, minor_version: u32) -> Self {
        self.minor_version = minor_version;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_throttle_policy(mut self, throttle: ThrottlePolicy) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// `POST` target for creating a single `entity`.
    pub fn entity_url(&self, entity: &str) -> APIResult<Url> {
        self.company_url(&entity_path(entity), &[])
    }

    /// `GET` target for a QuickBooks query statement.
    pub fn query_url(&self, query: &str) -> APIResult<Url> {
        self.company_url("query", &[("query", query)])
    }

    fn company_url(&self, path: &str, params: &[(&str, &str)]) -> APIResult<Url> {
        let mut url = self
            .base_url
            .join(&format!("company/{}/{path}", self.company_id))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("minorversion", &self.minor_version.to_string());
        }
        Ok(url)
    }

    pub async fn post_json(&self, url: &Url, body: &Value) -> APIResult<HttpReply> {
        self.send(Method::POST, url, Some(body)).await
    }

    pub async fn get(&self, url: &Url) -> APIResult<HttpReply> {
        self.send(Method::GET, url, None).await
    }

    async fn send(&self, method: Method, url: &Url, body: Option<&Value>) -> APIResult<HttpReply> {
        let mut token = self.tokens.access_token().await?;
        let mut refreshed = false;
        loop {
            let reply = self.send_throttled(&method, url, body, &token).await?;
            if !matches!(reply.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                return Ok(reply);
            }
            if refreshed {
                log::error!("{method} {} rejected again after token refresh", url.path());
                return Err(APIError::Unauthorized {
                    status: reply.status,
                    body: reply.body,
                });
            }
            log::warn!(
                "{method} {} answered {}, refreshing access token",
                url.path(),
                reply.status
            );
            token = self.tokens.refresh_if_stale(&token).await?;
            refreshed = true;
        }
    }

    async fn send_throttled(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        token: &str,
    ) -> APIResult<HttpReply> {
        let mut attempt = 0;
        loop {
            self.limiter.acquire().await;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token)
                .header(header::ACCEPT, "application/json")
                .timeout(self.timeout);
            if let Some(body) = body {
                request = request.json(body);
            }
            log::debug!("Sending {method} {}", url.path());

            let response = request.send().await?;
            let status = response.status();
            if status != StatusCode::TOO_MANY_REQUESTS {
                let body = response.text().await?;
                return Ok(HttpReply { status, body });
            }

            attempt += 1;
            if attempt > self.throttle.max_retries {
                log::error!("{method} {} still throttled after {attempt} attempts", url.path());
                return Err(APIError::Throttled { attempts: attempt });
            }
            let delay = retry_after(response.headers())
                .map_or_else(|| self.throttle.backoff(attempt), |d| d.min(self.throttle.max_delay));
            log::warn!(
                "{method} {} throttled, retry {attempt}/{} in {delay:?}",
                url.path(),
                self.throttle.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl std::fmt::Debug for QBContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QBContext")
            .field("environment", &self.environment)
            .field("company_id", &self.company_id)
            .field("base_url", &self.base_url.as_str())
            .field("minor_version", &self.minor_version)
            .finish_non_exhaustive()
    }
}
