//! Runtime configuration read from the process environment (and `.env`).
//!
//! | Variable | Default |
//! |---|---|
//! | `QBO_ACCESS_TOKEN`, `QBO_REFRESH_TOKEN` | required |
//! | `QBO_REALM_ID`, `QBO_CLIENT_ID`, `QBO_CLIENT_SECRET` | required |
//! | `QBO_ENVIRONMENT` | `sandbox` |
//! | `SOURCE_SCHEMA` | `dbo` |
//! | `MAPPING_SCHEMA` | `porter_entities_mapping` |
//! | `MAPPING_DB_DIR` | in-memory mapping store |
//! | `QBO_CONCURRENCY` | 6 |
//! | `QBO_MAX_RPS` | 8 |
//! | `QBO_TIMEOUT_SEC` | 40 |
//! | `QBO_MINOR_VERSION` | 65 |
use std::{path::PathBuf, str::FromStr, time::Duration};

use intuit_oauth::{ClientCredentials, TokenState};

use crate::Environment;

pub const DEFAULT_SOURCE_SCHEMA: &str = "dbo";
pub const DEFAULT_MAPPING_SCHEMA: &str = "porter_entities_mapping";
pub const DEFAULT_CONCURRENCY: usize = 6;
pub const DEFAULT_MAX_RPS: f64 = 8.0;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(40);
pub const DEFAULT_MINOR_VERSION: u32 = 65;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone)]
pub struct PorterConfig {
    pub access_token: String,
    pub refresh_token: String,
    pub realm_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub environment: Environment,
    pub source_schema: String,
    pub mapping_schema: String,
    pub mapping_db_dir: Option<PathBuf>,
    pub concurrency: usize,
    pub max_rps: f64,
    pub timeout: Duration,
    pub minor_version: u32,
}

impl PorterConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenv::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        Ok(Self {
            access_token: required("QBO_ACCESS_TOKEN")?,
            refresh_token: required("QBO_REFRESH_TOKEN")?,
            realm_id: required("QBO_REALM_ID")?,
            client_id: required("QBO_CLIENT_ID")?,
            client_secret: required("QBO_CLIENT_SECRET")?,
            environment: parse_or("QBO_ENVIRONMENT", get("QBO_ENVIRONMENT"), Environment::SANDBOX)?,
            source_schema: get("SOURCE_SCHEMA").unwrap_or_else(|| DEFAULT_SOURCE_SCHEMA.into()),
            mapping_schema: get("MAPPING_SCHEMA").unwrap_or_else(|| DEFAULT_MAPPING_SCHEMA.into()),
            mapping_db_dir: get("MAPPING_DB_DIR").map(PathBuf::from),
            concurrency: parse_or("QBO_CONCURRENCY", get("QBO_CONCURRENCY"), DEFAULT_CONCURRENCY)?
                .max(1),
            max_rps: parse_or("QBO_MAX_RPS", get("QBO_MAX_RPS"), DEFAULT_MAX_RPS)?,
            timeout: Duration::from_secs(parse_or(
                "QBO_TIMEOUT_SEC",
                get("QBO_TIMEOUT_SEC"),
                DEFAULT_TIMEOUT.as_secs(),
            )?),
            minor_version: parse_or(
                "QBO_MINOR_VERSION",
                get("QBO_MINOR_VERSION"),
                DEFAULT_MINOR_VERSION,
            )?,
        })
    }

    #[must_use]
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials::new(&self.client_id, &self.client_secret)
    }

    #[must_use]
    pub fn initial_tokens(&self) -> TokenState {
        TokenState::new(&self.access_token, &self.refresh_token)
    }
}

fn parse_or<T: FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

impl std::fmt::Debug for PorterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PorterConfig")
            .field("realm_id", &self.realm_id)
            .field("environment", &self.environment)
            .field("source_schema", &self.source_schema)
            .field("mapping_schema", &self.mapping_schema)
            .field("mapping_db_dir", &self.mapping_db_dir)
            .field("concurrency", &self.concurrency)
            .field("max_rps", &self.max_rps)
            .field("timeout", &self.timeout)
            .field("minor_version", &self.minor_version)
            .finish_non_exhaustive()
    }
}
