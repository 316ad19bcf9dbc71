use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Access/refresh token pair currently in use.
///
/// `expires_at` is only known once a refresh went through this process;
/// tokens handed in from the environment start without one and are renewed
/// reactively on the first 401.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }

    /// True when the token is known to expire within `skew` from now.
    #[must_use]
    pub fn expires_within(&self, skew: chrono::Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Utc::now() + skew >= expires_at)
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct AuthTokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    #[allow(unused)]
    pub x_refresh_token_expires_in: Option<i64>,
}

/// Receives every rotated token pair so it can outlive the process.
///
/// Intuit invalidates the previous refresh token once a new one is issued, so
/// losing a rotated value means re-running the consent flow.
pub trait TokenSink: Send + Sync {
    fn persist(&self, state: &TokenState) -> std::io::Result<()>;
}

/// Writes `QBO_ACCESS_TOKEN` / `QBO_REFRESH_TOKEN` back into a dotenv file,
/// replacing existing lines and appending missing ones.
#[derive(Debug, Clone)]
pub struct EnvFileSink {
    path: PathBuf,
}

impl EnvFileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl TokenSink for EnvFileSink {
    fn persist(&self, state: &TokenState) -> std::io::Result<()> {
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let updated = upsert_env_lines(
            &existing,
            &[
                ("QBO_ACCESS_TOKEN", state.access_token.as_str()),
                ("QBO_REFRESH_TOKEN", state.refresh_token.as_str()),
            ],
        );
        std::fs::write(&self.path, updated)
    }
}

fn upsert_env_lines(contents: &str, pairs: &[(&str, &str)]) -> String {
    let mut seen = vec![false; pairs.len()];
    let mut out = String::with_capacity(contents.len() + 128);
    for line in contents.lines() {
        let replacement = pairs
            .iter()
            .position(|(key, _)| line.starts_with(&format!("{key}=")));
        match replacement {
            Some(i) => {
                seen[i] = true;
                out.push_str(&format!("{}={}\n", pairs[i].0, pairs[i].1));
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    for (i, (key, value)) in pairs.iter().enumerate() {
        if !seen[i] {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}
