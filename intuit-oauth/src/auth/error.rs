use reqwest::StatusCode;

/// Errors produced while exchanging or persisting OAuth tokens.
///
/// None of these are fatal to the process; callers are expected to fail the
/// record or chunk they were working on and move on.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token endpoint rejected refresh ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("token endpoint answered without an access_token")]
    NoAccessToken,
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid token url: {0}")]
    Url(#[from] url::ParseError),
}

impl AuthError {
    /// Whether the identity provider itself refused the credentials, as
    /// opposed to a transport problem.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::NoAccessToken | Self::NoRefreshToken)
    }
}
