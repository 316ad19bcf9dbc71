use std::sync::LazyLock;

use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Errors surfaced by a single HTTP exchange with QuickBooks.
///
/// These never escape a record's processing: the posters turn every variant
/// into a failure reason for the rows involved.
#[derive(Debug, thiserror::Error)]
pub enum APIError {
    #[error("reqwest error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token refresh failed: {0}")]
    Auth(#[from] intuit_oauth::AuthError),
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("throttled (HTTP 429) after {attempts} attempts")]
    Throttled { attempts: u32 },
    #[error("HTTP {status}: {body}")]
    BadRequest { status: StatusCode, body: String },
    #[error("still unauthorized after token refresh ({status}): {body}")]
    Unauthorized { status: StatusCode, body: String },
}

pub type APIResult<T> = Result<T, APIError>;

/// Infrastructure failures that stop a migration run.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("mapping store error: {0}")]
    Store(#[from] StoreError),
    #[error("source read failed: {0}")]
    Source(String),
    #[error("QuickBooks client error: {0}")]
    Api(#[from] APIError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QBErrorResponse {
    #[serde(rename = "Fault")]
    pub fault: Option<Fault>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    #[serde(rename = "type", default)]
    pub r#type: String,
    #[serde(rename = "Error", default)]
    pub error: Vec<FaultError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultError {
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Detail", default)]
    pub detail: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub element: Option<String>,
}

impl Fault {
    /// First error of the envelope, which is the one QuickBooks reports on.
    #[must_use]
    pub fn primary(&self) -> Option<&FaultError> {
        self.error.first()
    }

    /// Human readable reason stored in `Failure_Reason`.
    #[must_use]
    pub fn reason(&self) -> String {
        match self.primary() {
            Some(e) if e.detail.is_empty() => format!("[{}] {}", e.code, e.message),
            Some(e) => format!("[{}] {} | {}", e.code, e.message, e.detail),
            None if self.r#type.is_empty() => "Unknown fault".to_string(),
            None => format!("{} without error details", self.r#type),
        }
    }
}

impl std::fmt::Display for FaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.message, self.detail)
    }
}

/// What a poster should do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The object already exists in QuickBooks; look it up and mark `Exists`.
    Duplicate,
    /// A string field is too long; run the fallback transform chain.
    LengthLimit,
    RateLimit,
    Auth,
    Other,
}

// QuickBooks reports these codes inconsistently across entities and minor
// versions. 6000 is a generic business validation code and is classified by
// its text.
const DUPLICATE_CODES: &[&str] = &["6240", "6140"];
const THROTTLE_CODES: &[&str] = &["003001", "3001", "429"];
const AUTH_CODES: &[&str] = &["100", "3100", "3200"];

static DUPLICATE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)duplicate (name|document number|account number)",
        r"|already (exists|using (this|number|name))",
        r"|name supplied already exists|another .* is already using",
    ))
    .expect("duplicate fault pattern compiles")
});

static LENGTH_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)more than \d+ characters|too long",
        r"|(max(imum)?|exceeds?( the)?) length|string length",
    ))
    .expect("length fault pattern compiles")
});

static THROTTLE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)throttl|rate limit|too many requests").expect("throttle pattern compiles")
});

static AUTH_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)authenticat|authoriz|invalid token|token expired")
        .expect("auth pattern compiles")
});

/// Maps a QuickBooks fault error onto the recovery the posters apply.
#[must_use]
pub fn classify_fault(error: &FaultError) -> FaultKind {
    let code = error.code.trim();
    let text = format!("{} {}", error.message, error.detail);

    if DUPLICATE_CODES.contains(&code) || DUPLICATE_TEXT.is_match(&text) {
        return FaultKind::Duplicate;
    }
    if LENGTH_TEXT.is_match(&text) {
        return FaultKind::LengthLimit;
    }
    if THROTTLE_CODES.contains(&code) || THROTTLE_TEXT.is_match(&text) {
        return FaultKind::RateLimit;
    }
    if AUTH_CODES.contains(&code) || AUTH_TEXT.is_match(&text) {
        return FaultKind::Auth;
    }
    FaultKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault_error(code: &str, message: &str, detail: &str) -> FaultError {
        FaultError {
            message: message.into(),
            detail: detail.into(),
            code: code.into(),
            element: None,
        }
    }

    #[test]
    fn duplicate_codes_and_messages() {
        assert_eq!(
            classify_fault(&fault_error("6240", "Duplicate Name Exists Error", "")),
            FaultKind::Duplicate
        );
        assert_eq!(
            classify_fault(&fault_error("6140", "Duplicate Document Number Error", "")),
            FaultKind::Duplicate
        );
        assert_eq!(
            classify_fault(&fault_error(
                "6000",
                "A business validation error has occurred while processing your request",
                "Business Validation Error: Another account is already using this number."
            )),
            FaultKind::Duplicate
        );
    }

    #[test]
    fn code_6000_with_length_text_is_a_length_fault() {
        let error = fault_error(
            "6000",
            "A business validation error has occurred while processing your request",
            "Business Validation Error: Name cannot be more than 100 characters long.",
        );
        assert_eq!(classify_fault(&error), FaultKind::LengthLimit);
    }

    #[test]
    fn other_faults() {
        assert_eq!(
            classify_fault(&fault_error(
                "610",
                "Object Not Found",
                "Something you're trying to use has been made inactive.",
            )),
            FaultKind::Other
        );
        assert_eq!(
            classify_fault(&fault_error("3200", "message=AuthenticationFailed", "")),
            FaultKind::Auth
        );
        assert_eq!(
            classify_fault(&fault_error("003001", "ThrottleExceeded", "")),
            FaultKind::RateLimit
        );
    }

    #[test]
    fn parses_fault_envelope() {
        let body = r#"{
          "Fault": {
            "Error": [
              {
                "Message": "Duplicate Name Exists Error",
                "Detail": "The name supplied already exists. : Id=12345",
                "code": "6240",
                "element": ""
              }
            ],
            "type": "ValidationFault"
          },
          "time": "2024-01-01T10:00:00.000-07:00"
        }"#;
        let response: QBErrorResponse = serde_json::from_str(body).unwrap();
        let fault = response.fault.unwrap();
        assert_eq!(fault.primary().unwrap().code, "6240");
        assert_eq!(
            fault.reason(),
            "[6240] Duplicate Name Exists Error | The name supplied already exists. : Id=12345"
        );
    }

    #[test]
    fn empty_fault_has_a_reason() {
        assert_eq!(Fault::default().reason(), "Unknown fault");
    }
}
