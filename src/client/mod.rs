use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::{Fault, QBErrorResponse};

mod context;
pub use context::{QBContext, ThrottlePolicy};

/// Status and raw body of a QuickBooks reply after throttling and auth
/// retries were handled.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: String,
}

impl HttpReply {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// The fault envelope, when the body carries one.
    #[must_use]
    pub fn fault(&self) -> Option<Fault> {
        self.json::<QBErrorResponse>().ok()?.fault
    }

    /// Text kept as failure reason for a non-success reply.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match self.fault() {
            Some(fault) => format!("HTTP {}: {}", self.status.as_u16(), fault.reason()),
            None => format!("HTTP {}: {}", self.status.as_u16(), self.body),
        }
    }
}

/// Path segment QuickBooks uses for an entity's create endpoint.
pub(crate) fn entity_path(entity: &str) -> String {
    entity.to_ascii_lowercase()
}
