/*
 * Batch-upload engine for migrating records into QuickBooks Online.
 *
 * For more information on the QuickBooks API, you can check out their documentation at:
 * https://developer.intuit.com/app/developer/qbo/docs/develop
 *
 * The engine seeds a per-entity mapping table, builds payloads through an
 * `EntityMigrator`, posts them through the `/batch` endpoint with a
 * single-record fallback, and tracks every row through
 * Ready -> Success | Exists | Failed | Skipped.
 */
#![warn(clippy::pedantic)]

pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod entity;
pub mod error;
pub mod functions;
pub mod hierarchy;
pub mod limiter;
pub mod orchestrator;
pub mod recovery;
pub mod store;

pub use client::QBContext;
pub use error::{classify_fault, APIError, APIResult, FaultKind, MigrationError};
pub use orchestrator::{shutdown_on_ctrl_c, MigrationSummary, Migrator};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Environment {
    PRODUCTION,
    #[default]
    SANDBOX,
}

impl Environment {
    #[inline]
    #[must_use]
    pub fn endpoint_url(&self) -> &'static str {
        match self {
            Environment::PRODUCTION => "https://quickbooks.api.intuit.com/v3/",
            Environment::SANDBOX => "https://sandbox-quickbooks.api.intuit.com/v3/",
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::PRODUCTION),
            "sandbox" | "development" | "dev" => Ok(Environment::SANDBOX),
            other => Err(format!("unknown QuickBooks environment {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_environment_names() {
        assert_eq!("Production".parse(), Ok(Environment::PRODUCTION));
        assert_eq!(" sandbox ".parse(), Ok(Environment::SANDBOX));
        assert!("staging".parse::<Environment>().is_err());
    }
}
