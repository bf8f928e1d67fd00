//! HTTP collaborators of the platform backend
//!
//! Login yields a token once per run; the telemetry client sends it with
//! every usage lookup.

pub mod auth;
pub mod telemetry;

pub use auth::{Credentials, HttpTokenProvider, TokenProvider};
pub use telemetry::{HttpTelemetryProvider, TelemetryProvider};

use std::time::Duration;

use crate::error::{Result, WellSimError};

/// Shared reqwest client with a bounded request timeout
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| WellSimError::config(format!("failed to build HTTP client: {}", e)))
}

/// Join a base URL and a path without doubling the separator
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
