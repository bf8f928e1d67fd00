//! Login against the platform backend

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{build_client, join_url};
use crate::error::{Result, WellSimError};

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, credentials: &Credentials) -> Result<String>;
}

/// `POST {base}/login` with a JSON credential body
pub struct HttpTokenProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self, credentials: &Credentials) -> Result<String> {
        let url = join_url(&self.base_url, "login");
        let response = self
            .client
            .post(&url)
            .json(credentials)
            .send()
            .await
            .map_err(|e| WellSimError::Auth(format!("login request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WellSimError::Auth(format!("login rejected: {}", status)));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| WellSimError::Auth(format!("malformed login response: {}", e)))?;
        info!(user = %credentials.username, "Login succeeded");
        Ok(body.token)
    }
}
