//! Current usage lookup

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{build_client, join_url};
use crate::error::{Result, WellSimError};
use crate::model::UsageSnapshot;

#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Cumulative usage reported for the device with serial `sn`
    async fn current_usage(&self, sn: &str) -> Result<UsageSnapshot>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentData {
    #[serde(default)]
    data_time: String,
    #[serde(default)]
    water_sum: f64,
    #[serde(default)]
    electric_sum: f64,
}

impl From<CurrentData> for UsageSnapshot {
    fn from(data: CurrentData) -> Self {
        UsageSnapshot {
            data_time: data.data_time,
            water_sum: to_hundredths(data.water_sum),
            electric_sum: to_hundredths(data.electric_sum),
        }
    }
}

fn to_hundredths(value: f64) -> u64 {
    (value.max(0.0) * 100.0).round() as u64
}

/// `GET {base}/well_irrigations/data/current/{sn}` authorized by a `token` header
pub struct HttpTelemetryProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTelemetryProvider {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl TelemetryProvider for HttpTelemetryProvider {
    async fn current_usage(&self, sn: &str) -> Result<UsageSnapshot> {
        let url = join_url(&self.base_url, &format!("well_irrigations/data/current/{}", sn));
        let response = self
            .client
            .get(&url)
            .header("token", &self.token)
            .send()
            .await
            .map_err(|e| WellSimError::Telemetry(format!("request for {} failed: {}", sn, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WellSimError::Telemetry(format!(
                "request for {} returned {}",
                sn, status
            )));
        }

        let data: CurrentData = response
            .json()
            .await
            .map_err(|e| WellSimError::Telemetry(format!("malformed usage for {}: {}", sn, e)))?;
        Ok(data.into())
    }
}
