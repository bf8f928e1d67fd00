//! Service configuration
//!
//! Layers, lowest priority first: compiled-in defaults, the YAML file
//! (`config/wellsim.yaml` unless a path is given) and `WELLSIM_`-prefixed
//! environment variables with `__` separating nested keys
//! (`WELLSIM_COLLECTOR__ADDRESS=10.0.0.5:8888`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::api::Credentials;
use crate::error::{Result, WellSimError};
use crate::protocol::ReplyLayout;
use crate::session::SessionOptions;
use crate::usage::{ExactUsagePolicy, RandomizedUsagePolicy, UsagePolicy};

pub const DEFAULT_CONFIG_PATH: &str = "config/wellsim.yaml";
pub const ENV_PREFIX: &str = "WELLSIM_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WellSimConfig {
    pub collector: CollectorConfig,
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
    pub devices: DeviceSelection,
    pub usage: UsageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// `host:port` of the collector
    pub address: String,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    /// Byte offset of the function code in reply frames
    pub reply_function_offset: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8888".to_string(),
            connect_timeout_ms: 5000,
            reply_timeout_ms: 5000,
            reply_function_offset: ReplyLayout::default().function_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://101.34.116.221:8005".to_string(),
            username: String::new(),
            password: String::new(),
            request_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/wellsim.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub heartbeat_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Pause between bringing consecutive devices online
    pub bringup_pause_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 20,
            reconcile_interval_secs: 37,
            bringup_pause_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelection {
    /// Device ids to simulate; empty selects every stored device
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsagePolicyKind {
    #[default]
    Randomized,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub policy: UsagePolicyKind,
    pub max_water_per_cycle: u64,
    pub min_water_per_cycle: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            policy: UsagePolicyKind::Randomized,
            max_water_per_cycle: 6000,
            min_water_per_cycle: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            file_enabled: false,
        }
    }
}

impl WellSimConfig {
    /// Load from defaults, the YAML file and the environment
    ///
    /// A missing default file is fine; an explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(WellSimConfig::default()));
        let figment = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(WellSimError::config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                figment.merge(Yaml::file(path))
            },
            None => figment.merge(Yaml::file(DEFAULT_CONFIG_PATH)),
        };
        let config: WellSimConfig = figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.collector.address.trim().is_empty() {
            return Err(WellSimError::config("collector.address must not be empty"));
        }
        let non_zero = [
            ("collector.connect_timeout_ms", self.collector.connect_timeout_ms),
            ("collector.reply_timeout_ms", self.collector.reply_timeout_ms),
            ("api.request_timeout_ms", self.api.request_timeout_ms),
            ("schedule.heartbeat_interval_secs", self.schedule.heartbeat_interval_secs),
            ("schedule.reconcile_interval_secs", self.schedule.reconcile_interval_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(WellSimError::config(format!("{} must be greater than zero", key)));
            }
        }
        // Shortest reply: 0x68 LEN 0x68 CTRL, then the function code
        if self.collector.reply_function_offset < 4 {
            return Err(WellSimError::config(
                "collector.reply_function_offset must be at least 4",
            ));
        }
        if self.usage.policy == UsagePolicyKind::Randomized
            && self.usage.min_water_per_cycle > self.usage.max_water_per_cycle
        {
            return Err(WellSimError::config(
                "usage.min_water_per_cycle must not exceed usage.max_water_per_cycle",
            ));
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            reply_timeout: Duration::from_millis(self.collector.reply_timeout_ms),
            reply_layout: ReplyLayout {
                function_offset: self.collector.reply_function_offset,
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.collector.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.api.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.heartbeat_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.reconcile_interval_secs)
    }

    pub fn bringup_pause(&self) -> Duration {
        Duration::from_millis(self.schedule.bringup_pause_ms)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.api.username.clone(),
            password: self.api.password.clone(),
        }
    }

    pub fn usage_policy(&self) -> Arc<dyn UsagePolicy> {
        match self.usage.policy {
            UsagePolicyKind::Randomized => Arc::new(RandomizedUsagePolicy::new(
                self.usage.min_water_per_cycle,
                self.usage.max_water_per_cycle,
            )),
            UsagePolicyKind::Exact => Arc::new(ExactUsagePolicy),
        }
    }
}
