//! Command line and logging bootstrap

use std::path::PathBuf;

use clap::Parser;
use common::logging::{LogConfig, WorkerGuard};

use crate::config::WellSimConfig;

pub const SERVICE_NAME: &str = "wellsim";

/// Command-line arguments for wellsim
#[derive(Parser, Debug, Clone)]
#[command(
    name = "wellsim",
    version = env!("CARGO_PKG_VERSION"),
    about = "Irrigation well metering device simulator",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "WELLSIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Validation mode - load and validate configuration, then exit
    #[arg(long)]
    pub validate: bool,

    /// Simulate only these device ids (repeatable); overrides `devices.ids`
    #[arg(short = 'd', long = "device")]
    pub devices: Vec<i64>,
}

impl Args {
    /// Fold command-line overrides into the loaded configuration
    pub fn apply(&self, config: &mut WellSimConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if !self.devices.is_empty() {
            config.devices.ids = self.devices.clone();
        }
    }
}

/// Install the console (and optional file) subscriber
///
/// The returned guard must live until the process exits.
pub fn initialize_logging(config: &WellSimConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let log_config = LogConfig {
        service_name: SERVICE_NAME.to_string(),
        log_dir: config.logging.dir.clone(),
        console_level: common::logging::parse_level(&config.logging.level),
        file_enabled: config.logging.file_enabled,
    };
    common::logging::init_with_config(log_config)
}
