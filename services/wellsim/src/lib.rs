//! Irrigation Well Simulator Library (wellsim)
//!
//! Simulates a fleet of metered irrigation-well controllers that talk to a
//! collector over a DLT645-style binary protocol, one TCP connection per
//! device.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Orchestrator   │───►│  DeviceSession  │───►│   Frame codec   │
//! │ (bring-up)      │    │ (conversations) │    │ (BCD / CRC-8)   │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Scheduler     │    │   DeviceFsm     │
//! │ (overlap-skip)  │    │ (table-driven)  │
//! └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`protocol`**: frame assembly and reply parsing, pure
//! - **`fsm`**: transition table returning entry effects, pure
//! - **`session`**: write-then-await-reply conversations and effect execution
//! - **`scheduler`**: periodic jobs that skip a tick while the previous run is busy
//! - **`orchestrator`**: serialized device bring-up and per-device drivers
//! - **`store`**, **`api`**: persisted records and the HTTP collaborators
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wellsim::api::HttpTelemetryProvider;
//! use wellsim::config::WellSimConfig;
//! use wellsim::orchestrator::{Orchestrator, OrchestratorSettings, SimContext};
//! use wellsim::store::{DeviceStore, SqliteStore};
//!
//! # async fn run() -> wellsim::Result<()> {
//! let config = WellSimConfig::load(None)?;
//! let store = Arc::new(SqliteStore::open(&config.database.path).await?);
//! let telemetry = HttpTelemetryProvider::new(&config.api.base_url, "", config.request_timeout())?;
//! let devices = store.list_devices(&config.devices.ids).await?;
//!
//! let context = SimContext {
//!     store,
//!     telemetry: Arc::new(telemetry),
//!     policy: config.usage_policy(),
//! };
//! let mut orchestrator = Orchestrator::new(OrchestratorSettings::from(&config), context);
//! orchestrator.bring_up(devices).await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod fsm;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod usage;

pub use error::{ErrorKind, Result, WellSimError};
pub use fsm::{DeviceEvent, DeviceFsm, DeviceState, Effect};
pub use model::{Card, Device, UsageSnapshot};
pub use session::{DeviceSession, SessionOptions};
