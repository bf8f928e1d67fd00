//! Device bring-up and periodic drivers
//!
//! Devices come online one at a time: usage snapshot, connection, bootstrap,
//! then a heartbeat driver and a reconcile driver on the shared scheduler.
//! Both drivers of a device share its session through a mutex and skip their
//! tick when the other one holds it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::TelemetryProvider;
use crate::config::WellSimConfig;
use crate::model::{Device, UsageSnapshot};
use crate::scheduler::{Job, JobOutcome, JobStats, Scheduler};
use crate::session::{DeviceSession, SessionOptions};
use crate::store::DeviceStore;
use crate::usage::UsagePolicy;

pub type SharedSession = Arc<Mutex<DeviceSession<TcpStream>>>;

/// Timing and addressing used for every device
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub collector_address: String,
    pub connect_timeout: Duration,
    pub session: SessionOptions,
    pub heartbeat_interval: Duration,
    pub reconcile_interval: Duration,
    pub bringup_pause: Duration,
}

impl From<&WellSimConfig> for OrchestratorSettings {
    fn from(config: &WellSimConfig) -> Self {
        Self {
            collector_address: config.collector.address.clone(),
            connect_timeout: config.connect_timeout(),
            session: config.session_options(),
            heartbeat_interval: config.heartbeat_interval(),
            reconcile_interval: config.reconcile_interval(),
            bringup_pause: config.bringup_pause(),
        }
    }
}

/// Collaborators threaded down to every device
#[derive(Clone)]
pub struct SimContext {
    pub store: Arc<dyn DeviceStore>,
    pub telemetry: Arc<dyn TelemetryProvider>,
    pub policy: Arc<dyn UsagePolicy>,
}

/// Heartbeat/report driver for one device
pub struct HeartbeatDriver {
    sn: String,
    session: SharedSession,
}

#[async_trait]
impl Job for HeartbeatDriver {
    fn name(&self) -> String {
        format!("heartbeat:{}", self.sn)
    }

    async fn run(&self) -> JobOutcome {
        let Ok(mut session) = self.session.try_lock() else {
            debug!(sn = %self.sn, "Session busy, heartbeat skipped");
            return JobOutcome::Skipped;
        };
        // Failures are logged and counted by the session
        let _ = session.heartbeat_tick().await;
        JobOutcome::Completed
    }
}

/// Usage-reconciliation driver for one device
pub struct ReconcileDriver {
    sn: String,
    session: SharedSession,
    telemetry: Arc<dyn TelemetryProvider>,
    policy: Arc<dyn UsagePolicy>,
}

#[async_trait]
impl Job for ReconcileDriver {
    fn name(&self) -> String {
        format!("reconcile:{}", self.sn)
    }

    async fn run(&self) -> JobOutcome {
        let Ok(mut session) = self.session.try_lock() else {
            debug!(sn = %self.sn, "Session busy, reconcile skipped");
            return JobOutcome::Skipped;
        };
        match self.telemetry.current_usage(&self.sn).await {
            Ok(snapshot) => session.update_usage(&snapshot),
            Err(e) => {
                warn!(sn = %self.sn, kind = %e.kind(), "No usage data this cycle: {}", e);
                return JobOutcome::Completed;
            },
        }
        let _ = session.reconcile(self.policy.as_ref()).await;
        JobOutcome::Completed
    }
}

/// A device that made it online
pub struct DeviceHandle {
    pub sn: String,
    pub session: SharedSession,
    pub heartbeat: Arc<JobStats>,
    pub reconcile: Arc<JobStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BringUpReport {
    pub online: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    context: SimContext,
    scheduler: Scheduler,
    devices: Vec<DeviceHandle>,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, context: SimContext) -> Self {
        Self {
            settings,
            context,
            scheduler: Scheduler::new(),
            devices: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    /// Bring `devices` online one by one and schedule their drivers
    ///
    /// Only a failed connection keeps a device off the schedule.
    pub async fn bring_up(&mut self, devices: Vec<Device>) -> BringUpReport {
        let mut report = BringUpReport::default();
        let total = devices.len();
        info!("Bringing {} devices online", total);

        for (index, device) in devices.into_iter().enumerate() {
            let sn = device.sn.clone();
            match self.bring_up_one(device).await {
                Some(handle) => {
                    self.devices.push(handle);
                    report.online += 1;
                },
                None => report.failed += 1,
            }
            if index + 1 < total && !self.settings.bringup_pause.is_zero() {
                debug!(sn = %sn, "Pausing {:?} before next device", self.settings.bringup_pause);
                tokio::time::sleep(self.settings.bringup_pause).await;
            }
        }

        info!(
            "Bring-up finished: {} online, {} failed",
            report.online, report.failed
        );
        report
    }

    async fn bring_up_one(&mut self, device: Device) -> Option<DeviceHandle> {
        let sn = device.sn.clone();
        if !device.registration_consistent() {
            warn!(sn = %sn, "Device marked registered without a register number");
        }

        let snapshot = match self.context.telemetry.current_usage(&sn).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(sn = %sn, kind = %e.kind(), "Initial usage unavailable: {}", e);
                UsageSnapshot::default()
            },
        };

        let mut session = match DeviceSession::connect(
            device,
            &self.settings.collector_address,
            self.settings.connect_timeout,
            self.context.store.clone(),
            self.settings.session,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(sn = %sn, kind = %e.kind(), "Device not scheduled: {}", e);
                return None;
            },
        };
        session.update_usage(&snapshot);
        // Bootstrap failures are retried by the heartbeat driver
        let _ = session.bootstrap().await;
        info!(sn = %sn, state = %session.state(), "Device online");

        let session = Arc::new(Mutex::new(session));
        let heartbeat = self.scheduler.schedule(
            Arc::new(HeartbeatDriver {
                sn: sn.clone(),
                session: session.clone(),
            }),
            self.settings.heartbeat_interval,
        );
        let reconcile = self.scheduler.schedule(
            Arc::new(ReconcileDriver {
                sn: sn.clone(),
                session: session.clone(),
                telemetry: self.context.telemetry.clone(),
                policy: self.context.policy.clone(),
            }),
            self.settings.reconcile_interval,
        );

        Some(DeviceHandle {
            sn,
            session,
            heartbeat,
            reconcile,
        })
    }

    /// Stop all drivers
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        for handle in &self.devices {
            debug!(
                sn = %handle.sn,
                heartbeat_fired = handle.heartbeat.fired(),
                heartbeat_skipped = handle.heartbeat.skipped(),
                reconcile_fired = handle.reconcile.fired(),
                reconcile_skipped = handle.reconcile.skipped(),
                "Driver summary"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::net::TcpListener;

    fn device() -> Device {
        Device {
            id: 1,
            sn: "JG0001".to_string(),
            number: 1,
            area_code: 410_102_003_004,
            town: String::new(),
            village: String::new(),
            longitude: 113.625_368,
            latitude: 34.7466,
            register_number: String::new(),
            registered: false,
            uploaded_water: 0,
            uploaded_electric: 0,
        }
    }

    #[tokio::test]
    async fn test_busy_session_reports_skip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let session = DeviceSession::connect(
            device(),
            &address,
            Duration::from_secs(1),
            Arc::new(MemoryStore::default()),
            SessionOptions::default(),
        )
        .await
        .unwrap();
        let driver = HeartbeatDriver {
            sn: "JG0001".to_string(),
            session: Arc::new(Mutex::new(session)),
        };

        {
            let _held = driver.session.lock().await;
            assert_eq!(driver.run().await, JobOutcome::Skipped);
        }
        // Not bootstrapped: nothing to send, but the tick ran
        assert_eq!(driver.run().await, JobOutcome::Completed);
    }
}
