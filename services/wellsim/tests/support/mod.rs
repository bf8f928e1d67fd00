//! Shared fixtures for wellsim integration tests
//!
//! `MockCollector` is a loopback TCP server that records every request frame
//! and answers through a scripted responder.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use wellsim::api::TelemetryProvider;
use wellsim::protocol::{encode_reply, find_frame, FunctionCode};
use wellsim::{Card, Device, UsageSnapshot, WellSimError};

pub const REGISTER_NUMBER: [u8; 16] = [
    0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF,
];
pub const AREA_CODE: u64 = 410_102_003_004;
pub const CARD_REGISTER_NUMBER: &str = "a1b2c3d4";

type Responder = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// Scripted collector on 127.0.0.1
pub struct MockCollector {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockCollector {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let responder: Arc<Responder> = Arc::new(responder);

        let recorded = frames.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, responder.clone(), recorded.clone()));
            }
        });

        Self { addr, frames, task }
    }

    /// Collector answering every request except heartbeats with a well-formed reply
    pub async fn cooperative() -> Self {
        Self::start(|frame| {
            let function = function_of(frame);
            (function != 0x85).then(|| standard_reply(function, 0))
        })
        .await
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn functions(&self) -> Vec<u8> {
        self.frames().iter().map(|f| function_of(f)).collect()
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, responder: Arc<Responder>, frames: Arc<Mutex<Vec<Vec<u8>>>>) {
    let mut buf = BytesMut::with_capacity(256);
    loop {
        while let Some((start, end)) = find_frame(&buf) {
            let frame = buf.split_to(end)[start..].to_vec();
            frames.lock().unwrap().push(frame.clone());
            if let Some(reply) = responder(&frame) {
                if socket.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
        buf.reserve(256);
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {},
        }
    }
}

/// Function byte of a request frame
///
/// Registration requests carry the 6-byte area code and no payload (16 bytes
/// in total); every other request is addressed by the 16-byte register number.
pub fn function_of(frame: &[u8]) -> u8 {
    if frame.len() == 16 {
        frame[13]
    } else {
        frame[23]
    }
}

/// Payload of a register-number addressed request
pub fn payload_of(frame: &[u8]) -> &[u8] {
    &frame[24..frame.len() - 2]
}

/// Reply for `function`; `card_status` is used for search-card
pub fn standard_reply(function: u8, card_status: u8) -> Vec<u8> {
    let Some(code) = FunctionCode::from_code(function) else {
        return Vec::new();
    };
    let reply = match code {
        FunctionCode::Register => encode_reply(code, &REGISTER_NUMBER),
        FunctionCode::SearchCard => encode_reply(code, &[card_status]),
        _ => encode_reply(code, &[]),
    };
    reply.to_vec()
}

pub fn device(id: i64, registered: bool, uploaded_water: u64) -> Device {
    Device {
        id,
        sn: format!("JG{:04}", id),
        number: id as u32,
        area_code: AREA_CODE,
        town: "Dongzhao".to_string(),
        village: "Beiliu".to_string(),
        longitude: 113.625_368,
        latitude: 34.7466,
        register_number: if registered {
            hex::encode(REGISTER_NUMBER)
        } else {
            String::new()
        },
        registered,
        uploaded_water,
        uploaded_electric: 0,
    }
}

pub fn card() -> Card {
    Card {
        id: 1,
        area_code: AREA_CODE,
        card_number: "0001".to_string(),
        name: "operator".to_string(),
        card_register_number: CARD_REGISTER_NUMBER.to_string(),
        balance: 10_000,
    }
}

pub fn usage(water_sum: u64, electric_sum: u64) -> UsageSnapshot {
    UsageSnapshot {
        data_time: "2024-07-09 18:00:00".to_string(),
        water_sum,
        electric_sum,
    }
}

/// Telemetry returning a fixed snapshot for every device
pub struct StaticTelemetry(pub UsageSnapshot);

#[async_trait]
impl TelemetryProvider for StaticTelemetry {
    async fn current_usage(&self, _sn: &str) -> wellsim::Result<UsageSnapshot> {
        Ok(self.0.clone())
    }
}

/// Telemetry that always fails
pub struct UnavailableTelemetry;

#[async_trait]
impl TelemetryProvider for UnavailableTelemetry {
    async fn current_usage(&self, sn: &str) -> wellsim::Result<UsageSnapshot> {
        Err(WellSimError::Telemetry(format!("no data for {}", sn)))
    }
}

/// An address nothing listens on
pub async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
