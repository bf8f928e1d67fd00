//! Per-device session
//!
//! Owns the device's connection and state machine. A conversation writes one
//! request, waits for the reply up to the reply timeout, maps the reply's
//! function code onto an FSM event and fires it; entry effects of the new
//! state may start the next conversation inline.
//!
//! Failures abort the current chain. The device keeps whatever state it had
//! reached, and the failed entry conversation is retried on the next
//! heartbeat tick.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{Local, NaiveDateTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, Result, WellSimError};
use crate::fsm::{DeviceEvent, DeviceFsm, DeviceState, Effect};
use crate::model::{Card, Device, UsageSnapshot};
use crate::protocol::{
    find_frame, order_number, Address, CardStatus, FunctionCode, ReplyFrame, ReplyLayout, Request,
};
use crate::store::DeviceStore;
use crate::usage::UsagePolicy;

/// Conversation knobs shared by every session
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub reply_timeout: Duration,
    pub reply_layout: ReplyLayout,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            reply_layout: ReplyLayout::default(),
        }
    }
}

/// Per-session counters, split by failure category
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationStats {
    pub frames_sent: u64,
    pub replies: u64,
    /// Frames dropped because they did not answer the request in flight
    pub discarded_replies: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
    pub illegal_transitions: u64,
    pub decode_errors: u64,
    pub persistence_errors: u64,
    pub collaborator_errors: u64,
}

impl ConversationStats {
    fn count(&mut self, err: &WellSimError) {
        match err.kind() {
            ErrorKind::Transport => {
                if matches!(err, WellSimError::Timeout(_)) {
                    self.timeouts += 1;
                } else {
                    self.transport_errors += 1;
                }
            },
            ErrorKind::IllegalTransition => self.illegal_transitions += 1,
            ErrorKind::Decode | ErrorKind::Config => self.decode_errors += 1,
            ErrorKind::Persistence => self.persistence_errors += 1,
            ErrorKind::Collaborator => self.collaborator_errors += 1,
        }
    }
}

pub struct DeviceSession<S = TcpStream> {
    device: Device,
    fsm: DeviceFsm,
    stream: S,
    rx: BytesMut,
    store: Arc<dyn DeviceStore>,
    options: SessionOptions,

    card: Option<Card>,
    /// Per-cycle deltas reported by open-well data and close-well
    water: u64,
    electric: u64,
    /// Cumulative usage observed by telemetry
    water_sum: u64,
    electric_sum: u64,
    order_count: u32,
    order_number: Option<u64>,
    window: Option<(NaiveDateTime, NaiveDateTime)>,
    started_cycles: u32,
    /// Entry conversation that failed and still has to run
    pending_entry: Option<FunctionCode>,
    stats: ConversationStats,
}

impl DeviceSession<TcpStream> {
    /// Open the device's dedicated collector connection
    pub async fn connect(
        device: Device,
        address: &str,
        connect_timeout: Duration,
        store: Arc<dyn DeviceStore>,
        options: SessionOptions,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                WellSimError::connection(format!(
                    "connect to {} timed out after {:?}",
                    address, connect_timeout
                ))
            })?
            .map_err(|e| WellSimError::connection(format!("connect to {} failed: {}", address, e)))?;
        stream.set_nodelay(true)?;
        debug!(sn = %device.sn, "Connected to collector {}", address);
        Ok(Self::new(device, stream, store, options))
    }
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        device: Device,
        stream: S,
        store: Arc<dyn DeviceStore>,
        options: SessionOptions,
    ) -> Self {
        Self {
            device,
            fsm: DeviceFsm::new(),
            stream,
            rx: BytesMut::with_capacity(256),
            store,
            options,
            card: None,
            water: 0,
            electric: 0,
            water_sum: 0,
            electric_sum: 0,
            order_count: 0,
            order_number: None,
            window: None,
            started_cycles: 0,
            pending_entry: None,
            stats: ConversationStats::default(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn sn(&self) -> &str {
        &self.device.sn
    }

    pub fn state(&self) -> DeviceState {
        self.fsm.state()
    }

    pub fn card(&self) -> Option<&Card> {
        self.card.as_ref()
    }

    pub fn order_number(&self) -> Option<u64> {
        self.order_number
    }

    pub fn cycle_usage(&self) -> (u64, u64) {
        (self.water, self.electric)
    }

    pub fn stats(&self) -> &ConversationStats {
        &self.stats
    }

    pub fn pending_entry(&self) -> Option<FunctionCode> {
        self.pending_entry
    }

    /// Record the latest cumulative usage seen by telemetry
    pub fn update_usage(&mut self, snapshot: &UsageSnapshot) {
        self.water_sum = snapshot.water_sum;
        self.electric_sum = snapshot.electric_sum;
    }

    /// Fire the init event matching the persisted registration flag
    pub async fn bootstrap(&mut self) -> Result<()> {
        let event = if self.device.registered {
            DeviceEvent::RegisteredInit
        } else {
            DeviceEvent::UnregisteredInit
        };
        info!(sn = %self.device.sn, %event, "Bootstrapping device");
        let result = self.fire(event).await;
        self.record("bootstrap", result)
    }

    /// Heartbeat/report driver body
    ///
    /// Retries a failed entry conversation first. Otherwise sends a heartbeat
    /// in POWER_ON or an open-well data report in STARTED.
    pub async fn heartbeat_tick(&mut self) -> Result<()> {
        let result = self.heartbeat_inner().await;
        self.record("heartbeat", result)
    }

    async fn heartbeat_inner(&mut self) -> Result<()> {
        if let Some(function) = self.pending_entry {
            info!(sn = %self.device.sn, state = %self.state(), "Retrying {}", function);
            if let Some(event) = self.entry_conversation(function).await? {
                self.fire(event).await?;
            }
            return Ok(());
        }

        match self.fsm.state() {
            DeviceState::PowerOn => self.converse(FunctionCode::Heartbeat).await.map(|_| ()),
            DeviceState::Started => {
                if let Some(event) = self.converse(FunctionCode::OpenWellData).await? {
                    self.fire(event).await?;
                }
                Ok(())
            },
            _ => Ok(()),
        }
    }

    /// Usage-reconciliation driver body
    pub async fn reconcile(&mut self, policy: &dyn UsagePolicy) -> Result<()> {
        let result = self.reconcile_inner(policy).await;
        self.record("reconcile", result)
    }

    async fn reconcile_inner(&mut self, policy: &dyn UsagePolicy) -> Result<()> {
        // Card is refreshed on every firing, whatever the state
        let card = self
            .store
            .card_by_area_code(self.device.area_code)
            .await?
            .ok_or(WellSimError::MissingCard(self.device.area_code))?;
        self.card = Some(card);

        match self.fsm.state() {
            DeviceState::PowerOn => {
                if self.device.uploaded_water >= self.water_sum {
                    debug!(sn = %self.device.sn, "No unreported usage");
                    return Ok(());
                }
                let pending_water = self.water_sum - self.device.uploaded_water;
                let pending_electric = self.electric_sum.saturating_sub(self.device.uploaded_electric);
                let plan = policy.plan(pending_water, pending_electric, now());
                debug!(
                    sn = %self.device.sn,
                    policy = policy.name(),
                    water = plan.water,
                    electric = plan.electric,
                    "Planned irrigation cycle"
                );
                self.water = plan.water;
                self.electric = plan.electric;
                self.window = Some((plan.started_at, plan.stopped_at));
                self.started_cycles = 0;
                self.fire(DeviceEvent::NotStartedSwipingCard).await
            },
            DeviceState::Started => {
                self.started_cycles += 1;
                if policy.should_close(self.started_cycles) {
                    self.fire(DeviceEvent::StartedSwipingCard).await
                } else {
                    Ok(())
                }
            },
            _ => Ok(()),
        }
    }

    /// Fire `event` and run every entry effect it chains into
    ///
    /// An illegal transition leaves the state unchanged. A failed conversation
    /// stops the chain in the state reached so far.
    pub async fn fire(&mut self, event: DeviceEvent) -> Result<()> {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let transition = self.fsm.fire(event)?;
            debug!(
                sn = %self.device.sn,
                %event,
                from = %transition.from,
                to = %transition.to,
                "State transition"
            );
            for effect in transition.effects {
                match *effect {
                    Effect::Send(function) => next = self.entry_conversation(function).await?,
                    Effect::MarkRegistered => self.mark_registered().await,
                    Effect::PersistUploadedTotals => self.persist_uploaded_totals().await,
                }
            }
        }
        Ok(())
    }

    async fn entry_conversation(&mut self, function: FunctionCode) -> Result<Option<DeviceEvent>> {
        self.pending_entry = Some(function);
        let event = self.converse(function).await?;
        self.pending_entry = None;
        Ok(event)
    }

    /// One request and, unless fire-and-forget, its reply mapped to an event
    async fn converse(&mut self, function: FunctionCode) -> Result<Option<DeviceEvent>> {
        let request = self.build_request(function)?;
        let address = self.address_for(function)?;
        let frame = request.encode(&address)?;

        // Buffered bytes belong to an abandoned conversation; late frames
        // still in the socket are dropped by read_reply
        self.rx.clear();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        self.stats.frames_sent += 1;
        debug!(sn = %self.device.sn, "Sent {} ({} bytes)", function, frame.len());

        if !function.expects_reply() {
            return Ok(None);
        }
        let raw = self.read_reply(function).await?;
        self.stats.replies += 1;
        self.interpret(&raw).await.map(Some)
    }

    /// Read until a frame answering `expected` arrives or the reply timeout expires
    ///
    /// Frames carrying any other function code are late replies to abandoned
    /// conversations (or heartbeat acknowledgements) and are dropped.
    async fn read_reply(&mut self, expected: FunctionCode) -> Result<Vec<u8>> {
        let timeout = self.options.reply_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let offset = self.options.reply_layout.function_offset;
        loop {
            if let Some((start, end)) = find_frame(&self.rx) {
                let frame = self.rx.split_to(end).split_off(start);
                if frame.get(offset) != Some(&expected.code()) {
                    self.stats.discarded_replies += 1;
                    debug!(
                        sn = %self.device.sn,
                        "Discarding stale frame while awaiting {}: {}",
                        expected,
                        hex::encode(&frame)
                    );
                    continue;
                }
                return Ok(frame.to_vec());
            }
            self.rx.reserve(256);
            let read = tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.rx))
                .await
                .map_err(|_| WellSimError::Timeout(timeout))??;
            if read == 0 {
                return Err(WellSimError::Io("connection closed by collector".to_string()));
            }
        }
    }

    /// Map a reply onto its event; refuses events the current state does not accept
    async fn interpret(&mut self, raw: &[u8]) -> Result<DeviceEvent> {
        let reply = ReplyFrame::parse(raw, self.options.reply_layout)?;
        if !reply.checksum_ok() {
            warn!(sn = %self.device.sn, "Reply checksum mismatch: {}", hex::encode(raw));
        }

        let event = match reply.function() {
            FunctionCode::Register => DeviceEvent::RegisterReply,
            FunctionCode::RegisterConfirm => DeviceEvent::RegisterConfirmedReply,
            FunctionCode::PowerOn => DeviceEvent::PowerOnReply,
            FunctionCode::SearchCard => match reply.card_status()? {
                CardStatus::Valid => DeviceEvent::SearchUserValidReply,
                CardStatus::Invalid(code) => {
                    info!(sn = %self.device.sn, status = code, "Card rejected by collector");
                    DeviceEvent::SearchUserInvalidReply
                },
            },
            FunctionCode::OpenWell => DeviceEvent::OpenWellReply,
            FunctionCode::OpenWellData => DeviceEvent::OpenWellDataReply,
            FunctionCode::CloseWell => DeviceEvent::CloseWellReply,
            FunctionCode::Heartbeat => {
                return Err(WellSimError::decode("collector replied to a heartbeat"));
            },
        };

        if !self.fsm.permits(event) {
            return Err(WellSimError::IllegalTransition {
                event,
                state: self.fsm.state(),
            });
        }

        if event == DeviceEvent::RegisterReply {
            let register_number = hex::encode(reply.register_number()?);
            info!(sn = %self.device.sn, %register_number, "Register number assigned");
            self.device.register_number = register_number;
            self.persist_registration().await;
        }
        Ok(event)
    }

    fn address_for(&self, function: FunctionCode) -> Result<Address> {
        if function == FunctionCode::Register {
            Ok(Address::AreaCode {
                area_code: self.device.area_code,
                number: self.device.number,
            })
        } else {
            Address::registered(&self.device.register_number, self.device.number)
        }
    }

    fn build_request(&mut self, function: FunctionCode) -> Result<Request> {
        let request = match function {
            FunctionCode::Register => Request::Register,
            FunctionCode::RegisterConfirm => Request::RegisterConfirm,
            FunctionCode::Heartbeat => Request::Heartbeat,
            FunctionCode::PowerOn => Request::PowerOn {
                longitude: self.device.longitude,
                latitude: self.device.latitude,
            },
            FunctionCode::SearchCard => Request::SearchCard {
                card_register_number: self.card_register_bytes()?,
            },
            FunctionCode::OpenWell => {
                let card_register_number = self.card_register_bytes()?;
                self.order_count = self.order_count.wrapping_add(1);
                let order = order_number(&now(), self.order_count);
                self.order_number = Some(order);
                Request::OpenWell {
                    order_number: order,
                    card_register_number,
                }
            },
            FunctionCode::OpenWellData => Request::OpenWellData {
                order_number: self.current_order()?,
                water: self.water,
                electric: self.electric,
                at: now(),
            },
            FunctionCode::CloseWell => {
                let at = now();
                let (started_at, stopped_at) = self.window.unwrap_or((at, at));
                Request::CloseWell {
                    order_number: self.current_order()?,
                    water: self.water,
                    electric: self.electric,
                    started_at,
                    stopped_at,
                }
            },
        };
        Ok(request)
    }

    fn card_register_bytes(&self) -> Result<Vec<u8>> {
        let card = self
            .card
            .as_ref()
            .ok_or(WellSimError::MissingCard(self.device.area_code))?;
        Ok(hex::decode(&card.card_register_number)?)
    }

    fn current_order(&self) -> Result<u64> {
        self.order_number
            .ok_or_else(|| WellSimError::decode("no irrigation order in flight"))
    }

    async fn mark_registered(&mut self) {
        self.device.registered = true;
        info!(sn = %self.device.sn, "Device registered");
        self.persist_registration().await;
    }

    async fn persist_registration(&mut self) {
        let result = self
            .store
            .update_registration(
                self.device.id,
                &self.device.register_number,
                self.device.registered,
            )
            .await;
        self.log_persistence(result);
    }

    /// Close-well acknowledged: uploaded totals catch up with the observed sums
    async fn persist_uploaded_totals(&mut self) {
        self.device.uploaded_water = self.device.uploaded_water.max(self.water_sum);
        self.device.uploaded_electric = self.device.uploaded_electric.max(self.electric_sum);
        info!(
            sn = %self.device.sn,
            order = ?self.order_number,
            uploaded_water = self.device.uploaded_water,
            uploaded_electric = self.device.uploaded_electric,
            "Irrigation order closed"
        );
        self.water = 0;
        self.electric = 0;
        self.order_number = None;
        self.window = None;
        self.started_cycles = 0;

        let result = self
            .store
            .update_uploaded(
                self.device.id,
                self.device.uploaded_water,
                self.device.uploaded_electric,
            )
            .await;
        self.log_persistence(result);
    }

    fn log_persistence(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.stats.count(&e);
            warn!(sn = %self.device.sn, kind = %e.kind(), "Persist failed: {}", e);
        }
    }

    fn record(&mut self, driver: &'static str, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            self.stats.count(e);
            let kind = e.kind();
            let state = self.fsm.state();
            if kind == ErrorKind::IllegalTransition {
                error!(sn = %self.device.sn, %kind, driver, %state, "Protocol desync: {}", e);
            } else {
                warn!(sn = %self.device.sn, %kind, driver, %state, "Conversation aborted: {}", e);
            }
        }
        result
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_reply;
    use crate::store::MemoryStore;
    use crate::usage::ExactUsagePolicy;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tracing_test::traced_test;

    const REGISTER_NUMBER: [u8; 16] = [0x5A; 16];

    fn device(registered: bool) -> Device {
        Device {
            id: 1,
            sn: "JG0001".to_string(),
            number: 12,
            area_code: 410_102_003_004,
            town: String::new(),
            village: String::new(),
            longitude: 113.625_368,
            latitude: 34.7466,
            register_number: if registered {
                hex::encode(REGISTER_NUMBER)
            } else {
                String::new()
            },
            registered,
            uploaded_water: 100,
            uploaded_electric: 10,
        }
    }

    fn card() -> Card {
        Card {
            id: 1,
            area_code: 410_102_003_004,
            card_number: "0001".to_string(),
            name: String::new(),
            card_register_number: "0a0b0c0d".to_string(),
            balance: 0,
        }
    }

    /// Collector end of a duplex pipe; answers each complete frame via `respond`
    fn spawn_peer<F>(mut peer: DuplexStream, respond: F) -> JoinHandle<Vec<Vec<u8>>>
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = BytesMut::new();
            loop {
                while let Some((start, end)) = find_frame(&buf) {
                    let frame = buf.split_to(end)[start..].to_vec();
                    if let Some(reply) = respond(&frame) {
                        peer.write_all(&reply).await.unwrap();
                    }
                    received.push(frame);
                }
                buf.reserve(256);
                match peer.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return received,
                    Ok(_) => {},
                }
            }
        })
    }

    fn session(
        device: Device,
        stream: DuplexStream,
        store: Arc<MemoryStore>,
    ) -> DeviceSession<DuplexStream> {
        let options = SessionOptions {
            reply_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        DeviceSession::new(device, stream, store, options)
    }

    /// Function byte of a request addressed by register number
    fn registered_function(frame: &[u8]) -> u8 {
        frame[23]
    }

    #[tokio::test]
    async fn test_registered_bootstrap_powers_on() {
        let store = Arc::new(MemoryStore::new(vec![device(true)], vec![]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let peer = spawn_peer(theirs, |frame| {
            (registered_function(frame) == 0x86)
                .then(|| encode_reply(FunctionCode::PowerOn, &[]).to_vec())
        });

        let mut s = session(device(true), ours, store);
        s.bootstrap().await.unwrap();
        assert_eq!(s.state(), DeviceState::PowerOn);
        assert_eq!(s.stats().frames_sent, 1);
        drop(s);

        let frames = peer.await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][4..20], &REGISTER_NUMBER);
    }

    #[tokio::test]
    async fn test_heartbeat_is_fire_and_forget() {
        let store = Arc::new(MemoryStore::new(vec![device(true)], vec![]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let peer = spawn_peer(theirs, |frame| {
            (registered_function(frame) == 0x86)
                .then(|| encode_reply(FunctionCode::PowerOn, &[]).to_vec())
        });

        let mut s = session(device(true), ours, store);
        s.bootstrap().await.unwrap();
        s.heartbeat_tick().await.unwrap();
        s.heartbeat_tick().await.unwrap();
        assert_eq!(s.state(), DeviceState::PowerOn);
        assert_eq!(s.stats().replies, 1);
        assert_eq!(s.stats().timeouts, 0);
        drop(s);

        let frames = peer.await.unwrap();
        let functions: Vec<u8> = frames.iter().map(|f| f[23]).collect();
        assert_eq!(functions, vec![0x86, 0x85, 0x85]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reply_for_other_function_is_discarded() {
        let store = Arc::new(MemoryStore::new(vec![device(true)], vec![]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let _peer = spawn_peer(theirs, |_| {
            Some(encode_reply(FunctionCode::CloseWell, &[]).to_vec())
        });

        let mut s = session(device(true), ours, store);
        let err = s.bootstrap().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(s.state(), DeviceState::Registered);
        assert_eq!(s.stats().illegal_transitions, 0);
        assert_eq!(s.stats().timeouts, 1);
        assert_eq!(s.stats().discarded_replies, 1);
        assert!(logs_contain("Discarding stale frame"));
    }

    /// Answers every request in order, holding back replies to `late` by `delay`
    fn spawn_late_peer(mut peer: DuplexStream, late: FunctionCode, delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            loop {
                while let Some((start, end)) = find_frame(&buf) {
                    let frame = buf.split_to(end)[start..].to_vec();
                    let Some(function) = FunctionCode::from_code(registered_function(&frame)) else {
                        continue;
                    };
                    if !function.expects_reply() {
                        continue;
                    }
                    if function == late {
                        tokio::time::sleep(delay).await;
                    }
                    let payload: &[u8] = if function == FunctionCode::SearchCard { &[0] } else { &[] };
                    if peer.write_all(&encode_reply(function, payload)).await.is_err() {
                        return;
                    }
                }
                buf.reserve(256);
                match peer.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {},
                }
            }
        })
    }

    #[tokio::test]
    async fn test_late_reply_does_not_desync_next_conversation() {
        let store = Arc::new(MemoryStore::new(vec![device(true)], vec![card()]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let _peer = spawn_late_peer(theirs, FunctionCode::OpenWellData, Duration::from_millis(300));
        let options = SessionOptions {
            reply_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        };
        let mut s = DeviceSession::new(device(true), ours, store, options);

        s.bootstrap().await.unwrap();
        s.update_usage(&UsageSnapshot {
            water_sum: 500,
            electric_sum: 50,
            ..UsageSnapshot::default()
        });
        s.reconcile(&ExactUsagePolicy).await.unwrap();
        assert_eq!(s.state(), DeviceState::Started);

        // Report times out; its reply lands while close-well is in flight
        let err = s.heartbeat_tick().await.unwrap_err();
        assert!(matches!(err, WellSimError::Timeout(_)));
        assert_eq!(s.state(), DeviceState::Started);

        s.reconcile(&ExactUsagePolicy).await.unwrap();
        assert_eq!(s.state(), DeviceState::PowerOn);
        assert_eq!(s.device().uploaded_water, 500);
        assert_eq!(s.stats().illegal_transitions, 0);
        assert_eq!(s.stats().timeouts, 1);
        assert_eq!(s.stats().discarded_replies, 1);
    }

    #[tokio::test]
    async fn test_illegal_event_sends_nothing() {
        let store = Arc::new(MemoryStore::new(vec![device(false)], vec![]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let peer = spawn_peer(theirs, |_| None);

        let mut s = session(device(false), ours, store);
        let err = s.fire(DeviceEvent::StartedSwipingCard).await.unwrap_err();
        assert!(matches!(err, WellSimError::IllegalTransition { .. }));
        assert_eq!(s.state(), DeviceState::Initial);
        drop(s);
        assert!(peer.await.unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_timeout_then_retry_on_heartbeat() {
        let store = Arc::new(MemoryStore::new(vec![device(false)], vec![]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let answered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = answered.clone();
        let peer = spawn_peer(theirs, move |frame| {
            use std::sync::atomic::Ordering;
            // Ignore the first register request
            if frame[13] == 0x83 && !flag.swap(true, Ordering::SeqCst) {
                return None;
            }
            let function = if frame[13] == 0x83 { 0x83 } else { registered_function(frame) };
            let reply = match function {
                0x83 => encode_reply(FunctionCode::Register, &REGISTER_NUMBER),
                0x84 => encode_reply(FunctionCode::RegisterConfirm, &[]),
                0x86 => encode_reply(FunctionCode::PowerOn, &[]),
                _ => return None,
            };
            Some(reply.to_vec())
        });

        let mut s = session(device(false), ours, store.clone());
        let err = s.bootstrap().await.unwrap_err();
        assert!(matches!(err, WellSimError::Timeout(_)));
        assert_eq!(s.state(), DeviceState::Unregistered);
        assert_eq!(s.pending_entry(), Some(FunctionCode::Register));
        assert!(logs_contain("transport"));

        s.heartbeat_tick().await.unwrap();
        assert_eq!(s.state(), DeviceState::PowerOn);
        assert_eq!(s.pending_entry(), None);
        assert!(s.device().registered);

        let stored = store.get_device(1).await.unwrap().unwrap();
        assert!(stored.registered);
        assert_eq!(stored.register_number, hex::encode(REGISTER_NUMBER));
        drop(s);
        assert_eq!(peer.await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_reconcile_without_card_is_collaborator_error() {
        let store = Arc::new(MemoryStore::new(vec![device(true)], vec![]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let _peer = spawn_peer(theirs, |frame| {
            (registered_function(frame) == 0x86)
                .then(|| encode_reply(FunctionCode::PowerOn, &[]).to_vec())
        });

        let mut s = session(device(true), ours, store);
        s.bootstrap().await.unwrap();
        s.update_usage(&UsageSnapshot {
            water_sum: 500,
            ..UsageSnapshot::default()
        });
        let err = s.reconcile(&ExactUsagePolicy).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert_eq!(s.state(), DeviceState::PowerOn);
    }

    #[tokio::test]
    async fn test_reconcile_with_nothing_pending_stays_idle() {
        let store = Arc::new(MemoryStore::new(vec![device(true)], vec![card()]));
        let (ours, theirs) = tokio::io::duplex(1024);
        let _peer = spawn_peer(theirs, |frame| {
            (registered_function(frame) == 0x86)
                .then(|| encode_reply(FunctionCode::PowerOn, &[]).to_vec())
        });

        let mut s = session(device(true), ours, store);
        s.bootstrap().await.unwrap();
        s.update_usage(&UsageSnapshot {
            water_sum: 100,
            ..UsageSnapshot::default()
        });
        s.reconcile(&ExactUsagePolicy).await.unwrap();
        assert_eq!(s.state(), DeviceState::PowerOn);
        assert_eq!(s.stats().frames_sent, 1);
        assert_eq!(s.card(), Some(&card()));
    }
}
