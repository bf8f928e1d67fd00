//! Frame assembly and reply parsing
//!
//! Request layout:
//!
//! ```text
//! 0x68 | LEN | 0x68 | CTRL | ADDRESS | NUMBER(3, LE) | FUNC | PAYLOAD | CS | 0x16
//! ```
//!
//! `LEN` counts `CTRL..=PAYLOAD`, `CS` is CRC-8 over everything before it.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;

use super::codec::{coordinate_to_bcd, crc8, datetime_to_bcd, decimal_to_bcd};
use crate::error::{Result, WellSimError};

pub const FRAME_START: u8 = 0x68;
pub const FRAME_END: u8 = 0x16;
pub const CONTROL_REQUEST: u8 = 0x01;
pub const CONTROL_REPLY: u8 = 0x81;
/// Bytes outside the LEN-covered span: two start markers, LEN, checksum, terminator
pub const FRAME_OVERHEAD: usize = 5;
pub const REGISTER_NUMBER_LEN: usize = 16;
pub const AREA_CODE_LEN: usize = 6;
pub const ORDER_NUMBER_LEN: usize = 8;
pub const QUANTITY_LEN: usize = 4;

/// Message function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    Register,
    RegisterConfirm,
    Heartbeat,
    PowerOn,
    SearchCard,
    OpenWell,
    OpenWellData,
    CloseWell,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::Register => 0x83,
            FunctionCode::RegisterConfirm => 0x84,
            FunctionCode::Heartbeat => 0x85,
            FunctionCode::PowerOn => 0x86,
            FunctionCode::SearchCard => 0x87,
            FunctionCode::OpenWell => 0x88,
            FunctionCode::OpenWellData => 0x89,
            FunctionCode::CloseWell => 0x90,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x83 => Some(FunctionCode::Register),
            0x84 => Some(FunctionCode::RegisterConfirm),
            0x85 => Some(FunctionCode::Heartbeat),
            0x86 => Some(FunctionCode::PowerOn),
            0x87 => Some(FunctionCode::SearchCard),
            0x88 => Some(FunctionCode::OpenWell),
            0x89 => Some(FunctionCode::OpenWellData),
            0x90 => Some(FunctionCode::CloseWell),
            _ => None,
        }
    }

    /// Heartbeats are fire-and-forget
    pub fn expects_reply(self) -> bool {
        self != FunctionCode::Heartbeat
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::Register => "register",
            FunctionCode::RegisterConfirm => "register-confirm",
            FunctionCode::Heartbeat => "heartbeat",
            FunctionCode::PowerOn => "power-on",
            FunctionCode::SearchCard => "search-card",
            FunctionCode::OpenWell => "open-well",
            FunctionCode::OpenWellData => "open-well-data",
            FunctionCode::CloseWell => "close-well",
        };
        write!(f, "{}({:#04X})", name, self.code())
    }
}

/// Protocol address of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// 12-digit area code as six BCD bytes; only used by the registration request
    AreaCode { area_code: u64, number: u32 },
    /// Collector-assigned register number
    Registered {
        register_number: [u8; REGISTER_NUMBER_LEN],
        number: u32,
    },
}

impl Address {
    /// Build a registered address from the hex string kept on the device record
    pub fn registered(register_number_hex: &str, number: u32) -> Result<Self> {
        Ok(Address::Registered {
            register_number: decode_register_number(register_number_hex)?,
            number,
        })
    }

    fn number(&self) -> u32 {
        match self {
            Address::AreaCode { number, .. } | Address::Registered { number, .. } => *number,
        }
    }

    fn encode_to(&self, dst: &mut BytesMut) {
        match self {
            Address::AreaCode { area_code, .. } => {
                dst.put_slice(&decimal_to_bcd(*area_code, AREA_CODE_LEN));
            },
            Address::Registered {
                register_number, ..
            } => dst.put_slice(register_number),
        }
        let number = self.number();
        dst.put_u8((number & 0xFF) as u8);
        dst.put_u8(((number >> 8) & 0xFF) as u8);
        dst.put_u8(((number >> 16) & 0xFF) as u8);
    }
}

/// Decode a hex-encoded 16-byte register number
pub fn decode_register_number(hex_str: &str) -> Result<[u8; REGISTER_NUMBER_LEN]> {
    let raw = hex::decode(hex_str)?;
    raw.as_slice().try_into().map_err(|_| {
        WellSimError::decode(format!(
            "register number must be {} bytes, got {}",
            REGISTER_NUMBER_LEN,
            raw.len()
        ))
    })
}

/// Incremental frame writer; `finish` patches LEN and appends checksum and terminator
#[derive(Debug)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    pub fn new(address: &Address, function: FunctionCode) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FRAME_START);
        buf.put_u8(0);
        buf.put_u8(FRAME_START);
        buf.put_u8(CONTROL_REQUEST);
        address.encode_to(&mut buf);
        buf.put_u8(function.code());
        Self { buf }
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    pub fn decimal(self, value: u64, width: usize) -> Self {
        self.bytes(&decimal_to_bcd(value, width))
    }

    pub fn timestamp(self, at: &NaiveDateTime) -> Self {
        self.bytes(&datetime_to_bcd(at))
    }

    pub fn finish(mut self) -> Result<Bytes> {
        let len = self.buf.len() - 3;
        if len > usize::from(u8::MAX) {
            return Err(WellSimError::decode(format!(
                "frame body of {} bytes exceeds the LEN field",
                len
            )));
        }
        self.buf[1] = len as u8;
        let checksum = crc8(&self.buf);
        self.buf.put_u8(checksum);
        self.buf.put_u8(FRAME_END);
        Ok(self.buf.freeze())
    }
}

/// One outbound message with its payload fields
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Register,
    RegisterConfirm,
    Heartbeat,
    PowerOn {
        longitude: f64,
        latitude: f64,
    },
    SearchCard {
        card_register_number: Vec<u8>,
    },
    OpenWell {
        order_number: u64,
        card_register_number: Vec<u8>,
    },
    OpenWellData {
        order_number: u64,
        water: u64,
        electric: u64,
        at: NaiveDateTime,
    },
    CloseWell {
        order_number: u64,
        water: u64,
        electric: u64,
        started_at: NaiveDateTime,
        stopped_at: NaiveDateTime,
    },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::Register => FunctionCode::Register,
            Request::RegisterConfirm => FunctionCode::RegisterConfirm,
            Request::Heartbeat => FunctionCode::Heartbeat,
            Request::PowerOn { .. } => FunctionCode::PowerOn,
            Request::SearchCard { .. } => FunctionCode::SearchCard,
            Request::OpenWell { .. } => FunctionCode::OpenWell,
            Request::OpenWellData { .. } => FunctionCode::OpenWellData,
            Request::CloseWell { .. } => FunctionCode::CloseWell,
        }
    }

    pub fn encode(&self, address: &Address) -> Result<Bytes> {
        let builder = FrameBuilder::new(address, self.function());
        let builder = match self {
            Request::Register | Request::RegisterConfirm | Request::Heartbeat => builder,
            Request::PowerOn {
                longitude,
                latitude,
            } => builder
                .bytes(&coordinate_to_bcd(*longitude))
                .bytes(&coordinate_to_bcd(*latitude)),
            Request::SearchCard {
                card_register_number,
            } => builder.bytes(card_register_number),
            Request::OpenWell {
                order_number,
                card_register_number,
            } => builder
                .decimal(*order_number, ORDER_NUMBER_LEN)
                .bytes(card_register_number),
            Request::OpenWellData {
                order_number,
                water,
                electric,
                at,
            } => builder
                .decimal(*order_number, ORDER_NUMBER_LEN)
                .decimal(*water, QUANTITY_LEN)
                .decimal(*electric, QUANTITY_LEN)
                .timestamp(at),
            Request::CloseWell {
                order_number,
                water,
                electric,
                started_at,
                stopped_at,
            } => builder
                .decimal(*order_number, ORDER_NUMBER_LEN)
                .decimal(*water, QUANTITY_LEN)
                .decimal(*electric, QUANTITY_LEN)
                .timestamp(started_at)
                .timestamp(stopped_at),
        };
        builder.finish()
    }
}

/// Where the function code sits in a reply frame
///
/// Replies carry a shorter address than requests; the default offset of 4
/// places the function code directly after CTRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLayout {
    pub function_offset: usize,
}

impl Default for ReplyLayout {
    fn default() -> Self {
        Self { function_offset: 4 }
    }
}

/// Search-card verdict carried in the reply status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Valid,
    Invalid(u8),
}

/// Parsed view over a reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame<'a> {
    raw: &'a [u8],
    function: FunctionCode,
    payload: &'a [u8],
}

impl<'a> ReplyFrame<'a> {
    pub fn parse(raw: &'a [u8], layout: ReplyLayout) -> Result<Self> {
        if raw.first() != Some(&FRAME_START) {
            return Err(WellSimError::decode("reply does not start with 0x68"));
        }
        let offset = layout.function_offset;
        if raw.len() <= offset {
            return Err(WellSimError::decode(format!(
                "reply of {} bytes has no function code at offset {}",
                raw.len(),
                offset
            )));
        }
        let code = raw[offset];
        let function = FunctionCode::from_code(code)
            .ok_or_else(|| WellSimError::decode(format!("unknown function code {:#04X}", code)))?;

        // Payload runs up to the checksum when the frame is complete
        let end = if raw.len() >= offset + 3 && raw[raw.len() - 1] == FRAME_END {
            raw.len() - 2
        } else {
            raw.len()
        };
        Ok(Self {
            raw,
            function,
            payload: &raw[offset + 1..end],
        })
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Whether the trailing checksum matches; frames too short to carry one report false
    pub fn checksum_ok(&self) -> bool {
        let n = self.raw.len();
        n >= FRAME_OVERHEAD && crc8(&self.raw[..n - 2]) == self.raw[n - 2]
    }

    pub fn register_number(&self) -> Result<[u8; REGISTER_NUMBER_LEN]> {
        self.payload
            .get(..REGISTER_NUMBER_LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                WellSimError::decode(format!(
                    "register reply carries {} bytes, need {}",
                    self.payload.len(),
                    REGISTER_NUMBER_LEN
                ))
            })
    }

    pub fn card_status(&self) -> Result<CardStatus> {
        match self.payload.first() {
            Some(0) => Ok(CardStatus::Valid),
            Some(code) => Ok(CardStatus::Invalid(*code)),
            None => Err(WellSimError::decode("search-card reply has no status byte")),
        }
    }
}

/// Build a collector reply in the default layout: `0x68 LEN 0x68 CTRL FUNC PAYLOAD CS 0x16`
pub fn encode_reply(function: FunctionCode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 7);
    buf.put_u8(FRAME_START);
    buf.put_u8(0);
    buf.put_u8(FRAME_START);
    buf.put_u8(CONTROL_REPLY);
    buf.put_u8(function.code());
    buf.put_slice(payload);
    buf[1] = (buf.len() - 3) as u8;
    let checksum = crc8(&buf);
    buf.put_u8(checksum);
    buf.put_u8(FRAME_END);
    buf.freeze()
}

/// Locate one complete frame in `buf`
///
/// Returns `(start, end)` of the first frame whose start marker and LEN field
/// are fully buffered, or `None` when more bytes are needed. Bytes before the
/// first 0x68 are noise.
pub fn find_frame(buf: &[u8]) -> Option<(usize, usize)> {
    let start = buf.iter().position(|b| *b == FRAME_START)?;
    let len = usize::from(*buf.get(start + 1)?);
    let end = start + len + FRAME_OVERHEAD;
    (buf.len() >= end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn area_address() -> Address {
        Address::AreaCode {
            area_code: 410_102_003_004,
            number: 0x0A0B0C,
        }
    }

    fn registered_address() -> Address {
        Address::Registered {
            register_number: [0xAB; REGISTER_NUMBER_LEN],
            number: 7,
        }
    }

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 9)
            .unwrap()
            .and_hms_opt(18, 5, 59)
            .unwrap()
    }

    #[test]
    fn test_register_frame_layout() {
        let frame = Request::Register.encode(&area_address()).unwrap();
        assert_eq!(
            &frame[..],
            &[
                0x68, 0x0B, 0x68, 0x01, // header + ctrl
                0x41, 0x01, 0x02, 0x00, 0x30, 0x04, // area code BCD
                0x0C, 0x0B, 0x0A, // number LE
                0x83, // function
                crc8(&frame[..14]),
                0x16,
            ]
        );
    }

    #[test]
    fn test_length_field_covers_ctrl_through_payload() {
        let requests = vec![
            Request::Register,
            Request::Heartbeat,
            Request::PowerOn {
                longitude: 113.6,
                latitude: 34.7,
            },
            Request::SearchCard {
                card_register_number: vec![1, 2, 3, 4],
            },
            Request::CloseWell {
                order_number: 42,
                water: 1234,
                electric: 56,
                started_at: at(),
                stopped_at: at(),
            },
        ];
        for request in requests {
            for address in [area_address(), registered_address()] {
                let frame = request.encode(&address).unwrap();
                assert_eq!(usize::from(frame[1]), frame.len() - FRAME_OVERHEAD);
                assert_eq!(frame[frame.len() - 1], FRAME_END);
                assert_eq!(crc8(&frame[..frame.len() - 2]), frame[frame.len() - 2]);
            }
        }
    }

    #[test]
    fn test_registered_address_uses_raw_register_number() {
        let frame = Request::Heartbeat.encode(&registered_address()).unwrap();
        assert_eq!(&frame[4..20], &[0xAB; 16]);
        assert_eq!(&frame[20..23], &[7, 0, 0]);
        assert_eq!(frame[23], 0x85);
        assert_eq!(frame[1], 21);
    }

    #[test]
    fn test_power_on_payload() {
        let frame = Request::PowerOn {
            longitude: 113.625_368,
            latitude: 34.7466,
        }
        .encode(&registered_address())
        .unwrap();
        assert_eq!(frame[23], 0x86);
        assert_eq!(
            &frame[24..34],
            &[0x01, 0x13, 0x62, 0x53, 0x68, 0x00, 0x34, 0x74, 0x66, 0x00]
        );
    }

    #[test]
    fn test_open_well_data_payload() {
        let frame = Request::OpenWellData {
            order_number: 2_407_091_805_590_003,
            water: 4_500,
            electric: 1_020,
            at: at(),
        }
        .encode(&registered_address())
        .unwrap();
        let payload = &frame[24..frame.len() - 2];
        assert_eq!(&payload[..8], &[0x24, 0x07, 0x09, 0x18, 0x05, 0x59, 0x00, 0x03]);
        assert_eq!(&payload[8..12], &[0x00, 0x00, 0x45, 0x00]);
        assert_eq!(&payload[12..16], &[0x00, 0x00, 0x10, 0x20]);
        assert_eq!(&payload[16..], &[0x24, 0x07, 0x09, 0x18, 0x05, 0x59]);
    }

    #[test]
    fn test_decode_register_number_rejects_bad_hex() {
        assert!(decode_register_number("not-hex").is_err());
        assert!(decode_register_number("abcd").is_err());
        assert!(decode_register_number(&"ab".repeat(16)).is_ok());
    }

    #[test]
    fn test_address_registered_from_hex() {
        let addr = Address::registered(&"01".repeat(16), 3).unwrap();
        assert_eq!(
            addr,
            Address::Registered {
                register_number: [1; 16],
                number: 3
            }
        );
    }

    #[test]
    fn test_function_code_round_trip() {
        for code in 0x83..=0x90u8 {
            if let Some(f) = FunctionCode::from_code(code) {
                assert_eq!(f.code(), code);
            }
        }
        assert_eq!(FunctionCode::from_code(0x8A), None);
        assert!(!FunctionCode::Heartbeat.expects_reply());
        assert!(FunctionCode::PowerOn.expects_reply());
    }

    fn reply(function: u8, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0x68, 0, 0x68, 0x01, function];
        raw.extend_from_slice(payload);
        raw[1] = (raw.len() - 3) as u8;
        let cs = crc8(&raw);
        raw.push(cs);
        raw.push(0x16);
        raw
    }

    #[test]
    fn test_parse_register_reply() {
        let raw = reply(0x83, &[0x5A; 16]);
        let frame = ReplyFrame::parse(&raw, ReplyLayout::default()).unwrap();
        assert_eq!(frame.function(), FunctionCode::Register);
        assert_eq!(frame.register_number().unwrap(), [0x5A; 16]);
        assert!(frame.checksum_ok());
    }

    #[test]
    fn test_parse_undersized_register_reply() {
        let raw = reply(0x83, &[0x5A; 4]);
        let frame = ReplyFrame::parse(&raw, ReplyLayout::default()).unwrap();
        assert!(frame.register_number().is_err());
    }

    #[test]
    fn test_parse_card_status() {
        let valid = reply(0x87, &[0]);
        let invalid = reply(0x87, &[2]);
        let layout = ReplyLayout::default();
        assert_eq!(
            ReplyFrame::parse(&valid, layout).unwrap().card_status().unwrap(),
            CardStatus::Valid
        );
        assert_eq!(
            ReplyFrame::parse(&invalid, layout).unwrap().card_status().unwrap(),
            CardStatus::Invalid(2)
        );
    }

    #[test]
    fn test_parse_rejects_short_and_unknown() {
        let layout = ReplyLayout::default();
        assert!(ReplyFrame::parse(&[0x68, 0x01, 0x68], layout).is_err());
        assert!(ReplyFrame::parse(&reply(0x42, &[]), layout).is_err());
        assert!(ReplyFrame::parse(&[0x00, 0x01, 0x68, 0x01, 0x86], layout).is_err());
    }

    #[test]
    fn test_parse_with_custom_offset() {
        let mut raw = vec![0x68, 0, 0x68, 0x01, 0xEE, 0xEE, 0x86];
        raw[1] = (raw.len() - 3) as u8;
        let cs = crc8(&raw);
        raw.extend_from_slice(&[cs, 0x16]);
        let frame = ReplyFrame::parse(&raw, ReplyLayout { function_offset: 6 }).unwrap();
        assert_eq!(frame.function(), FunctionCode::PowerOn);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_encode_reply_matches_default_layout() {
        let raw = encode_reply(FunctionCode::SearchCard, &[0]);
        let frame = ReplyFrame::parse(&raw, ReplyLayout::default()).unwrap();
        assert_eq!(frame.function(), FunctionCode::SearchCard);
        assert_eq!(frame.card_status().unwrap(), CardStatus::Valid);
        assert!(frame.checksum_ok());
        assert_eq!(find_frame(&raw), Some((0, raw.len())));
    }

    #[test]
    fn test_find_frame() {
        let raw = reply(0x86, &[]);
        assert_eq!(find_frame(&raw), Some((0, raw.len())));
        assert_eq!(find_frame(&raw[..raw.len() - 1]), None);

        let mut noisy = vec![0xFF, 0x00];
        noisy.extend_from_slice(&raw);
        noisy.extend_from_slice(&[0x68]);
        assert_eq!(find_frame(&noisy), Some((2, 2 + raw.len())));
        assert_eq!(find_frame(&[0x01, 0x02]), None);
    }
}
