//! Collector wire protocol
//!
//! DLT645-style binary framing with BCD-encoded numeric fields and a CRC-8
//! checksum.

pub mod codec;
pub mod frame;

pub use codec::{crc8, decimal_to_bcd, order_number};
pub use frame::{
    encode_reply, find_frame, Address, CardStatus, FrameBuilder, FunctionCode, ReplyFrame,
    ReplyLayout, Request,
};
