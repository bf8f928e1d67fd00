//! Byte-level encoding primitives
//!
//! BCD conversion, CRC-8 and the decimal/calendar field encoders used by the
//! frame builders. Everything here is pure.

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::{Result, WellSimError};

/// Encode a value in 0..=99 as one BCD byte
///
/// Values above 99 are reduced modulo 100.
pub fn bcd_encode(value: u8) -> u8 {
    let value = value % 100;
    ((value / 10) << 4) | (value % 10)
}

/// Decode one BCD byte back to its binary value
pub fn bcd_decode(value: u8) -> u8 {
    ((value >> 4) & 0x0F) * 10 + (value & 0x0F)
}

/// CRC-8, polynomial 0x07, initial value 0, no reflection, no final xor
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Split `value` into `width` two-digit groups, most significant first, each BCD encoded
///
/// Digits above `2 * width` are dropped.
pub fn decimal_to_bcd(value: u64, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    let mut rest = value;
    for slot in out.iter_mut().rev() {
        *slot = bcd_encode((rest % 100) as u8);
        rest /= 100;
    }
    out
}

/// Inverse of [`decimal_to_bcd`]
pub fn bcd_to_decimal(bytes: &[u8]) -> Result<u64> {
    if bytes.len() > 9 {
        return Err(WellSimError::decode("BCD field too long for u64"));
    }
    let mut value = 0u64;
    for &b in bytes {
        let (hi, lo) = (b >> 4, b & 0x0F);
        if hi > 9 || lo > 9 {
            return Err(WellSimError::decode(format!("invalid BCD digit in {:#04X}", b)));
        }
        value = value * 100 + u64::from(hi * 10 + lo);
    }
    Ok(value)
}

/// Encode a coordinate in degrees as `round(|value| * 1e6)` over five BCD bytes
///
/// The frame has no sign digit: a negative coordinate is sent as its
/// magnitude, so hemisphere information is lost.
pub fn coordinate_to_bcd(degrees: f64) -> [u8; 5] {
    let micro = (degrees.abs() * 1_000_000.0).round() as u64;
    let mut out = [0u8; 5];
    out.copy_from_slice(&decimal_to_bcd(micro, 5));
    out
}

/// Calendar time as `YY MM DD hh mm ss`, each byte BCD
pub fn datetime_to_bcd(at: &NaiveDateTime) -> [u8; 6] {
    [
        bcd_encode((at.year() % 100) as u8),
        bcd_encode(at.month() as u8),
        bcd_encode(at.day() as u8),
        bcd_encode(at.hour() as u8),
        bcd_encode(at.minute() as u8),
        bcd_encode(at.second() as u8),
    ]
}

/// Decode a `YY MM DD hh mm ss` BCD timestamp (years since 2000)
pub fn bcd_to_datetime(bytes: &[u8]) -> Result<NaiveDateTime> {
    if bytes.len() < 6 {
        return Err(WellSimError::decode(format!(
            "timestamp needs 6 bytes, got {}",
            bytes.len()
        )));
    }
    let f: Vec<u32> = bytes[..6].iter().map(|b| u32::from(bcd_decode(*b))).collect();
    chrono::NaiveDate::from_ymd_opt(2000 + f[0] as i32, f[1], f[2])
        .and_then(|d| d.and_hms_opt(f[3], f[4], f[5]))
        .ok_or_else(|| WellSimError::decode("timestamp out of range"))
}

/// Irrigation order number: `YYMMDDhhmmss` followed by a four-digit sequence
pub fn order_number(at: &NaiveDateTime, sequence: u32) -> u64 {
    let year = u64::from((at.year() % 100) as u32);
    year * 100_000_000_000_000
        + u64::from(at.month()) * 1_000_000_000_000
        + u64::from(at.day()) * 10_000_000_000
        + u64::from(at.hour()) * 100_000_000
        + u64::from(at.minute()) * 1_000_000
        + u64::from(at.second()) * 10_000
        + u64::from(sequence % 10_000)
}
