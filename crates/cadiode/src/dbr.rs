// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DBR value sizing.
//!
//! Values travel on the wire in the upstream client library's native DBR
//! layout and are treated as opaque bytes; the only thing the diode needs is
//! their exact size for a given `(type, count)` pair. The tables below mirror
//! the client library's request-buffer structs: seven base value types
//! (string, short, float, enum, char, long, double) in five metadata classes
//! (plain, status, timestamped, graphic, control), plus four special codes.

/// Base value types.
pub const DBR_STRING: u16 = 0;
pub const DBR_SHORT: u16 = 1;
pub const DBR_FLOAT: u16 = 2;
pub const DBR_ENUM: u16 = 3;
pub const DBR_CHAR: u16 = 4;
pub const DBR_LONG: u16 = 5;
pub const DBR_DOUBLE: u16 = 6;

/// Timestamped variants (status + severity + timestamp + value).
pub const DBR_TIME_STRING: u16 = 14;
pub const DBR_TIME_SHORT: u16 = 15;
pub const DBR_TIME_FLOAT: u16 = 16;
pub const DBR_TIME_ENUM: u16 = 17;
pub const DBR_TIME_CHAR: u16 = 18;
pub const DBR_TIME_LONG: u16 = 19;
pub const DBR_TIME_DOUBLE: u16 = 20;

const LAST_BUFFER_TYPE: u16 = 38;

/// Struct size for one element, indexed by DBR type code.
#[rustfmt::skip]
const DBR_SIZE: [usize; 39] = [
    // plain
    40, 2, 4, 2, 1, 4, 8,
    // sts
    44, 6, 8, 6, 6, 8, 16,
    // time
    52, 16, 16, 16, 16, 16, 24,
    // gr
    44, 26, 44, 424, 20, 40, 72,
    // ctrl
    44, 30, 52, 424, 22, 48, 88,
    // put_ackt, put_acks, stsack_string, class_name
    2, 2, 48, 40,
];

/// Size of one additional value element, indexed by DBR type code.
#[rustfmt::skip]
const DBR_VALUE_SIZE: [usize; 39] = [
    40, 2, 4, 2, 1, 4, 8,
    40, 2, 4, 2, 1, 4, 8,
    40, 2, 4, 2, 1, 4, 8,
    40, 2, 4, 2, 1, 4, 8,
    40, 2, 4, 2, 1, 4, 8,
    2, 2, 40, 40,
];

/// Total payload size of a DBR buffer holding `count` elements.
///
/// `count == 0` is treated as a single element, matching the client
/// library's sizing macro. Returns `None` for unknown type codes so the
/// receiver can drop garbage records instead of mis-walking the datagram.
pub fn dbr_size_n(dbr_type: u16, count: u32) -> Option<usize> {
    if dbr_type > LAST_BUFFER_TYPE {
        return None;
    }
    let ix = dbr_type as usize;
    if count == 0 {
        Some(DBR_SIZE[ix])
    } else {
        Some(DBR_SIZE[ix] + (count as usize - 1) * DBR_VALUE_SIZE[ix])
    }
}

/// Maps a base value type to its timestamped variant; non-base codes pass
/// through unchanged.
pub fn to_time_variant(dbr_type: u16) -> u16 {
    if dbr_type <= DBR_DOUBLE {
        dbr_type + DBR_TIME_STRING
    } else {
        dbr_type
    }
}

/// 64-bit content hash for polled-value change detection.
///
/// Values of up to 8 bytes compare exactly via a raw little-endian load;
/// longer values hash with FNV-1a. Never crosses the wire.
pub fn value_hash(bytes: &[u8]) -> u64 {
    if bytes.len() <= 8 {
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(raw)
    } else {
        crate::config::fnv1a_64(bytes)
    }
}
