// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diode wire protocol.
//!
//! A datagram is a 24-byte packet header followed by one or more
//! sub-messages. Each sub-message starts with a 4-byte header and is
//! zero-padded to an 8-byte boundary. All integers are little-endian.
//!
//! Sub-messages in scope:
//!
//! - `CA_DATA_MESSAGE` (16): a batch of channel records, each carrying one
//!   channel's current value (or a disconnect marker)
//! - `CA_FRAG_DATA_MESSAGE` (17): one fragment of a value too large to fit a
//!   single datagram

pub mod cursor;
pub mod messages;

pub use cursor::{ReadCursor, WriteCursor};
pub use messages::{
    ChannelRecordHeader, DataMessageHeader, FragMessageHeader, PacketHeader, SubmessageHeader,
};

/// Datagram magic, `pvAC`.
pub const MAGIC: [u8; 4] = [0x70, 0x76, 0x41, 0x43];

/// Protocol revision implemented by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum datagram payload: largest 8-byte-aligned size that fits a
/// worst-case IPv4 UDP packet (non-aligned limit is 65507).
pub const MAX_DATAGRAM_SIZE: usize = 65_504;

/// Sub-message payloads and channel records are padded to this boundary.
pub const ALIGNMENT: usize = 8;

/// Sub-message flags, bit 0: little-endian encoding. Required; there is no
/// big-endian wire format.
pub const FLAG_LITTLE_ENDIAN: u8 = 0x01;

/// In-band disconnect marker in a channel record's `count`.
pub const DISCONNECTED_RECORD_COUNT: u16 = 0xFFFF;

/// Disconnect marker across the sink boundary.
pub const DISCONNECTED_SINK_COUNT: u32 = u32::MAX;

/// Largest inline value a single channel record can carry. Anything bigger
/// must travel as a fragment stream.
pub const MAX_RECORD_VALUE_SIZE: usize = MAX_DATAGRAM_SIZE
    - PacketHeader::SIZE
    - SubmessageHeader::SIZE
    - DataMessageHeader::SIZE
    - ChannelRecordHeader::SIZE;

/// Closed set of sub-message kinds understood by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmessageId {
    CaData = 16,
    CaFragData = 17,
}

impl SubmessageId {
    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            16 => Some(SubmessageId::CaData),
            17 => Some(SubmessageId::CaFragData),
            _ => None,
        }
    }
}

/// Result type for wire encoding/decoding.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Read or write past the end of the buffer.
    Overrun { offset: usize, needed: usize },
    /// Datagram does not start with the `pvAC` magic.
    InvalidMagic,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Overrun { offset, needed } => {
                write!(f, "buffer overrun at offset {} (needed {} bytes)", offset, needed)
            }
            CodecError::InvalidMagic => write!(f, "invalid packet magic"),
        }
    }
}

impl std::error::Error for CodecError {}
