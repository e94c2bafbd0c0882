// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire message headers: encode/decode against the cursor layer.

use super::cursor::{ReadCursor, WriteCursor};
use super::{CodecError, CodecResult, FLAG_LITTLE_ENDIAN, MAGIC};

/// Datagram header (24 bytes).
///
/// ```text
/// 0.. 3: magic "pvAC"
/// 4.. 7: global sequence number (u32, wraps modulo 2^32)
/// 8..15: sender startup time, unix milliseconds
/// 16..23: configuration hash
/// ```
///
/// The global sequence number is stamped per datagram and orders the whole
/// stream; the startup time identifies the sender instance so receivers can
/// reset on restarts; the configuration hash rejects peers whose channel
/// lists disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub global_seq_no: u32,
    pub startup_time: u64,
    pub config_hash: u64,
}

impl PacketHeader {
    pub const SIZE: usize = 24;

    pub fn new(global_seq_no: u32, startup_time: u64, config_hash: u64) -> Self {
        Self {
            global_seq_no,
            startup_time,
            config_hash,
        }
    }

    pub fn encode(&self, w: &mut WriteCursor<'_>) -> CodecResult<()> {
        w.write_bytes(&MAGIC)?;
        w.write_u32(self.global_seq_no)?;
        w.write_u64(self.startup_time)?;
        w.write_u64(self.config_hash)?;
        Ok(())
    }

    pub fn decode(r: &mut ReadCursor<'_>) -> CodecResult<Self> {
        let magic = r.read_bytes(4)?;
        if magic != MAGIC {
            return Err(CodecError::InvalidMagic);
        }
        Ok(Self {
            global_seq_no: r.read_u32()?,
            startup_time: r.read_u64()?,
            config_hash: r.read_u64()?,
        })
    }
}

/// Sub-message header (4 bytes): id, flags, distance to the next header.
///
/// `bytes_to_next_header` is measured from the start of the sub-message
/// payload; 0 means the sub-message runs to the end of the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub id: u8,
    pub flags: u8,
    pub bytes_to_next_header: u16,
}

impl SubmessageHeader {
    pub const SIZE: usize = 4;

    pub fn new(id: u8, bytes_to_next_header: u16) -> Self {
        Self {
            id,
            flags: FLAG_LITTLE_ENDIAN,
            bytes_to_next_header,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.flags & FLAG_LITTLE_ENDIAN != 0
    }

    pub fn encode(&self, w: &mut WriteCursor<'_>) -> CodecResult<()> {
        w.write_u8(self.id)?;
        w.write_u8(self.flags)?;
        w.write_u16(self.bytes_to_next_header)?;
        Ok(())
    }

    pub fn decode(r: &mut ReadCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            id: r.read_u8()?,
            flags: r.read_u8()?,
            bytes_to_next_header: r.read_u16()?,
        })
    }
}

/// `CA_DATA_MESSAGE` payload header (4 bytes): message sequence number and
/// the number of channel records that follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataMessageHeader {
    pub msg_seq_no: u16,
    pub channel_count: u16,
}

impl DataMessageHeader {
    pub const SIZE: usize = 4;

    pub fn encode(&self, w: &mut WriteCursor<'_>) -> CodecResult<()> {
        w.write_u16(self.msg_seq_no)?;
        w.write_u16(self.channel_count)?;
        Ok(())
    }

    pub fn decode(r: &mut ReadCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            msg_seq_no: r.read_u16()?,
            channel_count: r.read_u16()?,
        })
    }
}

/// Channel record header (8 bytes). The value bytes follow, then zero
/// padding to the next 8-byte boundary. `count == 0xFFFF` marks a
/// disconnected channel and suppresses the value bytes entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelRecordHeader {
    pub id: u32,
    pub count: u16,
    pub dbr_type: u16,
}

impl ChannelRecordHeader {
    pub const SIZE: usize = 8;

    pub fn new(id: u32, count: u16, dbr_type: u16) -> Self {
        Self {
            id,
            count,
            dbr_type,
        }
    }

    pub fn encode(&self, w: &mut WriteCursor<'_>) -> CodecResult<()> {
        w.write_u32(self.id)?;
        w.write_u16(self.count)?;
        w.write_u16(self.dbr_type)?;
        Ok(())
    }

    pub fn decode(r: &mut ReadCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            id: r.read_u32()?,
            count: r.read_u16()?,
            dbr_type: r.read_u16()?,
        })
    }
}

/// `CA_FRAG_DATA_MESSAGE` payload header (16 bytes). All fragments of one
/// value share `msg_seq_no`; `fragment_seq_no` starts at 0 and increments
/// per fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragMessageHeader {
    pub msg_seq_no: u16,
    pub fragment_seq_no: u16,
    pub channel_id: u32,
    pub count: u32,
    pub dbr_type: u16,
    pub fragment_size: u16,
}

impl FragMessageHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, w: &mut WriteCursor<'_>) -> CodecResult<()> {
        w.write_u16(self.msg_seq_no)?;
        w.write_u16(self.fragment_seq_no)?;
        w.write_u32(self.channel_id)?;
        w.write_u32(self.count)?;
        w.write_u16(self.dbr_type)?;
        w.write_u16(self.fragment_size)?;
        Ok(())
    }

    pub fn decode(r: &mut ReadCursor<'_>) -> CodecResult<Self> {
        Ok(Self {
            msg_seq_no: r.read_u16()?,
            fragment_seq_no: r.read_u16()?,
            channel_id: r.read_u32()?,
            count: r.read_u32()?,
            dbr_type: r.read_u16()?,
            fragment_size: r.read_u16()?,
        })
    }
}
