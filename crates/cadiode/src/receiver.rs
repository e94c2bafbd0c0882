// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver: rebuilds the sender's update stream from UDP datagrams.
//!
//! Per datagram: validate the header (magic, config hash, sender identity),
//! order by the header's global sequence number with a single-slot reorder
//! buffer, then walk the sub-messages and dispatch every channel record to
//! the sink. A liveness sweep flags channels that fall silent for two
//! heartbeat periods and synthesizes one disconnect per transition.

use crate::config::Config;
use crate::dbr;
use crate::protocol::{
    ChannelRecordHeader, DataMessageHeader, FragMessageHeader, PacketHeader, ReadCursor,
    SubmessageHeader, SubmessageId, ALIGNMENT, DISCONNECTED_RECORD_COUNT, DISCONNECTED_SINK_COUNT,
    MAX_DATAGRAM_SIZE,
};
use crate::sink::UpdateSink;
use crate::transport::{UdpReceiver, RECEIVE_TIMEOUT};
use crate::DiodeError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on a reassembled fragmented value.
const MAX_FRAGMENT_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Packets processed per loop iteration before housekeeping runs.
const MAX_PACKETS_PER_ITERATION: u32 = 100;

/// One flat channel on the receiver side. The name is diagnostics only.
struct ReceiverChannel {
    index: u32,
    name: String,
    disconnected: bool,
    last_update: Option<Instant>,
}

/// Reassembly state for the single in-flight fragment stream.
#[derive(Default)]
struct FragmentAssembly {
    buffer: Vec<u8>,
    expected: usize,
    active_msg_seq: Option<u16>,
    last_fragment_seq: u16,
}

impl FragmentAssembly {
    fn begin(&mut self, total: usize) {
        self.buffer.clear();
        self.buffer.reserve(total);
        self.expected = total;
    }

    fn remaining(&self) -> usize {
        self.expected.saturating_sub(self.buffer.len())
    }

    fn abort(&mut self) {
        self.active_msg_seq = None;
    }
}

/// Where an incoming global sequence number falls relative to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderAction {
    /// First packet from this sender instance.
    First,
    /// The expected next packet.
    InOrder,
    /// Exactly one ahead with the slot free: park it.
    Hold,
    /// Duplicate of the parked packet.
    DuplicateHeld,
    /// Old or duplicate (signed 32-bit difference <= 0).
    DropOld,
    /// Jumped past the expected range: packets were lost.
    Gap { lost: u32 },
}

/// Sequence comparison uses the signed 32-bit difference so wrap-around at
/// 2^32 orders correctly; an unsigned compare would call a wrapped sequence
/// number old.
fn classify_order(last: Option<u32>, held: Option<u32>, seq: u32) -> OrderAction {
    let Some(last) = last else {
        return OrderAction::First;
    };
    if seq.wrapping_sub(last) as i32 <= 0 {
        return OrderAction::DropOld;
    }
    let expected = last.wrapping_add(1);
    if seq == expected {
        return OrderAction::InOrder;
    }
    if held == Some(seq) {
        return OrderAction::DuplicateHeld;
    }
    if held.is_none() && seq == expected.wrapping_add(1) {
        return OrderAction::Hold;
    }
    OrderAction::Gap {
        lost: seq.wrapping_sub(expected),
    }
}

/// Invoke the sink with a panic guard: a misbehaving sink must never tear
/// down the receive loop.
fn dispatch_guarded(
    sink: &mut dyn UpdateSink,
    channel_index: u32,
    dbr_type: u16,
    count: u32,
    value: &[u8],
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        sink.on_update(channel_index, dbr_type, count, value)
    }));
    if result.is_err() {
        log::error!(
            "[receiver] Panic escaped out of sink callback for channel {}",
            channel_index
        );
    }
}

/// Datagram-content state machine: sub-message walk, record dispatch,
/// fragment reassembly, liveness. Separate from the socket/ordering layer
/// so held-buffer swaps and packet processing do not fight over borrows.
struct PacketEngine {
    channels: Vec<ReceiverChannel>,
    frag: FragmentAssembly,
    heartbeat_period: Duration,
    last_heartbeat_check: Instant,
    /// Wall-clock reference for the current loop iteration.
    now: Instant,
}

impl PacketEngine {
    /// Walk a validated datagram's sub-messages.
    fn process_packet(&mut self, data: &[u8], sink: &mut dyn UpdateSink) {
        let mut r = ReadCursor::new(data);
        if r.seek(PacketHeader::SIZE).is_err() {
            return;
        }

        while r.has(SubmessageHeader::SIZE) {
            let sub = match SubmessageHeader::decode(&mut r) {
                Ok(sub) => sub,
                Err(_) => return,
            };
            if !sub.is_little_endian() {
                log::warn!(
                    "[receiver] Only little endian ordering supported, dropping rest of packet"
                );
                return;
            }
            let payload_start = r.offset();

            match SubmessageId::from_wire(sub.id) {
                Some(SubmessageId::CaData) => self.handle_data_message(&mut r, sink),
                Some(SubmessageId::CaFragData) => self.handle_frag_message(&mut r, sink),
                None => {
                    log::debug!("[receiver] Skipping unknown sub-message id {}", sub.id);
                }
            }

            if sub.bytes_to_next_header == 0 {
                // sub-message runs to the end of the datagram
                break;
            }
            if r.seek(payload_start + sub.bytes_to_next_header as usize).is_err() {
                log::warn!(
                    "[receiver] Sub-message 'bytes_to_next_header' out of bounds, dropping rest of packet"
                );
                break;
            }
        }
    }

    fn handle_data_message(&mut self, r: &mut ReadCursor<'_>, sink: &mut dyn UpdateSink) {
        let msg = match DataMessageHeader::decode(r) {
            Ok(msg) => msg,
            Err(_) => {
                log::warn!("[receiver] Truncated data sub-message");
                return;
            }
        };

        for _ in 0..msg.channel_count {
            let record = match ChannelRecordHeader::decode(r) {
                Ok(record) => record,
                Err(_) => return,
            };
            let disconnected = record.count == DISCONNECTED_RECORD_COUNT;

            let value_size = if disconnected {
                0
            } else {
                match dbr::dbr_size_n(record.dbr_type, u32::from(record.count)) {
                    Some(size) => size,
                    None => {
                        log::warn!(
                            "[receiver] Unknown DBR type {} for channel {}, dropping rest of sub-message",
                            record.dbr_type,
                            record.id
                        );
                        return;
                    }
                }
            };

            let value = match r.read_bytes(value_size) {
                Ok(value) => value,
                Err(_) => {
                    log::warn!("[receiver] Truncated channel record, dropping rest of sub-message");
                    return;
                }
            };

            if (record.id as usize) < self.channels.len() {
                let channel = &mut self.channels[record.id as usize];
                channel.disconnected = disconnected;
                channel.last_update = Some(self.now);

                let count = if disconnected {
                    DISCONNECTED_SINK_COUNT
                } else {
                    u32::from(record.count)
                };
                dispatch_guarded(sink, record.id, record.dbr_type, count, value);
            }

            if r.skip_align(ALIGNMENT).is_err() {
                return;
            }
        }
    }

    fn handle_frag_message(&mut self, r: &mut ReadCursor<'_>, sink: &mut dyn UpdateSink) {
        let frag = match FragMessageHeader::decode(r) {
            Ok(frag) => frag,
            Err(_) => {
                log::warn!("[receiver] Truncated fragment sub-message");
                return;
            }
        };

        if !self.validate_fragment_sequence(frag.msg_seq_no, frag.fragment_seq_no) {
            log::debug!(
                "[receiver] Dropping out-of-sequence fragment {} (msg {})",
                frag.fragment_seq_no,
                frag.msg_seq_no
            );
            return;
        }

        if (frag.channel_id as usize) >= self.channels.len() {
            return;
        }

        if frag.fragment_seq_no == 0 {
            let total = match dbr::dbr_size_n(frag.dbr_type, frag.count) {
                Some(total) if total <= MAX_FRAGMENT_VALUE_SIZE => total,
                Some(total) => {
                    log::warn!(
                        "[receiver] Fragment stream announces {} bytes, over the {} byte cap",
                        total,
                        MAX_FRAGMENT_VALUE_SIZE
                    );
                    self.frag.abort();
                    return;
                }
                None => {
                    log::warn!(
                        "[receiver] Unknown DBR type {} in fragment stream",
                        frag.dbr_type
                    );
                    self.frag.abort();
                    return;
                }
            };
            self.frag.begin(total);
            log::debug!(
                "[receiver] Expecting {} total bytes of fragments for '{}'",
                total,
                self.channels[frag.channel_id as usize].name
            );
        }

        let data = match r.read_bytes(frag.fragment_size as usize) {
            Ok(data) => data,
            Err(_) => {
                log::warn!("[receiver] Truncated fragment, aborting reassembly");
                self.frag.abort();
                return;
            }
        };

        if self.frag.remaining() >= data.len() {
            self.frag.buffer.extend_from_slice(data);
            log::trace!(
                "[receiver] Received fragment {} ({} bytes remaining)",
                frag.fragment_seq_no,
                self.frag.remaining()
            );

            if self.frag.remaining() == 0 {
                self.channels[frag.channel_id as usize].last_update = Some(self.now);
                dispatch_guarded(
                    sink,
                    frag.channel_id,
                    frag.dbr_type,
                    frag.count,
                    &self.frag.buffer,
                );
                self.frag.abort();
            }
        } else {
            log::debug!("[receiver] Total fragment size out of bounds");
        }
    }

    /// Fragment-stream bookkeeping: fragment 0 opens a stream keyed by its
    /// message sequence number; later fragments must match the key and
    /// arrive strictly in order. Any mismatch abandons the stream.
    fn validate_fragment_sequence(&mut self, msg_seq_no: u16, fragment_seq_no: u16) -> bool {
        if fragment_seq_no == 0 {
            self.frag.active_msg_seq = Some(msg_seq_no);
            self.frag.last_fragment_seq = 0;
            return true;
        }
        if self.frag.active_msg_seq != Some(msg_seq_no) {
            self.frag.abort();
            return false;
        }
        self.frag.last_fragment_seq = self.frag.last_fragment_seq.wrapping_add(1);
        if self.frag.last_fragment_seq == fragment_seq_no {
            true
        } else {
            self.frag.abort();
            false
        }
    }

    /// Flag channels silent for two heartbeat periods, one synthetic
    /// disconnect per transition. A channel that was never updated counts
    /// as silent from the start.
    fn check_liveness(&mut self, sink: &mut dyn UpdateSink) {
        if self.now.duration_since(self.last_heartbeat_check) < self.heartbeat_period {
            return;
        }
        let invalidate_period = self.heartbeat_period * 2;
        for channel in &mut self.channels {
            if channel.disconnected {
                continue;
            }
            let silent = match channel.last_update {
                None => true,
                Some(at) => self.now.duration_since(at) >= invalidate_period,
            };
            if silent {
                channel.disconnected = true;
                log::debug!(
                    "[receiver] Channel '{}' [{}] timed out, marking disconnected",
                    channel.name,
                    channel.index
                );
                dispatch_guarded(sink, channel.index, 0, DISCONNECTED_SINK_COUNT, &[]);
            }
        }
        self.last_heartbeat_check = self.now;
    }
}

/// The diode receiver: socket, sequence ordering, and the packet engine.
pub struct Receiver {
    socket: UdpReceiver,
    config_hash: u64,

    recv_buf: Vec<u8>,
    held_buf: Vec<u8>,
    /// Parked out-of-order packet: (length, sequence number).
    held: Option<(usize, u32)>,

    last_startup_time: u64,
    last_global_seq: Option<u32>,

    engine: PacketEngine,
    stop: Arc<AtomicBool>,
}

impl Receiver {
    pub fn new(config: &Config, listen_address: IpAddr, port: u16) -> Result<Self, DiodeError> {
        log::info!(
            "[receiver] Initializing transport, listening at '{}:{}'",
            listen_address,
            port
        );
        let socket = UdpReceiver::new(listen_address, port)?;

        let flat = config.flat_channels();
        log::info!("[receiver] Creating {} channels", flat.len());
        let channels = flat
            .into_iter()
            .map(|flat| ReceiverChannel {
                index: flat.index,
                name: flat.name,
                disconnected: false,
                last_update: None,
            })
            .collect();

        let now = Instant::now();
        Ok(Self {
            socket,
            config_hash: config.hash(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            held_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            held: None,
            last_startup_time: 0,
            last_global_seq: None,
            engine: PacketEngine {
                channels,
                frag: FragmentAssembly::default(),
                heartbeat_period: Duration::from_secs_f64(config.heartbeat_period),
                last_heartbeat_check: now,
                now,
            },
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bound address (useful when constructed with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Cooperative stop signal, checked once per loop iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Drive the receiver. `runtime_secs <= 0` runs until stopped.
    pub fn run(&mut self, runtime_secs: f64, sink: &mut dyn UpdateSink) {
        let start = Instant::now();
        loop {
            self.engine.now = Instant::now();

            let mut packets_left = MAX_PACKETS_PER_ITERATION;
            while packets_left > 0 {
                match self.receive_once(sink) {
                    Ok(true) => packets_left -= 1,
                    Ok(false) => break,
                    Err(err) => {
                        log::warn!("[receiver] Receive error: {}", err);
                        std::thread::sleep(RECEIVE_TIMEOUT);
                        break;
                    }
                }
            }

            self.engine.now = Instant::now();
            self.engine.check_liveness(sink);

            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if runtime_secs > 0.0 && start.elapsed().as_secs_f64() >= runtime_secs {
                break;
            }
        }
    }

    /// One receive attempt; returns whether a datagram was consumed.
    fn receive_once(&mut self, sink: &mut dyn UpdateSink) -> io::Result<bool> {
        let Some((len, from)) = self.socket.receive(&mut self.recv_buf)? else {
            return Ok(false);
        };
        self.handle_datagram(len, from, sink);
        Ok(true)
    }

    /// Validate and order one datagram sitting in `recv_buf`.
    fn handle_datagram(&mut self, len: usize, from: SocketAddr, sink: &mut dyn UpdateSink) {
        let header = match PacketHeader::decode(&mut ReadCursor::new(&self.recv_buf[..len])) {
            Ok(header) => header,
            Err(_) => {
                log::warn!("[receiver] Invalid header received from '{}'", from);
                return;
            }
        };

        if header.config_hash != self.config_hash {
            log::warn!("[receiver] Configuration mismatch to sender at '{}'", from);
            return;
        }

        if !self.validate_sender(header.startup_time, from) {
            return;
        }

        let seq = header.global_seq_no;
        match classify_order(self.last_global_seq, self.held.map(|(_, s)| s), seq) {
            OrderAction::First => {
                self.last_global_seq = Some(seq);
                self.engine.process_packet(&self.recv_buf[..len], sink);
            }
            OrderAction::InOrder => {
                self.engine.process_packet(&self.recv_buf[..len], sink);
                if let Some((held_len, held_seq)) = self.held.take() {
                    self.engine.process_packet(&self.held_buf[..held_len], sink);
                    self.last_global_seq = Some(held_seq);
                } else {
                    self.last_global_seq = Some(seq);
                }
            }
            OrderAction::Hold => {
                // park the datagram itself, no copy
                std::mem::swap(&mut self.recv_buf, &mut self.held_buf);
                self.held = Some((len, seq));
            }
            OrderAction::DuplicateHeld => {}
            OrderAction::DropOld => {
                log::debug!(
                    "[receiver] Dropped old/duplicate packet: seq {} (expected > {:?})",
                    seq,
                    self.last_global_seq
                );
            }
            OrderAction::Gap { lost } => {
                let expected = self.last_global_seq.unwrap_or(0).wrapping_add(1);
                log::info!(
                    "[receiver] Gap detected: lost {} packet(s) ({}-{})",
                    lost,
                    expected,
                    seq.wrapping_sub(1)
                );
                if let Some((held_len, _)) = self.held.take() {
                    self.engine.process_packet(&self.held_buf[..held_len], sink);
                }
                self.engine.process_packet(&self.recv_buf[..len], sink);
                self.last_global_seq = Some(seq);
            }
        }
    }

    /// Track the sender instance by startup time: newer replaces (and resets
    /// sequence state), equal continues, older is rejected.
    fn validate_sender(&mut self, startup_time: u64, from: SocketAddr) -> bool {
        if startup_time == self.last_startup_time {
            return true;
        }
        if startup_time > self.last_startup_time {
            self.last_startup_time = startup_time;
            self.last_global_seq = None;
            self.held = None;
            return true;
        }
        log::warn!(
            "[receiver] Multiple senders detected, rejecting older sender at '{}'",
            from
        );
        false
    }
}
