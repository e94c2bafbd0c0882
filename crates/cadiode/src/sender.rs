// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sender: mirrors upstream channel state into the diode datagram stream.
//!
//! Channels live in a flat arena indexed by their wire id; field channels
//! reference their parent by index. Any update dirty-marks the parent and
//! enqueues it (once) on a FIFO; the packing loop drains the FIFO into
//! datagrams, always emitting a parent together with its fields. A heartbeat
//! pass re-marks idle channels so receivers can tell silence from loss, and
//! polled fields are sampled with one-shot reads and a content hash.

use crate::config::Config;
use crate::dbr;
use crate::protocol::{
    ChannelRecordHeader, DataMessageHeader, FragMessageHeader, PacketHeader, SubmessageHeader,
    SubmessageId, WriteCursor, ALIGNMENT, DISCONNECTED_RECORD_COUNT, MAX_DATAGRAM_SIZE,
    MAX_RECORD_VALUE_SIZE,
};
use crate::source::{ChannelSource, EventHandler, SourceEvent, SourceHandle};
use crate::transport::UdpSender;
use crate::DiodeError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Floor for the packing-loop tick.
const MIN_UPDATE_PERIOD: f64 = 0.025;
/// Floor for the polled-field sampling period.
const MIN_POLLED_FIELDS_UPDATE_PERIOD: f64 = 3.0;
/// Floor for the heartbeat period.
const MIN_HEARTBEAT_PERIOD: f64 = 0.1;

/// One flat channel on the sender side.
struct SenderChannel {
    index: u32,
    parent_index: u32,
    polled: bool,
    name: String,
    handle: Option<SourceHandle>,

    connected: bool,
    dbr_type: u16,
    count: u32,
    value: Vec<u8>,

    /// Content hash of the last polled value; `None` until the first read.
    value_hash: Option<u64>,

    /// Parent-only packing state.
    pending_update: bool,
    updates_since_heartbeat: u32,
}

impl SenderChannel {
    fn is_parent(&self) -> bool {
        self.index == self.parent_index
    }

    fn record_count(&self) -> u16 {
        if self.connected {
            self.count as u16
        } else {
            DISCONNECTED_RECORD_COUNT
        }
    }

    /// Bytes this channel contributes to an inline datagram: record header
    /// plus value, rounded up to the alignment boundary.
    fn packed_size(&self) -> usize {
        let raw = ChannelRecordHeader::SIZE + self.value.len();
        (raw + ALIGNMENT - 1) & !(ALIGNMENT - 1)
    }
}

/// Channel arena plus the dirty FIFO, shared between the packing loop and
/// the source callback thread. "Enqueue iff not pending" holds because both
/// the flag test and the push happen under this table's lock.
struct ChannelTable {
    channels: Vec<SenderChannel>,
    update_queue: VecDeque<u32>,
}

impl ChannelTable {
    fn from_config(config: &Config) -> Self {
        let channels = config
            .flat_channels()
            .into_iter()
            .map(|flat| SenderChannel {
                index: flat.index,
                parent_index: flat.parent_index,
                polled: flat.polled,
                name: flat.name,
                handle: None,
                connected: false,
                dbr_type: 0,
                count: 0,
                value: Vec::new(),
                value_hash: None,
                pending_update: false,
                updates_since_heartbeat: 0,
            })
            .collect();
        Self {
            channels,
            update_queue: VecDeque::new(),
        }
    }

    /// Dirty-mark: enqueue the owning parent unless it is already queued.
    fn mark_update(&mut self, index: u32) {
        let parent = self.channels[index as usize].parent_index;
        let parent_channel = &mut self.channels[parent as usize];
        if !parent_channel.pending_update {
            parent_channel.pending_update = true;
            parent_channel.updates_since_heartbeat += 1;
            self.update_queue.push_back(parent);
        }
    }

    /// Pop the queue head; `parent` must be the current head.
    fn clear_front(&mut self, parent: u32) {
        let popped = self.update_queue.pop_front();
        debug_assert_eq!(popped, Some(parent));
        self.channels[parent as usize].pending_update = false;
    }

    /// Apply one upstream event to channel `index`.
    fn apply_event(&mut self, index: u32, event: SourceEvent<'_>) {
        let channel = &mut self.channels[index as usize];
        match event {
            SourceEvent::Connected {
                dbr_type,
                element_count,
            } => {
                log::debug!(
                    "[sender] Channel '{}' [{}] connected (type {}, count {})",
                    channel.name,
                    index,
                    dbr_type,
                    element_count
                );
                channel.connected = true;
            }
            SourceEvent::Disconnected => {
                log::debug!("[sender] Channel '{}' [{}] disconnected", channel.name, index);
                channel.connected = false;
                channel.value.clear();
                self.mark_update(index);
            }
            SourceEvent::Value {
                dbr_type,
                count,
                data,
                ..
            } => {
                channel.connected = true;
                channel.dbr_type = dbr_type;
                channel.count = count;
                let size_changed = channel.value.len() != data.len();
                channel.value.clear();
                channel.value.extend_from_slice(data);

                if channel.polled {
                    let hash = dbr::value_hash(data);
                    if channel.value_hash != Some(hash) || size_changed {
                        channel.value_hash = Some(hash);
                        self.mark_update(index);
                    }
                } else {
                    self.mark_update(index);
                }
            }
        }
    }

    /// Heartbeat pass: re-mark every parent that saw no updates in the last
    /// period, reset the counters, and return (connected, re-marked) counts.
    fn mark_heartbeat_updates(&mut self) -> (usize, usize) {
        let connected = self.channels.iter().filter(|c| c.connected).count();
        let mut marked = 0;
        for index in 0..self.channels.len() as u32 {
            if !self.channels[index as usize].is_parent() {
                continue;
            }
            if self.channels[index as usize].updates_since_heartbeat == 0 {
                self.mark_update(index);
                marked += 1;
            }
            self.channels[index as usize].updates_since_heartbeat = 0;
        }
        (connected, marked)
    }

    /// Index range of the group owned by `parent`: the parent itself plus
    /// its contiguous field channels.
    fn group_range(&self, parent: u32) -> std::ops::Range<usize> {
        let start = parent as usize;
        let mut end = start + 1;
        while end < self.channels.len() && self.channels[end].parent_index == parent {
            end += 1;
        }
        start..end
    }

    fn group_value_size(&self, parent: u32) -> usize {
        self.group_range(parent)
            .map(|i| self.channels[i].value.len())
            .sum()
    }

    fn group_packed_size(&self, parent: u32) -> usize {
        self.group_range(parent)
            .map(|i| self.channels[i].packed_size())
            .sum()
    }
}

/// The diode sender: owns the upstream adapter, the shared channel table
/// and the UDP transport, and runs the packing loop.
pub struct Sender {
    update_period: f64,
    pf_iterations: u64,
    hb_iterations: u64,

    startup_time: u64,
    config_hash: u64,
    global_seq_no: u32,
    msg_seq_no: u16,

    source: Box<dyn ChannelSource>,
    table: Arc<Mutex<ChannelTable>>,
    transport: UdpSender,
    send_buffer: Vec<u8>,
    stop: Arc<AtomicBool>,
}

impl Sender {
    pub fn new(
        config: &Config,
        destinations: Vec<SocketAddr>,
        source: Box<dyn ChannelSource>,
    ) -> Result<Self, DiodeError> {
        let update_period = config.min_update_period.max(MIN_UPDATE_PERIOD);
        let pf_period = config
            .polled_fields_update_period
            .max(MIN_POLLED_FIELDS_UPDATE_PERIOD);
        let hb_period = config.heartbeat_period.max(MIN_HEARTBEAT_PERIOD);
        let pf_iterations = ((pf_period / update_period).round() as u64).max(1);
        let hb_iterations = ((hb_period / update_period).round() as u64).max(1);

        log::info!(
            "[sender] Update period {:.3}s, heartbeat period {:.1}s",
            update_period,
            hb_period
        );

        let destination_list = destinations
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        log::info!("[sender] Initializing transport, send list: [{}]", destination_list);
        log::info!("[sender] Send rate-limit set to {}MB/s", config.rate_limit_mbs);

        let transport = UdpSender::new(destinations, config.rate_limit_mbs)?;

        let startup_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let table = Arc::new(Mutex::new(ChannelTable::from_config(config)));

        let mut sender = Self {
            update_period,
            pf_iterations,
            hb_iterations,
            startup_time,
            config_hash: config.hash(),
            global_seq_no: 0,
            msg_seq_no: 0,
            source,
            table,
            transport,
            send_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            stop: Arc::new(AtomicBool::new(false)),
        };
        sender.create_channels();
        Ok(sender)
    }

    /// Subscribe every flat channel with the upstream adapter. A failed
    /// subscription leaves the channel permanently disconnected; the
    /// heartbeat will keep broadcasting it as such.
    fn create_channels(&mut self) {
        let channel_count = self.table.lock().channels.len();
        log::info!("[sender] Creating {} channels", channel_count);

        for index in 0..channel_count as u32 {
            let (name, polled) = {
                let table = self.table.lock();
                let channel = &table.channels[index as usize];
                (channel.name.clone(), channel.polled)
            };
            log::debug!("[sender] Creating channel: [{}] '{}'", index, name);

            let table = Arc::clone(&self.table);
            let handler: EventHandler = Box::new(move |event| {
                table.lock().apply_event(index, event);
            });

            match self.source.subscribe(&name, !polled, handler) {
                Ok(handle) => {
                    self.table.lock().channels[index as usize].handle = Some(handle);
                }
                Err(err) => {
                    log::error!(
                        "[sender] Failed to create channel '{}': {}",
                        name,
                        err
                    );
                }
            }
        }
    }

    /// Cooperative stop signal, checked once per loop iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Drive the sender. `runtime_secs <= 0` runs until stopped.
    pub fn run(&mut self, runtime_secs: f64) {
        let iterations = if runtime_secs > 0.0 {
            ((runtime_secs / self.update_period).round() as u64).max(1)
        } else {
            u64::MAX
        };
        let tick = Duration::from_secs_f64(self.update_period);

        let mut iteration: u64 = 0;
        while !self.stop.load(Ordering::Relaxed) {
            self.source.poll(tick);

            iteration += 1;

            if iteration % self.pf_iterations == 0 {
                self.check_polled_fields();
            }
            if iteration % self.hb_iterations == 0 {
                self.mark_heartbeat_updates();
            }

            self.send_updates();

            if iteration >= iterations {
                break;
            }
        }
    }

    /// Issue one-shot reads for every polled channel.
    fn check_polled_fields(&mut self) {
        log::debug!("[sender] Polled fields check");
        let handles: Vec<(String, SourceHandle)> = {
            let table = self.table.lock();
            table
                .channels
                .iter()
                .filter(|c| c.polled)
                .filter_map(|c| c.handle.map(|h| (c.name.clone(), h)))
                .collect()
        };
        for (name, handle) in handles {
            if let Err(err) = self.source.read_once(handle) {
                log::debug!("[sender] Polled read of '{}' failed: {}", name, err);
            }
        }
    }

    fn mark_heartbeat_updates(&mut self) {
        log::debug!("[sender] Heartbeat check");
        let (connected, marked, total) = {
            let mut table = self.table.lock();
            let (connected, marked) = table.mark_heartbeat_updates();
            (connected, marked, table.channels.len())
        };
        if total > 0 {
            log::info!(
                "[sender] {} of {} ({}%) connected, {} ({}%) without updates in the last heartbeat period",
                connected,
                total,
                100 * connected / total,
                marked,
                100 * marked / total
            );
        }
    }

    fn next_global_seq(&mut self) -> u32 {
        self.global_seq_no = self.global_seq_no.wrapping_add(1);
        self.global_seq_no
    }

    fn next_msg_seq(&mut self) -> u16 {
        let seq = self.msg_seq_no;
        self.msg_seq_no = self.msg_seq_no.wrapping_add(1);
        seq
    }

    /// Drain the update queue into datagrams.
    fn send_updates(&mut self) {
        let table = Arc::clone(&self.table);
        let mut table = table.lock();

        while let Some(&parent) = table.update_queue.front() {
            // A group whose raw value bytes cannot fit one record goes the
            // fragment way immediately.
            if table.group_value_size(parent) > MAX_RECORD_VALUE_SIZE {
                self.send_group_fragmented(&table, parent);
                table.clear_front(parent);
                continue;
            }

            let packed = self.pack_inline_datagram(&mut table);
            if packed == 0 {
                // Head group exceeds the datagram through record-count
                // overhead alone; decompose it like an oversize group.
                let parent = *table.update_queue.front().expect("queue head");
                self.send_group_fragmented(&table, parent);
                table.clear_front(parent);
            }
        }
    }

    /// Build and send one CA_DATA datagram from the queue head. Returns the
    /// number of records packed; groups are never split across datagrams.
    fn pack_inline_datagram(&mut self, table: &mut ChannelTable) -> usize {
        let header = PacketHeader::new(self.next_global_seq(), self.startup_time, self.config_hash);
        let msg_seq = self.next_msg_seq();

        // Headers always fit: the buffer is a full datagram.
        let mut record_count: u16 = 0;
        let mut w = WriteCursor::new(&mut self.send_buffer);
        let wire_len = (|| -> crate::protocol::CodecResult<usize> {
            header.encode(&mut w)?;
            SubmessageHeader::new(SubmessageId::CaData as u8, 0).encode(&mut w)?;
            DataMessageHeader {
                msg_seq_no: msg_seq,
                channel_count: 0,
            }
            .encode(&mut w)?;
            let count_offset = w.offset() - 2;

            while let Some(&parent) = table.update_queue.front() {
                if table.group_value_size(parent) > MAX_RECORD_VALUE_SIZE {
                    break;
                }
                if table.group_packed_size(parent) > w.remaining() {
                    break;
                }
                for i in table.group_range(parent) {
                    let channel = &table.channels[i];
                    ChannelRecordHeader::new(channel.index, channel.record_count(), channel.dbr_type)
                        .encode(&mut w)?;
                    if channel.connected {
                        w.write_bytes(&channel.value)?;
                    }
                    w.pad_align(ALIGNMENT)?;
                    record_count += 1;
                }
                table.clear_front(parent);
            }

            w.patch_u16(count_offset, record_count)?;
            w.pad_align(ALIGNMENT)?;
            Ok(w.offset())
        })();

        match wire_len {
            Ok(len) if record_count > 0 => {
                log::debug!("[sender] Sending {} update(s)", record_count);
                self.transport.send(&self.send_buffer[..len]);
                record_count as usize
            }
            Ok(_) => {
                // Nothing packed; roll the sequence numbers back so the
                // receiver does not log a phantom gap.
                self.global_seq_no = self.global_seq_no.wrapping_sub(1);
                self.msg_seq_no = self.msg_seq_no.wrapping_sub(1);
                0
            }
            Err(err) => {
                log::error!("[sender] Datagram encode failed: {}", err);
                0
            }
        }
    }

    /// Emit an over-size group: inline-sized members batched into CA_DATA
    /// datagrams, oversized members each as their own fragment stream.
    fn send_group_fragmented(&mut self, table: &ChannelTable, parent: u32) {
        let range = table.group_range(parent);

        let mut inline: Vec<usize> = Vec::new();
        for i in range {
            let channel = &table.channels[i];
            if channel.connected && channel.value.len() > MAX_RECORD_VALUE_SIZE {
                self.send_fragment_stream(channel);
            } else {
                inline.push(i);
            }
        }
        self.send_inline_records(table, &inline);
    }

    /// Send a run of individual records, packing as many per datagram as fit.
    fn send_inline_records(&mut self, table: &ChannelTable, indices: &[usize]) {
        let mut pending = indices;
        while !pending.is_empty() {
            let header =
                PacketHeader::new(self.next_global_seq(), self.startup_time, self.config_hash);
            let msg_seq = self.next_msg_seq();

            let mut record_count: u16 = 0;
            let mut w = WriteCursor::new(&mut self.send_buffer);
            let wire_len = (|| -> crate::protocol::CodecResult<usize> {
                header.encode(&mut w)?;
                SubmessageHeader::new(SubmessageId::CaData as u8, 0).encode(&mut w)?;
                DataMessageHeader {
                    msg_seq_no: msg_seq,
                    channel_count: 0,
                }
                .encode(&mut w)?;
                let count_offset = w.offset() - 2;

                while let Some(&i) = pending.first() {
                    let channel = &table.channels[i];
                    if channel.packed_size() > w.remaining() {
                        break;
                    }
                    ChannelRecordHeader::new(channel.index, channel.record_count(), channel.dbr_type)
                        .encode(&mut w)?;
                    if channel.connected {
                        w.write_bytes(&channel.value)?;
                    }
                    w.pad_align(ALIGNMENT)?;
                    record_count += 1;
                    pending = &pending[1..];
                }

                w.patch_u16(count_offset, record_count)?;
                w.pad_align(ALIGNMENT)?;
                Ok(w.offset())
            })();

            match wire_len {
                Ok(len) if record_count > 0 => {
                    self.transport.send(&self.send_buffer[..len]);
                }
                Ok(_) => {
                    self.global_seq_no = self.global_seq_no.wrapping_sub(1);
                    self.msg_seq_no = self.msg_seq_no.wrapping_sub(1);
                    break;
                }
                Err(err) => {
                    log::error!("[sender] Datagram encode failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Stream one channel's value as CA_FRAG datagrams: shared message
    /// sequence number, fragment sequence from 0, each fragment as large as
    /// the datagram allows.
    fn send_fragment_stream(&mut self, channel: &SenderChannel) {
        let msg_seq = self.next_msg_seq();
        let mut fragment_seq: u16 = 0;
        let mut offset = 0usize;

        log::debug!(
            "[sender] Sending fragmented data for channel '{}' ({} bytes)",
            channel.name,
            channel.value.len()
        );

        while offset < channel.value.len() {
            let header =
                PacketHeader::new(self.next_global_seq(), self.startup_time, self.config_hash);

            let mut w = WriteCursor::new(&mut self.send_buffer);
            let wire_len = (|| -> crate::protocol::CodecResult<usize> {
                header.encode(&mut w)?;
                SubmessageHeader::new(SubmessageId::CaFragData as u8, 0).encode(&mut w)?;

                let space = w.remaining() - FragMessageHeader::SIZE;
                let fragment_size = (channel.value.len() - offset).min(space) as u16;

                FragMessageHeader {
                    msg_seq_no: msg_seq,
                    fragment_seq_no: fragment_seq,
                    channel_id: channel.index,
                    count: channel.count,
                    dbr_type: channel.dbr_type,
                    fragment_size,
                }
                .encode(&mut w)?;
                w.write_bytes(&channel.value[offset..offset + fragment_size as usize])?;
                w.pad_align(ALIGNMENT)?;

                offset += fragment_size as usize;
                Ok(w.offset())
            })();

            match wire_len {
                Ok(len) => {
                    log::trace!(
                        "[sender] Sending fragment {} ({} bytes remaining)",
                        fragment_seq,
                        channel.value.len() - offset
                    );
                    fragment_seq = fragment_seq.wrapping_add(1);
                    self.transport.send(&self.send_buffer[..len]);
                }
                Err(err) => {
                    log::error!("[sender] Fragment encode failed: {}", err);
                    return;
                }
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        // Release upstream handles before the adapter goes away so no
        // callback fires into a dead table.
        let handles: Vec<SourceHandle> = {
            let mut table = self.table.lock();
            table.channels.iter_mut().filter_map(|c| c.handle.take()).collect()
        };
        for handle in handles {
            self.source.cancel(handle);
        }
    }
}
