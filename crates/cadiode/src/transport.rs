// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport: multi-destination send with byte-rate limiting, and a
//! receive socket with a short timeout so the receive loop can service
//! housekeeping without traffic.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// Default diode port.
pub const DEFAULT_PORT: u16 = 5080;

/// Receive timeout; bounds the receiver's housekeeping latency.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(250);

/// Rate reports are emitted at most this often.
const RATE_REPORT_PERIOD_US: u64 = 3_000_000;

/// Parse a whitespace-separated list of `ip[:port]` destinations.
/// Entries without an explicit port get `default_port`.
pub fn parse_address_list(list: &str, default_port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut addresses = Vec::new();
    for entry in list.split_whitespace() {
        let addr = entry
            .parse::<SocketAddr>()
            .or_else(|_| entry.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, default_port)))
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid address '{}': {}", entry, e),
                )
            })?;
        addresses.push(addr);
    }
    if addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty address list",
        ));
    }
    Ok(addresses)
}

/// Average-throughput limiter: from the previous datagram's size and the
/// configured MB/s rate, compute the minimum inter-datagram gap and sleep
/// for the deficit. With 1 MB/s equal to 1 byte/us the gap in microseconds
/// is simply `bytes / rate`.
struct RateLimiter {
    rate_limit_mbs: u32,
    last_sent_bytes: u64,
    last_sent_time: Option<Instant>,
    report_bytes: u64,
    report_period_us: u64,
}

impl RateLimiter {
    fn new(rate_limit_mbs: u32) -> Self {
        Self {
            rate_limit_mbs,
            last_sent_bytes: 0,
            last_sent_time: None,
            report_bytes: 0,
            report_period_us: 0,
        }
    }

    /// Sleep off the deficit left by the previous datagram.
    fn pace(&mut self) {
        let Some(last_time) = self.last_sent_time else {
            return;
        };
        let required = Duration::from_micros(required_gap_us(
            self.last_sent_bytes,
            self.rate_limit_mbs,
        ));
        let elapsed = last_time.elapsed();
        if required > elapsed {
            std::thread::sleep(required - elapsed);
        }

        self.report_bytes += self.last_sent_bytes;
        self.report_period_us += elapsed.as_micros() as u64;
        if self.report_period_us >= RATE_REPORT_PERIOD_US {
            let rate_mbs = self.report_bytes as f64 / self.report_period_us as f64;
            self.report_bytes = 0;
            self.report_period_us = 0;
            log::info!("[transport] Send rate: {:.3}MB/s", rate_mbs);
        }
    }

    fn record(&mut self, bytes: u64) {
        self.last_sent_bytes = bytes;
        self.last_sent_time = Some(Instant::now());
    }
}

fn required_gap_us(bytes: u64, rate_limit_mbs: u32) -> u64 {
    bytes / u64::from(rate_limit_mbs)
}

/// Sending half: one socket, one or more destinations, every datagram goes
/// to all of them in order.
pub struct UdpSender {
    socket: UdpSocket,
    destinations: Vec<SocketAddr>,
    limiter: Option<RateLimiter>,
}

impl UdpSender {
    /// `rate_limit_mbs == 0` disables limiting.
    pub fn new(destinations: Vec<SocketAddr>, rate_limit_mbs: u32) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            socket,
            destinations,
            limiter: (rate_limit_mbs > 0).then(|| RateLimiter::new(rate_limit_mbs)),
        })
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    /// Fan the datagram out to every destination. Transient send errors are
    /// logged and swallowed; the next heartbeat rebroadcasts anyway.
    pub fn send(&mut self, buffer: &[u8]) {
        if let Some(limiter) = &mut self.limiter {
            limiter.pace();
        }

        for address in &self.destinations {
            match self.socket.send_to(buffer, address) {
                Ok(sent) => {
                    if let Some(limiter) = &mut self.limiter {
                        limiter.record(sent as u64);
                    }
                    log::trace!("[transport] Sent {} bytes to {}", sent, address);
                }
                Err(err) => {
                    log::debug!("[transport] Send error to {}: {}", address, err);
                }
            }
        }
    }
}

/// Receiving half: bound socket with a fixed 250 ms read timeout.
pub struct UdpReceiver {
    socket: UdpSocket,
}

impl UdpReceiver {
    pub fn new(listen_address: IpAddr, port: u16) -> io::Result<Self> {
        let bind_addr = SocketAddr::new(listen_address, port);
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        log::debug!("[transport] Listening on '{}'", bind_addr);
        Ok(Self { socket })
    }

    /// One receive attempt. `Ok(None)` on timeout.
    pub fn receive(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buffer) {
            Ok((len, from)) => {
                log::trace!("[transport] Received {} bytes from {}", len, from);
                Ok(Some((len, from)))
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
