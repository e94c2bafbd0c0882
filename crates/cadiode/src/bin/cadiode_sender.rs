// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sender process.
//!
//! The upstream control-system client library is consumed through the
//! [`cadiode::ChannelSource`] trait and is not linked here; this binary runs
//! the sender against a built-in simulation source (ramp values on every
//! configured channel) so a diode pair can be exercised end-to-end without a
//! control system. Embedders construct [`cadiode::Sender`] with their own
//! adapter.

use anyhow::Context;
use cadiode::{
    transport, Alarm, ChannelSource, Config, EventHandler, Sender, SourceError, SourceEvent,
    SourceHandle, DEFAULT_CONFIG_FILENAME, DEFAULT_PORT,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "cadiode-sender", version)]
#[command(about = "Diode sender: emits channel updates toward the receiving side")]
struct Args {
    /// Enable debug output (repeat for trace)
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Runtime in seconds, defaults to forever
    #[arg(short = 'r', value_name = "seconds", default_value_t = 0.0)]
    runtime: f64,

    /// Configuration filename
    #[arg(short = 'c', value_name = "filename", default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,

    /// Space-separated destination list: "ip[:port] [ip[:port] ...]"
    #[arg(value_name = "send_addresses")]
    addresses: String,
}

/// Monitored channels emit a fresh ramp value this often.
const SIM_UPDATE_PERIOD: Duration = Duration::from_secs(1);

struct SimChannel {
    handler: EventHandler,
    monitored: bool,
    is_field: bool,
    announced: bool,
    last_emit: Instant,
    phase: u64,
}

/// Stand-in for the control-system client: every subscribed channel
/// connects immediately and ramps a double value. Bare channels carry the
/// timestamped variant, fields the plain one; polled reads return a value
/// that changes only once a minute so the content-hash dedup is visible.
#[derive(Default)]
struct SimSource {
    channels: Vec<Option<SimChannel>>,
    pending_reads: Vec<usize>,
}

impl SimSource {
    fn emit_value(channel: &mut SimChannel, slow: bool) {
        channel.phase += 1;
        let value = if slow {
            // changes once a minute
            (SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                / 60) as f64
        } else {
            channel.phase as f64 * 0.1
        };

        if channel.is_field {
            let data = value.to_le_bytes();
            (channel.handler)(SourceEvent::Value {
                dbr_type: cadiode::dbr::DBR_DOUBLE,
                count: 1,
                data: &data,
                timestamp: now_millis(),
                alarm: Alarm::default(),
            });
        } else {
            // bare channels carry the timestamped variant, like a monitor
            // subscription would
            let data = encode_time_double(value);
            (channel.handler)(SourceEvent::Value {
                dbr_type: cadiode::dbr::to_time_variant(cadiode::dbr::DBR_DOUBLE),
                count: 1,
                data: &data,
                timestamp: now_millis(),
                alarm: Alarm::default(),
            });
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Native layout of a timestamped scalar double: status, severity,
/// seconds, nanoseconds, pad, value.
fn encode_time_double(value: f64) -> [u8; 24] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut data = [0u8; 24];
    data[4..8].copy_from_slice(&(now.as_secs() as u32).to_le_bytes());
    data[8..12].copy_from_slice(&now.subsec_nanos().to_le_bytes());
    data[16..24].copy_from_slice(&value.to_le_bytes());
    data
}

impl ChannelSource for SimSource {
    fn subscribe(
        &mut self,
        name: &str,
        monitored: bool,
        handler: EventHandler,
    ) -> Result<SourceHandle, SourceError> {
        let handle = self.channels.len() as u64;
        self.channels.push(Some(SimChannel {
            handler,
            monitored,
            is_field: name.contains('.'),
            announced: false,
            last_emit: Instant::now(),
            phase: 0,
        }));
        Ok(SourceHandle(handle))
    }

    fn read_once(&mut self, handle: SourceHandle) -> Result<(), SourceError> {
        self.pending_reads.push(handle.0 as usize);
        Ok(())
    }

    fn cancel(&mut self, handle: SourceHandle) {
        if let Some(slot) = self.channels.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn poll(&mut self, timeout: Duration) {
        for channel in self.channels.iter_mut().flatten() {
            if !channel.announced {
                channel.announced = true;
                (channel.handler)(SourceEvent::Connected {
                    dbr_type: cadiode::dbr::DBR_DOUBLE,
                    element_count: 1,
                });
            }
            if channel.monitored && channel.last_emit.elapsed() >= SIM_UPDATE_PERIOD {
                channel.last_emit = Instant::now();
                Self::emit_value(channel, false);
            }
        }

        for index in std::mem::take(&mut self.pending_reads) {
            if let Some(Some(channel)) = self.channels.get_mut(index) {
                Self::emit_value(channel, true);
            }
        }

        std::thread::sleep(timeout);
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        // help and version print on stdout and terminate normally;
        // argument errors exit with status 1
        Err(err) if !err.use_stderr() => {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };
    init_logging(args.debug);

    let config = Config::from_file(&args.config).context("failed to load configuration")?;
    let destinations = transport::parse_address_list(&args.addresses, DEFAULT_PORT)
        .context("invalid send address list")?;

    let mut sender = Sender::new(&config, destinations, Box::new(SimSource::default()))
        .context("failed to start sender")?;
    sender.run(args.runtime);
    Ok(())
}
