// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # cadiode - one-way channel bridge over UDP
//!
//! A "data diode" publisher/subscriber bridge for a fleet of named, typed
//! measurement channels from an industrial control network. A sender mirrors
//! live channel updates into UDP datagrams toward one or more receivers on a
//! firewalled or air-gapped side; receivers rebuild the stream and hand each
//! update to a local sink. There is no reverse channel: the protocol rides
//! out loss, duplication, reorder and sender restarts without a single
//! acknowledgement.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  upstream client library          local record store               |
//! |        |  ChannelSource                 ^  UpdateSink              |
//! +--------|--------------------------------|--------------------------+
//! |      Sender                           Receiver                     |
//! |  channel arena + dirty FIFO       header checks + global ordering  |
//! |  heartbeat + polled sampling      fragment reassembly + liveness   |
//! +--------|--------------------------------|--------------------------+
//! |                        Wire protocol                               |
//! |  24-byte header | sub-messages | channel records | fragments       |
//! +--------|--------------------------------|--------------------------+
//! |                        UDP transport                               |
//! |  multi-destination fan-out + rate limit | 250 ms receive timeout   |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Both peers load the same configuration file; its flat channel expansion
//! defines the wire channel indices and its 64-bit hash is carried in every
//! datagram so mismatched peers refuse each other.
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Config`] | Channel list and periods shared by both peers |
//! | [`Sender`] | Subscribes upstream, packs and emits datagrams |
//! | [`Receiver`] | Validates, orders and dispatches datagrams |
//! | [`ChannelSource`] | Adapter to the upstream client library |
//! | [`UpdateSink`] | Adapter to the downstream record store |

pub mod config;
pub mod dbr;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod source;
pub mod transport;

pub use config::{Config, ConfigChannel, ConfigError, FlatChannel, DEFAULT_CONFIG_FILENAME};
pub use receiver::Receiver;
pub use sender::Sender;
pub use sink::UpdateSink;
pub use source::{Alarm, ChannelSource, EventHandler, SourceError, SourceEvent, SourceHandle};
pub use transport::DEFAULT_PORT;

use thiserror::Error;

/// Top-level error for sender/receiver startup.
#[derive(Debug, Error)]
pub enum DiodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
