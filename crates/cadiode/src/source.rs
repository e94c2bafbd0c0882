// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream source adapter.
//!
//! The sender consumes the control-system client library through this
//! trait so the core never links against it directly and tests can feed
//! events from a mock. Handlers are invoked on the adapter's delivery
//! thread; the sender's handlers only touch state behind a mutex shared
//! with the packing loop.

use std::time::Duration;
use thiserror::Error;

/// Opaque per-channel handle issued by [`ChannelSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

/// Adapter-level failure (connection setup, read request).
#[derive(Debug, Error)]
#[error("source error: {0}")]
pub struct SourceError(pub String);

/// Alarm state accompanying a value notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Alarm {
    pub status: u16,
    pub severity: u16,
}

/// Events delivered for a subscribed channel.
#[derive(Debug)]
pub enum SourceEvent<'a> {
    /// Channel (re)connected; reports the native type code and element count.
    Connected { dbr_type: u16, element_count: u32 },
    /// Channel lost.
    Disconnected,
    /// New value. `data` is the channel's native DBR payload for
    /// `(dbr_type, count)`; for timestamped type variants the timestamp and
    /// alarm state are embedded in it as well.
    Value {
        dbr_type: u16,
        count: u32,
        data: &'a [u8],
        /// Source timestamp, unix milliseconds (0 if the source has none).
        timestamp: u64,
        alarm: Alarm,
    },
}

/// Per-channel event callback, invoked on the adapter's delivery thread.
pub type EventHandler = Box<dyn FnMut(SourceEvent<'_>) + Send>;

/// Capability set the sender requires from the upstream client library.
pub trait ChannelSource: Send {
    /// Create the named channel and register its event handler.
    ///
    /// `monitored` channels receive pushed value+alarm notifications with
    /// timestamps; non-monitored (polled) channels receive connection events
    /// and replies to [`read_once`](ChannelSource::read_once) only.
    fn subscribe(
        &mut self,
        name: &str,
        monitored: bool,
        handler: EventHandler,
    ) -> Result<SourceHandle, SourceError>;

    /// Issue a one-shot read; the reply arrives through the channel's
    /// event handler.
    fn read_once(&mut self, handle: SourceHandle) -> Result<(), SourceError>;

    /// Release the channel. After this returns its handler is never
    /// invoked again.
    fn cancel(&mut self, handle: SourceHandle);

    /// Run the client library's event delivery for up to `timeout`.
    /// The sender calls this once per packing-loop tick.
    fn poll(&mut self, timeout: Duration);
}
