// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test harness: a scriptable upstream source, a capturing sink, and a
//! sender/receiver pair wired over loopback UDP.

use cadiode::{
    Alarm, ChannelSource, Config, EventHandler, Receiver, Sender, SourceError, SourceEvent,
    SourceHandle,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub enum MockEvent {
    Connected { dbr_type: u16, element_count: u32 },
    Disconnected,
    Value { dbr_type: u16, count: u32, data: Vec<u8> },
}

#[derive(Default)]
struct MockInner {
    by_name: HashMap<String, usize>,
    handlers: Vec<EventHandler>,
    pending: Vec<(usize, MockEvent)>,
}

/// Upstream adapter whose events are scripted by the test through
/// [`MockControl`]. Events queued by the test are delivered on the sender
/// thread during `poll`, like a real client library's event drain.
pub struct MockSource {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Clone)]
pub struct MockControl {
    inner: Arc<Mutex<MockInner>>,
}

impl MockSource {
    pub fn new() -> (Self, MockControl) {
        let inner = Arc::new(Mutex::new(MockInner::default()));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MockControl { inner },
        )
    }
}

impl MockControl {
    pub fn push(&self, name: &str, event: MockEvent) {
        let mut inner = self.inner.lock();
        let index = *inner
            .by_name
            .get(name)
            .unwrap_or_else(|| panic!("no subscription for channel '{}'", name));
        inner.pending.push((index, event));
    }

    pub fn push_value(&self, name: &str, dbr_type: u16, count: u32, data: Vec<u8>) {
        self.push(
            name,
            MockEvent::Value {
                dbr_type,
                count,
                data,
            },
        );
    }
}

impl ChannelSource for MockSource {
    fn subscribe(
        &mut self,
        name: &str,
        _monitored: bool,
        handler: EventHandler,
    ) -> Result<SourceHandle, SourceError> {
        let mut inner = self.inner.lock();
        let index = inner.handlers.len();
        inner.by_name.insert(name.to_string(), index);
        inner.handlers.push(handler);
        Ok(SourceHandle(index as u64))
    }

    fn read_once(&mut self, _handle: SourceHandle) -> Result<(), SourceError> {
        Ok(())
    }

    fn cancel(&mut self, _handle: SourceHandle) {}

    fn poll(&mut self, timeout: Duration) {
        {
            let mut inner = self.inner.lock();
            let pending = std::mem::take(&mut inner.pending);
            for (index, event) in pending {
                let handler = &mut inner.handlers[index];
                match event {
                    MockEvent::Connected {
                        dbr_type,
                        element_count,
                    } => handler(SourceEvent::Connected {
                        dbr_type,
                        element_count,
                    }),
                    MockEvent::Disconnected => handler(SourceEvent::Disconnected),
                    MockEvent::Value {
                        dbr_type,
                        count,
                        data,
                    } => handler(SourceEvent::Value {
                        dbr_type,
                        count,
                        data: &data,
                        timestamp: 0,
                        alarm: Alarm::default(),
                    }),
                }
            }
        }
        std::thread::sleep(timeout);
    }
}

pub type Update = (u32, u16, u32, Vec<u8>);
pub type Updates = Arc<Mutex<Vec<Update>>>;

/// Poll the captured updates until `predicate` holds or `timeout` passes.
pub fn wait_for<F>(updates: &Updates, timeout: Duration, predicate: F) -> bool
where
    F: Fn(&[Update]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate(&updates.lock()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A running sender/receiver pair on loopback.
pub struct DiodePair {
    pub control: MockControl,
    pub updates: Updates,
    sender_stop: Arc<AtomicBool>,
    receiver_stop: Arc<AtomicBool>,
    sender_thread: Option<JoinHandle<()>>,
    receiver_thread: Option<JoinHandle<()>>,
}

impl DiodePair {
    pub fn start(sender_config: &Config, receiver_config: &Config) -> Self {
        let mut receiver =
            Receiver::new(receiver_config, "127.0.0.1".parse().unwrap(), 0).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let (source, control) = MockSource::new();
        let mut sender = Sender::new(
            sender_config,
            vec![std::net::SocketAddr::from(([127, 0, 0, 1], port))],
            Box::new(source),
        )
        .unwrap();

        let sender_stop = sender.stop_handle();
        let receiver_stop = receiver.stop_handle();

        let updates: Updates = Arc::new(Mutex::new(Vec::new()));
        let sink_updates = Arc::clone(&updates);

        let receiver_thread = std::thread::spawn(move || {
            let mut sink = move |index: u32, dbr_type: u16, count: u32, value: &[u8]| {
                sink_updates.lock().push((index, dbr_type, count, value.to_vec()));
            };
            receiver.run(0.0, &mut sink);
        });
        let sender_thread = std::thread::spawn(move || {
            sender.run(0.0);
        });

        Self {
            control,
            updates,
            sender_stop,
            receiver_stop,
            sender_thread: Some(sender_thread),
            receiver_thread: Some(receiver_thread),
        }
    }
}

impl DiodePair {
    /// Stop only the sending side; the receiver keeps running.
    pub fn stop_sender(&self) {
        self.sender_stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for DiodePair {
    fn drop(&mut self) {
        self.sender_stop.store(true, Ordering::Relaxed);
        self.receiver_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sender_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receiver_thread.take() {
            let _ = handle.join();
        }
    }
}
