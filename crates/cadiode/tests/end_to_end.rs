// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios over loopback UDP: a scripted upstream source, a
//! real sender and receiver on their own threads, and a capturing sink.

mod common;

use cadiode::dbr::{DBR_CHAR, DBR_DOUBLE, DBR_TIME_DOUBLE};
use cadiode::protocol::{
    DataMessageHeader, PacketHeader, ReadCursor, SubmessageHeader, ChannelRecordHeader,
    FLAG_LITTLE_ENDIAN, MAGIC,
};
use cadiode::{Config, ConfigChannel, Sender};
use common::{wait_for, DiodePair, MockEvent, MockSource};
use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::time::Duration;

const DISCONNECTED: u32 = u32::MAX;

fn pair_config(heartbeat_period: f64) -> Config {
    Config {
        min_update_period: 0.025,
        heartbeat_period,
        rate_limit_mbs: 0,
        channels: vec![
            ConfigChannel {
                channel_name: "PS:current".into(),
                extra_fields: vec!["HIGH".into()],
                polled_fields: vec!["EGU".into()],
            },
            ConfigChannel {
                channel_name: "PS:voltage".into(),
                ..Default::default()
            },
        ],
        ..Config::default()
    }
}

// flat indices for pair_config
const IDX_CURRENT: u32 = 0;
const IDX_CURRENT_HIGH: u32 = 1;
const IDX_CURRENT_EGU: u32 = 2;
const IDX_VOLTAGE: u32 = 3;

fn time_double_bytes(value: f64) -> Vec<u8> {
    let mut data = vec![0u8; 24];
    data[16..24].copy_from_slice(&value.to_le_bytes());
    data
}

#[test]
fn value_update_flows_end_to_end_with_its_group() {
    // long heartbeat: neither peer's heartbeat machinery interferes with
    // the first datagram's record order
    let config = pair_config(10.0);
    let pair = DiodePair::start(&config, &config);

    let value = time_double_bytes(12.5);
    pair.control
        .push_value("PS:current", DBR_TIME_DOUBLE, 1, value.clone());

    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        updates.len() >= 3
    }));

    let updates = pair.updates.lock().clone();
    // the group travels as one unit, parent first then fields in config order
    assert_eq!(updates[0].0, IDX_CURRENT);
    assert_eq!(updates[0].1, DBR_TIME_DOUBLE);
    assert_eq!(updates[0].2, 1);
    assert_eq!(updates[0].3, value);
    assert_eq!(updates[1].0, IDX_CURRENT_HIGH);
    assert_eq!(updates[1].2, DISCONNECTED);
    assert_eq!(updates[2].0, IDX_CURRENT_EGU);
    assert_eq!(updates[2].2, DISCONNECTED);
}

#[test]
fn successive_updates_arrive_in_order() {
    let config = pair_config(0.5);
    let pair = DiodePair::start(&config, &config);

    let values: Vec<f64> = vec![1.0, 2.0, 3.0, 4.0];
    for v in &values {
        pair.control
            .push_value("PS:voltage", DBR_DOUBLE, 1, v.to_le_bytes().to_vec());
        std::thread::sleep(Duration::from_millis(60));
    }

    let value_updates = |updates: &[common::Update]| {
        updates
            .iter()
            .filter(|u| u.0 == IDX_VOLTAGE && u.2 != DISCONNECTED)
            .map(|u| f64::from_le_bytes(u.3.as_slice().try_into().unwrap()))
            .collect::<Vec<f64>>()
    };

    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        value_updates(updates).len() >= values.len()
    }));
    let delivered = value_updates(&pair.updates.lock());
    assert_eq!(&delivered[..values.len()], values.as_slice());
}

#[test]
fn upstream_disconnect_propagates_to_sink() {
    let config = pair_config(0.5);
    let pair = DiodePair::start(&config, &config);

    pair.control
        .push_value("PS:voltage", DBR_DOUBLE, 1, 5.0f64.to_le_bytes().to_vec());
    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        updates.iter().any(|u| u.0 == IDX_VOLTAGE && u.2 == 1)
    }));

    pair.control.push("PS:voltage", MockEvent::Disconnected);
    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        let connected_seen = updates
            .iter()
            .position(|u| u.0 == IDX_VOLTAGE && u.2 == 1)
            .unwrap_or(usize::MAX);
        updates
            .iter()
            .enumerate()
            .any(|(i, u)| i > connected_seen && u.0 == IDX_VOLTAGE && u.2 == DISCONNECTED)
    }));
}

#[test]
fn large_value_travels_as_fragments() {
    let config = pair_config(0.5);
    let pair = DiodePair::start(&config, &config);

    // 100 kB char waveform: far over the inline record bound
    let value: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    pair.control
        .push_value("PS:voltage", DBR_CHAR, value.len() as u32, value.clone());

    assert!(wait_for(&pair.updates, Duration::from_secs(5), |updates| {
        updates
            .iter()
            .any(|u| u.0 == IDX_VOLTAGE && u.2 == value.len() as u32)
    }));

    let updates = pair.updates.lock().clone();
    let update = updates
        .iter()
        .find(|u| u.0 == IDX_VOLTAGE && u.2 == value.len() as u32)
        .unwrap();
    assert_eq!(update.1, DBR_CHAR);
    assert_eq!(update.3, value);
}

#[test]
fn heartbeat_rebroadcasts_idle_channels() {
    let config = pair_config(0.3);
    let pair = DiodePair::start(&config, &config);

    let value = 7.25f64.to_le_bytes().to_vec();
    pair.control
        .push_value("PS:voltage", DBR_DOUBLE, 1, value.clone());

    let count_values = |updates: &[common::Update]| {
        updates
            .iter()
            .filter(|u| u.0 == IDX_VOLTAGE && u.2 == 1 && u.3 == value)
            .count()
    };

    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        count_values(updates) >= 1
    }));
    // no further pushes: the next heartbeat re-marks the idle channel and a
    // fresh copy of the same value goes out
    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        count_values(updates) >= 2
    }));
}

#[test]
fn config_mismatch_blocks_all_callbacks() {
    let sender_config = pair_config(0.5);
    let mut receiver_config = pair_config(0.5);
    receiver_config.channels.push(ConfigChannel {
        channel_name: "EXTRA:channel".into(),
        ..Default::default()
    });
    assert_ne!(sender_config.hash(), receiver_config.hash());
    // keep the receiver's liveness sweep out of the picture
    receiver_config.heartbeat_period = 30.0;

    let pair = DiodePair::start(&sender_config, &receiver_config);
    pair.control
        .push_value("PS:voltage", DBR_DOUBLE, 1, 1.0f64.to_le_bytes().to_vec());

    std::thread::sleep(Duration::from_millis(800));
    assert!(pair.updates.lock().is_empty());
}

#[test]
fn silent_sender_triggers_liveness_disconnect() {
    let config = pair_config(0.3);
    let pair = DiodePair::start(&config, &config);

    pair.control
        .push_value("PS:voltage", DBR_DOUBLE, 1, 2.0f64.to_le_bytes().to_vec());
    assert!(wait_for(&pair.updates, Duration::from_secs(2), |updates| {
        updates.iter().any(|u| u.0 == IDX_VOLTAGE && u.2 == 1)
    }));

    pair.stop_sender();
    // two heartbeat periods of silence flip the channel to disconnected
    assert!(wait_for(&pair.updates, Duration::from_secs(4), |updates| {
        let last_value = updates
            .iter()
            .rposition(|u| u.0 == IDX_VOLTAGE && u.2 == 1)
            .unwrap_or(0);
        updates
            .iter()
            .enumerate()
            .any(|(i, u)| i > last_value && u.0 == IDX_VOLTAGE && u.2 == DISCONNECTED)
    }));
}

#[test]
fn emitted_datagrams_decode_with_magic_and_config_hash() {
    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let port = probe.local_addr().unwrap().port();

    // long heartbeat so the only datagram is our update
    let config = pair_config(15.0);
    let config_hash = config.hash();

    let (source, control) = MockSource::new();
    let mut sender = Sender::new(
        &config,
        vec![std::net::SocketAddr::from(([127, 0, 0, 1], port))],
        Box::new(source),
    )
    .unwrap();
    let stop = sender.stop_handle();
    let sender_thread = std::thread::spawn(move || sender.run(0.0));

    let value = 3.5f64.to_le_bytes().to_vec();
    control.push_value("PS:voltage", DBR_DOUBLE, 1, value.clone());

    let mut buf = [0u8; 65_536];
    let (len, _) = probe.recv_from(&mut buf).unwrap();
    stop.store(true, Ordering::Relaxed);
    sender_thread.join().unwrap();

    assert_eq!(&buf[..4], &MAGIC);
    assert_eq!(len % 8, 0);

    let mut r = ReadCursor::new(&buf[..len]);
    let header = PacketHeader::decode(&mut r).unwrap();
    assert_eq!(header.global_seq_no, 1);
    assert_eq!(header.config_hash, config_hash);
    assert!(header.startup_time > 0);

    let sub = SubmessageHeader::decode(&mut r).unwrap();
    assert_eq!(sub.id, 16);
    assert_ne!(sub.flags & FLAG_LITTLE_ENDIAN, 0);

    let msg = DataMessageHeader::decode(&mut r).unwrap();
    assert_eq!(msg.channel_count, 1);

    let record = ChannelRecordHeader::decode(&mut r).unwrap();
    assert_eq!(record.id, IDX_VOLTAGE);
    assert_eq!(record.count, 1);
    assert_eq!(record.dbr_type, DBR_DOUBLE);
    assert_eq!(r.read_bytes(8).unwrap(), value.as_slice());
}
