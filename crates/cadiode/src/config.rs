// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diode configuration.
//!
//! Both peers load the same JSON file and must expand it to the same flat
//! channel list: the position of a channel in that expansion is its wire
//! identifier, and a 64-bit hash over every configured field is exchanged in
//! each datagram so peers with diverging files refuse to talk.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Default configuration filename looked up in the working directory.
pub const DEFAULT_CONFIG_FILENAME: &str = "diode.json";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One configured channel: a bare channel plus optional subscribed extra
/// fields and periodically polled fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChannel {
    pub channel_name: String,
    pub extra_fields: Vec<String>,
    pub polled_fields: Vec<String>,
}

/// Process-wide immutable configuration bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Sender tick period in seconds.
    pub min_update_period: f64,
    /// Polled-field sampling period in seconds.
    pub polled_fields_update_period: f64,
    /// Heartbeat refresh period in seconds.
    pub heartbeat_period: f64,
    /// Send rate limit in MB/s; 0 disables limiting.
    pub rate_limit_mbs: u32,
    /// Channels in file order. File order defines the wire channel index.
    pub channels: Vec<ConfigChannel>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_update_period: 0.1,
            polled_fields_update_period: 5.0,
            heartbeat_period: 15.0,
            rate_limit_mbs: 64,
            channels: Vec::new(),
        }
    }
}

/// A single entry of the flat channel expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatChannel {
    pub index: u32,
    /// Index of the owning bare channel; equals `index` for bare channels.
    pub parent_index: u32,
    pub name: String,
    pub polled: bool,
}

impl FlatChannel {
    pub fn is_parent(&self) -> bool {
        self.index == self.parent_index
    }
}

const KNOWN_KEYS: [&str; 5] = [
    "min_update_period",
    "polled_fields_update_period",
    "heartbeat_period",
    "rate_limit_mbs",
    "channel_names",
];

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_min_update_period")]
    min_update_period: f64,
    #[serde(default = "default_polled_fields_update_period")]
    polled_fields_update_period: f64,
    #[serde(default = "default_heartbeat_period")]
    heartbeat_period: f64,
    #[serde(default = "default_rate_limit_mbs")]
    rate_limit_mbs: u32,
    #[serde(default)]
    channel_names: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChannelFields {
    #[serde(default)]
    extra_fields: Vec<String>,
    #[serde(default)]
    polled_fields: Vec<String>,
}

fn default_min_update_period() -> f64 {
    0.1
}

fn default_polled_fields_update_period() -> f64 {
    5.0
}

fn default_heartbeat_period() -> f64 {
    15.0
}

fn default_rate_limit_mbs() -> u32 {
    64
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::info!("[config] Loading configuration from '{}'", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let doc: serde_json::Value = serde_json::from_str(content)?;

        if let Some(map) = doc.as_object() {
            for key in map.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    log::warn!("[config] Unknown configuration node: '{}'", key);
                }
            }
        }

        let raw: RawConfig = serde_json::from_value(doc)?;

        let mut channels = Vec::with_capacity(raw.channel_names.len());
        for (name, value) in raw.channel_names {
            let fields: RawChannelFields = serde_json::from_value(value)?;
            channels.push(ConfigChannel {
                channel_name: name,
                extra_fields: fields.extra_fields,
                polled_fields: fields.polled_fields,
            });
        }

        let config = Config {
            min_update_period: raw.min_update_period,
            polled_fields_update_period: raw.polled_fields_update_period,
            heartbeat_period: raw.heartbeat_period,
            rate_limit_mbs: raw.rate_limit_mbs,
            channels,
        };
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check period values and channel names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, period) in [
            ("min_update_period", self.min_update_period),
            (
                "polled_fields_update_period",
                self.polled_fields_update_period,
            ),
            ("heartbeat_period", self.heartbeat_period),
        ] {
            if !period.is_finite() || period <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number of seconds",
                    name
                )));
            }
        }
        for channel in &self.channels {
            if channel.channel_name.is_empty() {
                return Err(ConfigError::Invalid("empty channel name".into()));
            }
        }
        Ok(())
    }

    /// Number of entries in the flat channel expansion.
    pub fn total_channel_count(&self) -> usize {
        self.channels
            .iter()
            .map(|c| 1 + c.extra_fields.len() + c.polled_fields.len())
            .sum()
    }

    /// Expand the channel list: each bare channel, then its extra fields,
    /// then its polled fields, each as `name.FIELD`. Position in this
    /// sequence is the channel's wire index.
    pub fn flat_channels(&self) -> Vec<FlatChannel> {
        let mut flat = Vec::with_capacity(self.total_channel_count());
        for channel in &self.channels {
            let parent_index = flat.len() as u32;
            flat.push(FlatChannel {
                index: parent_index,
                parent_index,
                name: channel.channel_name.clone(),
                polled: false,
            });
            for field in &channel.extra_fields {
                flat.push(FlatChannel {
                    index: flat.len() as u32,
                    parent_index,
                    name: format!("{}.{}", channel.channel_name, field),
                    polled: false,
                });
            }
            for field in &channel.polled_fields {
                flat.push(FlatChannel {
                    index: flat.len() as u32,
                    parent_index,
                    name: format!("{}.{}", channel.channel_name, field),
                    polled: true,
                });
            }
        }
        flat
    }

    /// Configuration fingerprint exchanged in every datagram header.
    ///
    /// FNV-1a over each field, folded together with the usual golden-ratio
    /// combiner. Deliberately not the host language's default hasher: both
    /// peers must compute the identical value on any platform.
    pub fn hash(&self) -> u64 {
        let mut hash = FNV_OFFSET_BASIS;
        hash = hash_combine(hash, fnv1a_64(&self.min_update_period.to_le_bytes()));
        hash = hash_combine(
            hash,
            fnv1a_64(&self.polled_fields_update_period.to_le_bytes()),
        );
        hash = hash_combine(hash, fnv1a_64(&self.heartbeat_period.to_le_bytes()));
        hash = hash_combine(hash, fnv1a_64(&self.rate_limit_mbs.to_le_bytes()));
        for channel in &self.channels {
            hash = hash_combine(hash, fnv1a_64(channel.channel_name.as_bytes()));
            for field in &channel.extra_fields {
                hash = hash_combine(hash, fnv1a_64(field.as_bytes()));
            }
            for field in &channel.polled_fields {
                hash = hash_combine(hash, fnv1a_64(field.as_bytes()));
            }
        }
        hash
    }
}

pub(crate) const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64 from the standard offset basis.
pub(crate) fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn hash_combine(h1: u64, h2: u64) -> u64 {
    h1 ^ h2
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(h1 << 6)
        .wrapping_add(h1 >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "min_update_period": 0.05,
        "heartbeat_period": 2.0,
        "rate_limit_mbs": 8,
        "channel_names": {
            "PS1:current": {
                "extra_fields": ["HIGH", "LOW"],
                "polled_fields": ["EGU", "PREC"]
            },
            "PS1:voltage": {},
            "VAC:gauge": { "polled_fields": ["EGU"] }
        }
    }"#;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.min_update_period, 0.1);
        assert_eq!(config.polled_fields_update_period, 5.0);
        assert_eq!(config.heartbeat_period, 15.0);
        assert_eq!(config.rate_limit_mbs, 64);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn parses_sample() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.min_update_period, 0.05);
        assert_eq!(config.polled_fields_update_period, 5.0); // defaulted
        assert_eq!(config.heartbeat_period, 2.0);
        assert_eq!(config.rate_limit_mbs, 8);
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.channels[0].channel_name, "PS1:current");
        assert_eq!(config.channels[0].extra_fields, vec!["HIGH", "LOW"]);
        assert_eq!(config.channels[0].polled_fields, vec!["EGU", "PREC"]);
        assert_eq!(config.channels[1].channel_name, "PS1:voltage");
        assert!(config.channels[1].extra_fields.is_empty());
    }

    #[test]
    fn unknown_top_level_key_is_ignored() {
        let config =
            Config::from_json(r#"{ "heartbeat_period": 3.0, "retransmit": true }"#).unwrap();
        assert_eq!(config.heartbeat_period, 3.0);
    }

    #[test]
    fn flat_expansion_order_and_parents() {
        let config = Config::from_json(SAMPLE).unwrap();
        let flat = config.flat_channels();
        assert_eq!(flat.len(), config.total_channel_count());
        assert_eq!(flat.len(), 8);

        let names: Vec<&str> = flat.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "PS1:current",
                "PS1:current.HIGH",
                "PS1:current.LOW",
                "PS1:current.EGU",
                "PS1:current.PREC",
                "PS1:voltage",
                "VAC:gauge",
                "VAC:gauge.EGU",
            ]
        );

        for (i, channel) in flat.iter().enumerate() {
            assert_eq!(channel.index, i as u32);
        }
        assert_eq!(flat[1].parent_index, 0);
        assert_eq!(flat[4].parent_index, 0);
        assert!(flat[3].polled);
        assert!(!flat[1].polled);
        assert!(flat[5].is_parent());
        assert_eq!(flat[7].parent_index, 6);
    }

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let a = Config::from_json(SAMPLE).unwrap();
        let b = Config::from_json(SAMPLE).unwrap();
        assert_eq!(a.hash(), b.hash());

        let mut c = a.clone();
        c.heartbeat_period = 2.5;
        assert_ne!(a.hash(), c.hash());

        let mut d = a.clone();
        d.channels[0].polled_fields[0] = "DESC".into();
        assert_ne!(a.hash(), d.hash());

        // channel order is part of the contract
        let mut e = a.clone();
        e.channels.swap(1, 2);
        assert_ne!(a.hash(), e.hash());
    }

    #[test]
    fn rejects_bad_periods() {
        assert!(Config::from_json(r#"{ "heartbeat_period": 0 }"#).is_err());
        assert!(Config::from_json(r#"{ "min_update_period": -1.0 }"#).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        match Config::from_file("/nonexistent/diode.json") {
            Err(ConfigError::Io(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
