// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver process: rebuilds the diode stream and prints every update.
//!
//! The printing sink stands in for a site-specific record-store adapter;
//! embedders hand [`cadiode::Receiver::run`] their own [`cadiode::UpdateSink`].

use anyhow::Context;
use cadiode::{Config, Receiver, DEFAULT_CONFIG_FILENAME, DEFAULT_PORT};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cadiode-receiver", version)]
#[command(about = "Diode receiver: dispatches channel updates from the sending side")]
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

    /// Only listen on the specified address
    #[arg(short = 'i', value_name = "address", default_value = "0.0.0.0")]
    listen_address: IpAddr,

    /// Receive port
    #[arg(value_name = "port", default_value_t = DEFAULT_PORT)]
    port: u16,
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
    let channel_names: Vec<String> = config
        .flat_channels()
        .into_iter()
        .map(|c| c.name)
        .collect();

    let mut receiver = Receiver::new(&config, args.listen_address, args.port)
        .context("failed to start receiver")?;

    let mut sink = move |channel_index: u32, dbr_type: u16, count: u32, value: &[u8]| {
        let name = channel_names
            .get(channel_index as usize)
            .map(String::as_str)
            .unwrap_or("?");
        if count == u32::MAX {
            println!("[{:>32}] DISCONNECTED", name);
        } else {
            println!(
                "[{:>32}] type {} count {} ({} bytes)",
                name,
                dbr_type,
                count,
                value.len()
            );
        }
    };

    receiver.run(args.runtime, &mut sink);
    Ok(())
}
