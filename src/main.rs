#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # rild
//!
//! Radio Interface Layer daemon for Ericsson MBM cellular modems.
//!
//! Opens an AT channel to the modem over a serial TTY (`-d`) or a TCP
//! port (`-p`), brings up the command engine, and serves telephony
//! requests. Run standalone it logs all modem traffic and unsolicited
//! events; a host telephony stack embeds the library instead and plugs in
//! its own [`rild::HostEnv`].

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use rild::{Config, Engine, LogHost};

/// Radio Interface Layer daemon for MBM cellular modems.
#[derive(Parser)]
#[command(name = "rild", version)]
struct Cli {
    /// TCP port of a modem exposed over the network.
    #[arg(short = 'p')]
    port: Option<u16>,

    /// Primary TTY device (e.g. /dev/ttyACM1).
    #[arg(short = 'd')]
    device: Option<String>,

    /// Separate TTY for the priority channel.
    #[arg(short = 'x')]
    prio_device: Option<String>,

    /// Network interface carrying the data call.
    #[arg(short = 'i')]
    iface: Option<String>,

    /// Host for the TCP transport (default loopback).
    #[arg(short = 'z')]
    loophost: Option<String>,

    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref());
    if cli.port.is_some() {
        config.port = cli.port;
    }
    if cli.device.is_some() {
        config.device = cli.device;
    }
    if cli.prio_device.is_some() {
        config.prio_device = cli.prio_device;
    }
    if let Some(iface) = cli.iface {
        config.iface = iface;
    }
    if cli.loophost.is_some() {
        config.loophost = cli.loophost;
    }

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        eprintln!(
            "usage: rild [-z <host>] [-p <tcp port>] [-d <tty device>] [-x <prio tty device>] [-i <network interface>]"
        );
        std::process::exit(1);
    }

    info!("rild v{} starting", env!("CARGO_PKG_VERSION"));

    let engine = match Engine::start(&config, Arc::new(LogHost::new())) {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to start engine: {e}");
            std::process::exit(1);
        }
    };

    engine.join();
}
