// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;

use greybus_core::tape::TapeRecorder;
use greybus_core::Engine;
use greybus_tcp::TcpTransport;

#[derive(Parser)]
struct Cli {
    /// cport N is reachable at base-port+N.
    #[arg(long, default_value_t = 4242)]
    base_port: u16,

    /// Capture every inbound frame to this file for later replay.
    #[arg(long)]
    tape: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let transport = TcpTransport::with_base_port(args.base_port);
    let engine = Engine::new(transport.clone())?;
    transport.bind_engine(engine.clone());

    if let Some(path) = &args.tape {
        engine.set_tape_recorder(Arc::new(TapeRecorder::create(path)?));
    }

    engine.register_driver(greybus_demo::DEMO_CPORT, greybus_demo::demo_driver())?;
    let manifest = greybus_demo::demo_manifest()?;
    info!(
        "serving cport {} on base port {}, manifest is {} bytes",
        greybus_demo::DEMO_CPORT,
        args.base_port,
        manifest.len()
    );

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
