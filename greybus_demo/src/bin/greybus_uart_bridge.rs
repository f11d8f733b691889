// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;

use greybus_core::tape::TapeRecorder;
use greybus_core::Engine;
use greybus_uart::UartTransport;

#[derive(Parser)]
struct Cli {
    /// Serial device carrying the multiplexed link, e.g. /dev/ttyUSB0.
    #[arg(long)]
    device: String,

    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Capture every inbound frame to this file for later replay.
    #[arg(long)]
    tape: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let transport = UartTransport::open(&args.device, args.baud)?;
    let engine = Engine::new(transport.clone())?;
    transport.bind_engine(engine.clone());

    if let Some(path) = &args.tape {
        engine.set_tape_recorder(Arc::new(TapeRecorder::create(path)?));
    }

    engine.register_driver(greybus_demo::DEMO_CPORT, greybus_demo::demo_driver())?;
    let manifest = greybus_demo::demo_manifest()?;
    info!(
        "bridging cport {} over {} at {} baud, manifest is {} bytes",
        greybus_demo::DEMO_CPORT,
        args.device,
        args.baud,
        manifest.len()
    );

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
