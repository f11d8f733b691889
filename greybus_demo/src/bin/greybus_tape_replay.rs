// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use greybus_core::operation::{Header, HEADER_SIZE};
use greybus_core::tape;

#[derive(Parser)]
struct Cli {
    /// Capture file written by `--tape` on a server/bridge binary.
    tape: String,

    /// Print payload bytes alongside the decoded header.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Cli::parse();

    let mut count = 0usize;
    tape::replay(&args.tape, |cport, bytes| {
        count += 1;
        match Header::decode(bytes) {
            Ok(header) => {
                println!(
                    "#{count} cport={cport} id={} type={:#04x} result={:#04x} size={}",
                    header.id, header.r#type, header.result, header.size
                );
                if args.verbose {
                    println!("    payload: {:02x?}", &bytes[HEADER_SIZE..]);
                }
            }
            Err(_) => println!("#{count} cport={cport} malformed frame ({} bytes)", bytes.len()),
        }
    })?;

    println!("replayed {count} frame(s) from {}", args.tape);
    Ok(())
}
