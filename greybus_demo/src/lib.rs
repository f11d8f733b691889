// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Shared wiring for the demo binaries: a one-bundle, one-cport manifest
//! and a driver that answers pings (handled by the engine itself) and a
//! simple echo request, enough to prove a transport end to end without
//! standing in for any real device-class protocol.

use greybus_core::error::OpResult;
use greybus_core::manifest::{BundleClass, CPortProtocol, ManifestBuilder};
use greybus_core::operation::BundleId;
use greybus_core::{Driver, Error};

pub const DEMO_CPORT: u16 = 0;
pub const DEMO_BUNDLE: BundleId = BundleId(0);

/// Request type this demo answers beyond the engine's built-in ping:
/// echoes the request payload back verbatim.
pub const TYPE_ECHO: u8 = 0x01;

/// Build the mnfb bytes for a single-bundle, single-cport device exposing
/// only the echo type above.
pub fn demo_manifest() -> Result<Vec<u8>, Error> {
    let mut builder = ManifestBuilder::new(0, 1);
    builder.add_interface(1, 2)?;
    builder.add_string(1, "greybus_demo")?;
    builder.add_string(2, "loopback bundle")?;
    builder.add_bundle(DEMO_BUNDLE.0, BundleClass::CONTROL)?;
    builder.add_cport(DEMO_CPORT, BundleClass::CONTROL, CPortProtocol::CONTROL)?;
    Ok(builder.give())
}

/// The driver registered on [`DEMO_CPORT`] by every demo binary.
pub fn demo_driver() -> Driver {
    Driver::new().with_bundle(DEMO_BUNDLE).with_handler(TYPE_ECHO, |op| {
        let payload = op.request_payload();
        if op.alloc_response(payload.len(), OpResult::Success).is_err() {
            return OpResult::NoMemory;
        }
        op.response_payload_mut(|buf| buf.copy_from_slice(&payload));
        OpResult::Success
    })
}
