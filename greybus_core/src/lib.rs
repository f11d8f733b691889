// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Core Greybus protocol runtime: the operation engine, cport driver
//! model, transport backend contract, and mnfb manifest builder/codec.
//!
//! A transport backend (see the `greybus_tcp` and `greybus_uart` crates)
//! implements [`transport::Transport`] and feeds inbound frames to
//! [`engine::Engine::rx_handler`]; everything else (request/response
//! correlation, per-cport dispatch, timeouts) lives here.

pub mod codec;
pub mod cport;
pub mod device_map;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod operation;
pub mod tape;
pub mod transport;

pub use cport::Driver;
pub use engine::Engine;
pub use error::{errno_to_op_result, Error, ManifestError, OpResult};
pub use operation::{Buffer, BufferPool, Header, Operation};
pub use transport::Transport;
