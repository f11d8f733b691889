// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The narrow contract a transport backend (TCP, UART, ...) must satisfy.
//! The engine never assumes anything about the underlying medium beyond
//! this trait; backends call back into the engine through a single
//! `rx_handler` entry point (see [`crate::engine::Engine::rx_handler`]).

use crate::error::Error;
use crate::operation::BufferPool;

pub const MAX_PAYLOAD_SIZE: usize = 2048;

/// Callback invoked once an asynchronous send completes.
pub type SendDoneCallback = Box<dyn FnOnce(Result<(), Error>) + Send>;

pub trait Transport: BufferPool {
    fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    fn exit(&self) -> Result<(), Error> {
        Ok(())
    }

    fn listen(&self, cport: u16) -> Result<(), Error>;

    fn stop_listening(&self, cport: u16) -> Result<(), Error>;

    fn send(&self, cport: u16, bytes: &[u8]) -> Result<(), Error>;

    /// Default falls back to a synchronous send, invoking `done` inline.
    /// Backends with a real async write path (e.g. io_uring) should
    /// override this.
    fn send_async(&self, cport: u16, bytes: Vec<u8>, done: SendDoneCallback) -> Result<(), Error> {
        let result = self.send(cport, &bytes);
        let reported = match &result {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::Invalid),
        };
        done(reported);
        result
    }

    fn alloc_buf(&self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    fn free_buf(&self, _buf: Vec<u8>) {}
}
