// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-cport driver registration: the handler table, lifecycle hooks, and
//! the bundle a cport belongs to.

use crate::error::OpResult;
use crate::operation::{BundleId, Operation};

/// Handlers come in two flavors, mirroring the source's split between
/// handlers that run on the cport worker thread (ordinary request
/// handling) and handlers fast enough to run directly on the transport's
/// thread without the queue/dispatch round trip.
pub enum Handler {
    /// Runs on the cport worker thread; returns the wire result code for
    /// the auto-generated response.
    Slow(Box<dyn Fn(&Operation) -> OpResult + Send + Sync>),

    /// Runs directly on the calling (transport) thread; does not produce
    /// a response and bypasses the RX queue entirely.
    Fast(Box<dyn Fn(u16, &[u8]) + Send + Sync>),
}

struct HandlerEntry {
    r#type: u8,
    handler: Handler,
}

/// A cport's registered driver: its handler table plus optional lifecycle
/// hooks, matching `gb_driver` in the source.
pub struct Driver {
    handlers: Vec<HandlerEntry>,
    pub bundle: Option<BundleId>,
    pub stack_size: usize,
    pub on_init: Option<Box<dyn Fn() -> Result<(), ()> + Send + Sync>>,
    pub on_exit: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_connected: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_disconnected: Option<Box<dyn Fn() + Send + Sync>>,
}

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

impl Driver {
    pub fn new() -> Self {
        Driver {
            handlers: Vec::new(),
            bundle: None,
            stack_size: DEFAULT_STACK_SIZE,
            on_init: None,
            on_exit: None,
            on_connected: None,
            on_disconnected: None,
        }
    }

    pub fn with_bundle(mut self, bundle: BundleId) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn with_handler(
        mut self,
        r#type: u8,
        handler: impl Fn(&Operation) -> OpResult + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push(HandlerEntry {
            r#type,
            handler: Handler::Slow(Box::new(handler)),
        });
        self
    }

    pub fn with_fast_handler(
        mut self,
        r#type: u8,
        handler: impl Fn(u16, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push(HandlerEntry {
            r#type,
            handler: Handler::Fast(Box::new(handler)),
        });
        self
    }

    /// Sort the handler table by `type` so dispatch can binary-search it.
    /// Called once by the engine at registration time.
    pub(crate) fn sort(&mut self) {
        self.handlers.sort_by_key(|e| e.r#type);
    }

    pub(crate) fn find(&self, r#type: u8) -> Option<&Handler> {
        self.handlers
            .binary_search_by_key(&r#type, |e| e.r#type)
            .ok()
            .map(|i| &self.handlers[i].handler)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}
