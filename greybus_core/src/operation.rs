// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The operation: one in-flight request or response, its wire header, and
//! its buffer ownership.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::codec::{read_u16_le, write_u16_le};
use crate::error::{Error, OpResult};

pub const HEADER_SIZE: usize = 8;
pub const TYPE_RESPONSE_FLAG: u8 = 0x80;
pub const TYPE_PING: u8 = 0x00;

/// The 8-byte little-endian operation header: `size | id | type | result | pad`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: u16,
    pub id: u16,
    pub r#type: u8,
    pub result: u8,
    pub pad: u16,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Invalid);
        }
        Ok(Header {
            size: read_u16_le(&buf[0..2]),
            id: read_u16_le(&buf[2..4]),
            r#type: buf[4],
            result: buf[5],
            pad: read_u16_le(&buf[6..8]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        write_u16_le(&mut buf[0..2], self.size);
        write_u16_le(&mut buf[2..4], self.id);
        buf[4] = self.r#type;
        buf[5] = self.result;
        write_u16_le(&mut buf[6..8], self.pad);
    }

    pub fn is_response(&self) -> bool {
        self.r#type & TYPE_RESPONSE_FLAG != 0
    }

    pub fn request_type(&self) -> u8 {
        self.r#type & !TYPE_RESPONSE_FLAG
    }
}

/// A receive pool that owns buffers handed to handlers on the zero-copy
/// path; returning a borrowed frame to the pool happens on `Buffer` drop.
pub trait BufferPool: Send + Sync {
    fn rxbuf_free(&self, cport: u16, buf: Vec<u8>);
}

/// The payload bytes backing an operation's request or response side.
///
/// `Owned` is a heap allocation freed normally on drop. `Borrowed` is
/// memory handed to us by a transport's receive pool; dropping it returns
/// the bytes to that pool instead of freeing them, mirroring the source's
/// `is_unipro_rx_buf` flag as a type rather than a boolean.
pub enum Buffer {
    Owned(Vec<u8>),
    Borrowed {
        bytes: Vec<u8>,
        cport: u16,
        pool: Arc<dyn BufferPool>,
    },
}

impl Buffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Buffer::Owned(v) => v,
            Buffer::Borrowed { bytes, .. } => bytes,
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Buffer::Borrowed { .. })
    }

    pub fn header(&self) -> Result<Header, Error> {
        Header::decode(self.bytes())
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes()[HEADER_SIZE..]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.bytes().len())
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Buffer::Borrowed { bytes, cport, pool } = self {
            let taken = std::mem::take(bytes);
            pool.rxbuf_free(*cport, taken);
        }
    }
}

pub type Callback = Box<dyn FnOnce(&Operation) + Send>;

/// A handle to the bundle a cport's driver belongs to, attached to requests
/// before dispatch so handlers can see their owning bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleId(pub u8);

struct OperationInner {
    cport: u16,
    request: Mutex<Buffer>,
    response: Mutex<Option<Buffer>>,
    paired_response: Mutex<Option<Operation>>,
    bundle: Mutex<Option<BundleId>>,
    callback: Mutex<Option<Callback>>,
    sent_at: Mutex<Option<Instant>>,
    sync_wait: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

/// One in-flight request or response. Cheaply cloneable; the last clone
/// dropped frees the request/response buffers (or returns a borrowed
/// request buffer to its transport pool).
#[derive(Clone)]
pub struct Operation(Arc<OperationInner>);

impl Operation {
    pub fn new(cport: u16, request: Buffer) -> Self {
        Operation(Arc::new(OperationInner {
            cport,
            request: Mutex::new(request),
            response: Mutex::new(None),
            paired_response: Mutex::new(None),
            bundle: Mutex::new(None),
            callback: Mutex::new(None),
            sent_at: Mutex::new(None),
            sync_wait: Mutex::new(None),
        }))
    }

    pub fn cport(&self) -> u16 {
        self.0.cport
    }

    pub fn with_request<R>(&self, f: impl FnOnce(&Buffer) -> R) -> R {
        f(&self.0.request.lock().unwrap())
    }

    pub fn request_bytes(&self) -> Vec<u8> {
        self.0.request.lock().unwrap().bytes().to_vec()
    }

    pub fn request_header(&self) -> Result<Header, Error> {
        self.0.request.lock().unwrap().header()
    }

    pub fn request_payload(&self) -> Vec<u8> {
        self.0.request.lock().unwrap().payload().to_vec()
    }

    /// Stamp a freshly allocated request `id` into the request buffer's
    /// header before the first send, as `Engine::send_request` does for
    /// requests that need a response.
    pub fn set_request_id(&self, id: u16) -> Result<(), Error> {
        let mut guard = self.0.request.lock().unwrap();
        let mut header = guard.header()?;
        header.id = id;
        match &mut *guard {
            Buffer::Owned(bytes) => header.encode(bytes),
            Buffer::Borrowed { bytes, .. } => header.encode(bytes),
        }
        Ok(())
    }

    pub fn set_bundle(&self, bundle: BundleId) {
        *self.0.bundle.lock().unwrap() = Some(bundle);
    }

    pub fn bundle(&self) -> Option<BundleId> {
        *self.0.bundle.lock().unwrap()
    }

    /// Allocate a response buffer of `payload_len` bytes, echoing this
    /// request's `id` and `type | 0x80`. Overwrites any previously
    /// allocated response.
    pub fn alloc_response(&self, payload_len: usize, result: OpResult) -> Result<(), Error> {
        let req_header = self.request_header()?;
        let total = HEADER_SIZE + payload_len;
        let size = u16::try_from(total).map_err(|_| Error::Invalid)?;
        let mut bytes = vec![0u8; total];
        let header = Header {
            size,
            id: req_header.id,
            r#type: req_header.request_type() | TYPE_RESPONSE_FLAG,
            result: result as u8,
            pad: 0,
        };
        header.encode(&mut bytes);
        *self.0.response.lock().unwrap() = Some(Buffer::Owned(bytes));
        Ok(())
    }

    pub fn with_response<R>(&self, f: impl FnOnce(Option<&Buffer>) -> R) -> R {
        f(self.0.response.lock().unwrap().as_ref())
    }

    pub fn take_response(&self) -> Option<Buffer> {
        self.0.response.lock().unwrap().take()
    }

    pub fn response_payload_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut guard = self.0.response.lock().unwrap();
        guard.as_mut().map(|buf| match buf {
            Buffer::Owned(v) => f(&mut v[HEADER_SIZE..]),
            Buffer::Borrowed { bytes, .. } => f(&mut bytes[HEADER_SIZE..]),
        })
    }

    pub fn set_paired_response(&self, response: Operation) {
        *self.0.paired_response.lock().unwrap() = Some(response);
    }

    /// The result of this request: `Success`/payload-bearing if a paired
    /// response arrived, `Timeout` if the watchdog fired with no reply.
    pub fn get_request_result(&self) -> OpResult {
        match self.0.paired_response.lock().unwrap().as_ref() {
            Some(resp) => resp.request_header().map(|h| OpResult::from_u8(h.result)).unwrap_or(OpResult::UnknownError),
            None => OpResult::Timeout,
        }
    }

    pub fn paired_response(&self) -> Option<Operation> {
        self.0.paired_response.lock().unwrap().clone()
    }

    pub fn set_callback(&self, cb: Callback) {
        *self.0.callback.lock().unwrap() = Some(cb);
    }

    pub fn take_callback(&self) -> Option<Callback> {
        self.0.callback.lock().unwrap().take()
    }

    pub fn fire_callback(&self) {
        if let Some(cb) = self.take_callback() {
            cb(self);
        }
    }

    pub fn mark_sent(&self) {
        *self.0.sent_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn sent_at(&self) -> Option<Instant> {
        *self.0.sent_at.lock().unwrap()
    }

    pub fn arm_sync_wait(&self) -> std::sync::mpsc::Receiver<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        *self.0.sync_wait.lock().unwrap() = Some(tx);
        rx
    }

    pub fn signal_sync_wait(&self) {
        if let Some(tx) = self.0.sync_wait.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Identity comparison: do these two handles refer to the same
    /// underlying operation.
    pub fn same_as(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("cport", &self.0.cport)
            .field("header", &self.0.request.lock().unwrap().header().ok())
            .finish()
    }
}
