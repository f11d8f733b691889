// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The operation engine: driver registration, the per-cport worker loop,
//! request/response correlation, and the timeout watchdog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::cport::{Driver, Handler};
use crate::device_map::DeviceMap;
use crate::error::{Error, OpResult};
use crate::operation::{
    Buffer, Callback, Header, Operation, HEADER_SIZE, TYPE_PING, TYPE_RESPONSE_FLAG,
};
use crate::tape::TapeRecorder;
use crate::transport::{Transport, MAX_PAYLOAD_SIZE};

const TIMEOUT_MS: u64 = 1000;

enum RxItem {
    Op(Operation),
    Timeout,
    Exit,
}

struct CportHandle {
    cport: u16,
    driver: Driver,
    tx_pending: Mutex<Vec<Operation>>,
    sender: mpsc::Sender<RxItem>,
    watchdog_armed: AtomicBool,
    transport: Arc<dyn Transport>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    cports: Mutex<HashMap<u16, Arc<CportHandle>>>,
    request_id: AtomicU16,
    tape: Mutex<Option<Arc<TapeRecorder>>>,
    device_map: DeviceMap,
}

/// The Greybus operation engine: owns cport driver registrations, the
/// transport backend, and the process-wide cport-device map. Cheap to
/// clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl Engine {
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, Error> {
        transport.init()?;
        Ok(Engine(Arc::new(EngineInner {
            transport,
            cports: Mutex::new(HashMap::new()),
            request_id: AtomicU16::new(1),
            tape: Mutex::new(None),
            device_map: DeviceMap::new(),
        })))
    }

    pub fn device_map(&self) -> &DeviceMap {
        &self.0.device_map
    }

    pub fn set_tape_recorder(&self, tape: Arc<TapeRecorder>) {
        *self.0.tape.lock().unwrap() = Some(tape);
    }

    /// Register a driver for `cport`, spawn its worker thread, and start
    /// the transport listening on it.
    pub fn register_driver(&self, cport: u16, mut driver: Driver) -> Result<(), Error> {
        let mut cports = self.0.cports.lock().unwrap();
        if cports.contains_key(&cport) {
            return Err(Error::Exists);
        }

        driver.sort();
        if let Some(init) = &driver.on_init {
            if init().is_err() {
                return Err(Error::Invalid);
            }
        }

        let (sender, receiver) = mpsc::channel();
        let handle = Arc::new(CportHandle {
            cport,
            driver,
            tx_pending: Mutex::new(Vec::new()),
            sender,
            watchdog_armed: AtomicBool::new(false),
            transport: self.0.transport.clone(),
            worker: Mutex::new(None),
        });

        let spawned = {
            let handle = handle.clone();
            thread::Builder::new()
                .name(format!("greybus[{cport}]"))
                .stack_size(handle.driver.stack_size)
                .spawn(move || cport_worker_loop(handle, receiver))
        };
        let worker = match spawned {
            Ok(w) => w,
            Err(_) => {
                if let Some(exit) = &handle.driver.on_exit {
                    exit();
                }
                return Err(Error::Invalid);
            }
        };
        *handle.worker.lock().unwrap() = Some(worker);

        if let Err(e) = self.0.transport.listen(cport) {
            if let Some(exit) = &handle.driver.on_exit {
                exit();
            }
            let _ = handle.sender.send(RxItem::Exit);
            return Err(e);
        }

        cports.insert(cport, handle);
        Ok(())
    }

    pub fn unregister_driver(&self, cport: u16) -> Result<(), Error> {
        let handle = self.0.cports.lock().unwrap().remove(&cport).ok_or(Error::Invalid)?;
        self.0.transport.stop_listening(cport)?;
        let _ = handle.sender.send(RxItem::Exit);
        if let Some(join) = handle.worker.lock().unwrap().take() {
            let _ = join.join();
        }
        if let Some(exit) = &handle.driver.on_exit {
            exit();
        }
        Ok(())
    }

    pub fn deinit(&self) -> Result<(), Error> {
        let cports: Vec<u16> = self.0.cports.lock().unwrap().keys().copied().collect();
        for cport in cports {
            self.unregister_driver(cport)?;
        }
        self.0.transport.exit()
    }

    /// Build a new outgoing operation on `cport` with the given request
    /// type and payload; `id` is left at 0 until `send_request*` assigns
    /// one (fire-and-forget operations keep `id == 0`).
    pub fn operation_create(&self, cport: u16, r#type: u8, payload: &[u8]) -> Operation {
        let total = HEADER_SIZE + payload.len();
        let mut bytes = vec![0u8; total];
        let header = Header {
            size: total as u16,
            id: 0,
            r#type,
            result: 0,
            pad: 0,
        };
        header.encode(&mut bytes);
        bytes[HEADER_SIZE..].copy_from_slice(payload);
        Operation::new(cport, Buffer::Owned(bytes))
    }

    fn next_request_id(&self) -> u16 {
        loop {
            let id = self.0.request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send `op` as a request. When `need_response` is true, a fresh
    /// nonzero `id` is allocated, the op is parked on its cport's TX
    /// pending list awaiting a matching response, and `callback` will run
    /// exactly once (response attached, or `Timeout` if the watchdog
    /// fires first). When false, `id` stays 0 and no correlation is
    /// tracked.
    pub fn send_request(
        &self,
        op: &Operation,
        callback: Callback,
        need_response: bool,
    ) -> Result<(), Error> {
        let cport = op.cport();
        let handle = self.cport_handle(cport)?;

        if need_response {
            let id = self.next_request_id();
            op.set_request_id(id)?;
            op.set_callback(callback);
            op.mark_sent();
            handle.tx_pending.lock().unwrap().push(op.clone());
            arm_watchdog(&handle);

            let bytes = op.request_bytes();
            if let Err(e) = handle.transport.send(cport, &bytes) {
                let mut pending = handle.tx_pending.lock().unwrap();
                if let Some(pos) = pending.iter().position(|o| o.same_as(op)) {
                    pending.remove(pos);
                }
                drop(pending);
                op.take_callback();
                return Err(e);
            }
        } else {
            let bytes = op.request_bytes();
            handle.transport.send(cport, &bytes)?;
            callback(op);
        }

        Ok(())
    }

    /// Fire-and-forget, using the transport's asynchronous send path.
    pub fn send_request_nowait(&self, op: &Operation, callback: Callback) -> Result<(), Error> {
        let cport = op.cport();
        let handle = self.cport_handle(cport)?;
        let bytes = op.request_bytes();
        let op_for_done = op.clone();
        handle.transport.send_async(
            cport,
            bytes,
            Box::new(move |result| match result {
                Ok(()) => callback(&op_for_done),
                Err(e) => warn!("cport {cport}: async send failed: {e}"),
            }),
        )
    }

    /// Send `op` and block until a response arrives or the watchdog times
    /// it out; returns the resulting wire status.
    pub fn send_request_sync(&self, op: &Operation) -> Result<OpResult, Error> {
        let rx = op.arm_sync_wait();
        let op_for_cb = op.clone();
        self.send_request(
            op,
            Box::new(move |_| op_for_cb.signal_sync_wait()),
            true,
        )?;
        let _ = rx.recv_timeout(Duration::from_millis(TIMEOUT_MS + 200));
        Ok(op.get_request_result())
    }

    /// Entry point called by a transport backend when a complete frame has
    /// arrived on `cport`.
    pub fn rx_handler(&self, cport: u16, bytes: Vec<u8>) {
        self.rx_handler_buffer(cport, Buffer::Owned(bytes));
    }

    /// Same as [`Engine::rx_handler`] but for zero-copy backends handing
    /// over transport-pool memory; dropping the resulting operation's
    /// request buffer returns it to `pool` instead of freeing it.
    pub fn rx_handler_borrowed(
        &self,
        cport: u16,
        bytes: Vec<u8>,
        pool: Arc<dyn crate::operation::BufferPool>,
    ) {
        self.rx_handler_buffer(cport, Buffer::Borrowed { bytes, cport, pool });
    }

    fn rx_handler_buffer(&self, cport: u16, buf: Buffer) {
        if buf.bytes().len() < HEADER_SIZE {
            warn!("cport {cport}: frame shorter than header, dropping");
            return;
        }
        let header = match buf.header() {
            Ok(h) => h,
            Err(_) => {
                warn!("cport {cport}: malformed header, dropping");
                return;
            }
        };
        if header.size as usize != buf.bytes().len() {
            warn!("cport {cport}: declared size {} != delivered {}", header.size, buf.bytes().len());
            return;
        }
        if buf.bytes().len() - HEADER_SIZE > MAX_PAYLOAD_SIZE {
            warn!("cport {cport}: payload exceeds max size, dropping");
            return;
        }

        if let Some(tape) = self.0.tape.lock().unwrap().as_ref() {
            let _ = tape.record(cport, buf.bytes());
        }

        let handle = match self.0.cports.lock().unwrap().get(&cport).cloned() {
            Some(h) => h,
            None => {
                debug!("cport {cport}: no driver registered, dropping");
                return;
            }
        };

        if !header.is_response() {
            if let Some(Handler::Fast(f)) = handle.driver.find(header.request_type()) {
                f(cport, buf.payload());
                return;
            }
        }

        let op = Operation::new(cport, buf);
        let _ = handle.sender.send(RxItem::Op(op));
    }

    /// Signal a physical connect/disconnect event on `cport` to its
    /// registered driver's `on_connected`/`on_disconnected` hook, mirroring
    /// the source's `gb_notify`. Neither transport in this crate currently
    /// calls this; TCP could wire it to accept/close. A no-op if the hook
    /// isn't set or the cport isn't registered.
    pub fn notify(&self, cport: u16, connected: bool) -> Result<(), Error> {
        let handle = self.cport_handle(cport)?;
        let hook = if connected {
            &handle.driver.on_connected
        } else {
            &handle.driver.on_disconnected
        };
        if let Some(f) = hook {
            f();
        }
        Ok(())
    }

    fn cport_handle(&self, cport: u16) -> Result<Arc<CportHandle>, Error> {
        self.0
            .cports
            .lock()
            .unwrap()
            .get(&cport)
            .cloned()
            .ok_or(Error::NetDown)
    }
}

fn arm_watchdog(handle: &Arc<CportHandle>) {
    if handle.watchdog_armed.swap(true, Ordering::SeqCst) {
        return;
    }
    let handle = handle.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(TIMEOUT_MS));
        let _ = handle.sender.send(RxItem::Timeout);
    });
}

fn cport_worker_loop(handle: Arc<CportHandle>, receiver: mpsc::Receiver<RxItem>) {
    for item in receiver.iter() {
        match item {
            RxItem::Exit => break,
            RxItem::Timeout => sweep_timeouts(&handle),
            RxItem::Op(op) => dispatch(&handle, op),
        }
    }
}

fn dispatch(handle: &Arc<CportHandle>, op: Operation) {
    let header = match op.request_header() {
        Ok(h) => h,
        Err(_) => return,
    };
    if header.is_response() {
        handle_response(handle, op, &header);
    } else {
        handle_request(handle, op, &header);
    }
}

fn handle_response(handle: &Arc<CportHandle>, op: Operation, header: &Header) {
    let matched = {
        let mut pending = handle.tx_pending.lock().unwrap();
        let pos = pending
            .iter()
            .position(|o| o.request_header().map(|h| h.id) == Ok(header.id));
        pos.map(|i| pending.remove(i))
    };

    match matched {
        Some(original) => {
            original.set_paired_response(op);
            original.fire_callback();
        }
        None => {
            debug!("cport {}: response id {} has no pending request", handle.cport, header.id);
        }
    }
}

fn handle_request(handle: &Arc<CportHandle>, op: Operation, header: &Header) {
    if header.request_type() == TYPE_PING {
        respond(handle, &op, OpResult::Success);
        return;
    }

    match handle.driver.find(header.request_type()) {
        Some(Handler::Slow(f)) => {
            if let Some(bundle) = handle.driver.bundle {
                op.set_bundle(bundle);
            }
            let result = f(&op);
            if op.with_response(|r| r.is_none()) {
                if op.alloc_response(0, result).is_err() {
                    send_canned_oom(handle, header);
                    return;
                }
            }
            if header.id != 0 {
                send_response(handle, &op);
            }
        }
        Some(Handler::Fast(_)) => unreachable!("fast handlers bypass the worker queue"),
        None => {
            if header.id != 0 {
                respond(handle, &op, OpResult::Invalid);
            }
        }
    }
}

fn respond(handle: &Arc<CportHandle>, op: &Operation, result: OpResult) {
    if op.alloc_response(0, result).is_ok() {
        send_response(handle, op);
    }
}

fn send_response(handle: &Arc<CportHandle>, op: &Operation) {
    if let Some(resp) = op.take_response() {
        if let Err(e) = handle.transport.send(handle.cport, resp.bytes()) {
            warn!("cport {}: send response failed: {e}", handle.cport);
        }
    }
}

fn send_canned_oom(handle: &Arc<CportHandle>, header: &Header) {
    let mut bytes = [0u8; HEADER_SIZE];
    let resp = Header {
        size: HEADER_SIZE as u16,
        id: header.id,
        r#type: header.request_type() | TYPE_RESPONSE_FLAG,
        result: OpResult::NoMemory as u8,
        pad: 0,
    };
    resp.encode(&mut bytes);
    let _ = handle.transport.send(handle.cport, &bytes);
}

fn sweep_timeouts(handle: &Arc<CportHandle>) {
    let expired: Vec<Operation> = {
        let mut pending = handle.tx_pending.lock().unwrap();
        let now = Instant::now();
        let mut expired = Vec::new();
        pending.retain(|op| {
            let is_expired = op
                .sent_at()
                .map(|t| now.duration_since(t).as_millis() as u64 >= TIMEOUT_MS)
                .unwrap_or(false);
            if is_expired {
                expired.push(op.clone());
                false
            } else {
                true
            }
        });
        expired
    };

    handle.watchdog_armed.store(false, Ordering::SeqCst);

    for op in &expired {
        op.fire_callback();
    }

    if !handle.tx_pending.lock().unwrap().is_empty() {
        arm_watchdog(handle);
    }
}

