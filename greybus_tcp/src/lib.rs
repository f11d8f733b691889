// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! TCP transport backend: one listening socket per cport on
//! `base_port + cport`, a single poll-driven service thread handling
//! accept and read events across every listener and client socket, and
//! length-prefixed frame reassembly.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use greybus_core::error::Error;
use greybus_core::operation::{BufferPool, HEADER_SIZE};
use greybus_core::transport::{SendDoneCallback, Transport, MAX_PAYLOAD_SIZE};
use greybus_core::Engine;

const DEFAULT_BASE_PORT: u16 = 4242;
const POLL_TIMEOUT_MS: u16 = 200;

struct ListenerEntry {
    cport: u16,
    listener: TcpListener,
}

struct ClientEntry {
    cport: u16,
    stream: TcpStream,
    rx_buf: Vec<u8>,
}

pub struct TcpTransport {
    base_port: u16,
    listeners: Mutex<Vec<ListenerEntry>>,
    clients: Mutex<Vec<ClientEntry>>,
    engine: OnceLock<Engine>,
    self_ref: OnceLock<Weak<TcpTransport>>,
    exit_flag: AtomicBool,
    service_thread: Mutex<Option<thread::JoinHandle<()>>>,
    mdns: Mutex<Option<mdns_sd::ServiceDaemon>>,
}

impl TcpTransport {
    pub fn new() -> Arc<Self> {
        Self::with_base_port(DEFAULT_BASE_PORT)
    }

    pub fn with_base_port(base_port: u16) -> Arc<Self> {
        let transport = Arc::new(TcpTransport {
            base_port,
            listeners: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            engine: OnceLock::new(),
            self_ref: OnceLock::new(),
            exit_flag: AtomicBool::new(false),
            service_thread: Mutex::new(None),
            mdns: Mutex::new(None),
        });
        let _ = transport.self_ref.set(Arc::downgrade(&transport));
        transport
    }

    /// Wire this transport to the engine that owns it. Must be called
    /// once, immediately after `Engine::new(transport.clone())`, before
    /// any cport is registered.
    pub fn bind_engine(&self, engine: Engine) {
        let _ = self.engine.set(engine);
    }

    fn bind_listener(&self, cport: u16) -> std::io::Result<TcpListener> {
        let port = self.base_port + cport;
        match TcpListener::bind(("::", port)) {
            Ok(l) => Ok(l),
            Err(_) => TcpListener::bind(("0.0.0.0", port)),
        }
    }

    fn service_loop(self: Arc<Self>) {
        use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

        while !self.exit_flag.load(Ordering::SeqCst) {
            // Snapshot raw fds rather than holding the listeners/clients
            // locks across poll(): accept_on/read_client need to re-lock
            // them to mutate, and poll() can block for up to
            // POLL_TIMEOUT_MS.
            let (listener_fds, client_fds): (Vec<RawFd>, Vec<RawFd>) = {
                let listeners = self.listeners.lock().unwrap();
                let clients = self.clients.lock().unwrap();
                (
                    listeners.iter().map(|l| l.listener.as_raw_fd()).collect(),
                    clients.iter().map(|c| c.stream.as_raw_fd()).collect(),
                )
            };

            let num_listeners = listener_fds.len();
            let mut fds: Vec<PollFd> = Vec::with_capacity(listener_fds.len() + client_fds.len());
            for fd in listener_fds.iter().chain(client_fds.iter()) {
                // SAFETY: each fd was read from a live socket held by
                // `self.listeners`/`self.clients` a moment ago and this
                // loop is the only place that closes those sockets; the
                // borrow only needs to remain valid for the poll() call
                // immediately below.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            }

            let n = match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(e) => {
                    warn!("greybus_tcp: poll failed: {e}");
                    continue;
                }
            };
            if n <= 0 {
                continue;
            }

            for (i, pfd) in fds.iter().enumerate() {
                let Some(revents) = pfd.revents() else { continue };
                if revents.is_empty() {
                    continue;
                }
                if i < num_listeners {
                    self.accept_on(i);
                } else {
                    self.read_client(i - num_listeners);
                }
            }
        }
    }

    fn accept_on(&self, index: usize) {
        let accepted = {
            let listeners = self.listeners.lock().unwrap();
            listeners.get(index).and_then(|l| l.listener.accept().ok().map(|(s, addr)| (l.cport, s, addr)))
        };
        let Some((cport, stream, addr)) = accepted else { return };
        debug!("greybus_tcp: accepted connection from {addr} for cport {cport}");
        let _ = stream.set_nonblocking(true);

        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| c.cport != cport);
        clients.push(ClientEntry {
            cport,
            stream,
            rx_buf: Vec::new(),
        });
    }

    fn read_client(&self, index: usize) {
        let mut clients = self.clients.lock().unwrap();
        let Some(entry) = clients.get_mut(index) else { return };

        let mut chunk = [0u8; 4096];
        loop {
            match entry.stream.read(&mut chunk) {
                Ok(0) => {
                    let cport = entry.cport;
                    clients.remove(index);
                    debug!("greybus_tcp: cport {cport} client disconnected");
                    return;
                }
                Ok(n) => entry.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    let cport = entry.cport;
                    warn!("greybus_tcp: cport {cport} read error: {e}");
                    clients.remove(index);
                    return;
                }
            }
        }

        let cport = entry.cport;
        loop {
            if entry.rx_buf.len() < HEADER_SIZE {
                break;
            }
            let size = u16::from_le_bytes([entry.rx_buf[0], entry.rx_buf[1]]) as usize;
            if size < HEADER_SIZE || size - HEADER_SIZE > MAX_PAYLOAD_SIZE {
                warn!("greybus_tcp: cport {cport} malformed frame size {size}, dropping connection");
                let cport = entry.cport;
                clients.remove(index);
                return;
            }
            if entry.rx_buf.len() < size {
                break;
            }
            let frame: Vec<u8> = entry.rx_buf.drain(..size).collect();
            if let Some(engine) = self.engine.get() {
                engine.rx_handler(cport, frame);
            }
        }
    }

    fn advertise(&self) {
        match mdns_sd::ServiceDaemon::new() {
            Ok(daemon) => {
                let port = self.base_port;
                let info = mdns_sd::ServiceInfo::new(
                    "_greybus._tcp.local.",
                    "greybus",
                    "greybus.local.",
                    "",
                    port,
                    None,
                );
                match info {
                    Ok(info) => {
                        if let Err(e) = daemon.register(info) {
                            warn!("greybus_tcp: mDNS registration failed: {e}");
                        } else {
                            info!("greybus_tcp: advertising _greybus._tcp.local. on port {port}");
                        }
                    }
                    Err(e) => warn!("greybus_tcp: building mDNS service info failed: {e}"),
                }
                *self.mdns.lock().unwrap() = Some(daemon);
            }
            Err(e) => warn!("greybus_tcp: mDNS daemon unavailable: {e}"),
        }
    }
}

impl BufferPool for TcpTransport {
    fn rxbuf_free(&self, _cport: u16, _buf: Vec<u8>) {}
}

impl Transport for TcpTransport {
    fn init(&self) -> Result<(), Error> {
        self.advertise();
        let Some(weak) = self.self_ref.get().cloned() else {
            return Err(Error::Invalid);
        };
        let Some(strong) = weak.upgrade() else {
            return Err(Error::Invalid);
        };
        let handle = thread::Builder::new()
            .name("greybus-tcp-service".to_string())
            .spawn(move || strong.service_loop())
            .map_err(|_| Error::Invalid)?;
        *self.service_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn exit(&self) -> Result<(), Error> {
        self.exit_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.service_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.listeners.lock().unwrap().clear();
        self.clients.lock().unwrap().clear();
        Ok(())
    }

    fn listen(&self, cport: u16) -> Result<(), Error> {
        let listener = self.bind_listener(cport)?;
        listener.set_nonblocking(true)?;
        self.listeners.lock().unwrap().push(ListenerEntry { cport, listener });
        Ok(())
    }

    fn stop_listening(&self, cport: u16) -> Result<(), Error> {
        self.listeners.lock().unwrap().retain(|l| l.cport != cport);
        self.clients.lock().unwrap().retain(|c| c.cport != cport);
        Ok(())
    }

    fn send(&self, cport: u16, bytes: &[u8]) -> Result<(), Error> {
        let mut clients = self.clients.lock().unwrap();
        let Some(index) = clients.iter().position(|c| c.cport == cport) else {
            return Err(Error::Invalid);
        };
        if let Err(e) = clients[index].stream.write_all(bytes) {
            warn!("greybus_tcp: cport {cport} write error: {e}, dropping connection");
            clients.remove(index);
            return Err(e.into());
        }
        Ok(())
    }

    fn send_async(&self, cport: u16, bytes: Vec<u8>, done: SendDoneCallback) -> Result<(), Error> {
        let result = self.send(cport, &bytes);
        let reported = match &result {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::Invalid),
        };
        done(reported);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn ping_round_trip_over_loopback() {
        let transport = TcpTransport::with_base_port(17000);
        let engine = Engine::new(transport.clone()).unwrap();
        transport.bind_engine(engine.clone());
        engine.register_driver(0, greybus_core::Driver::new()).unwrap();

        thread::sleep(Duration::from_millis(50));
        let mut stream = StdTcpStream::connect(("127.0.0.1", 17000)).unwrap();
        stream.write_all(&[0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();

        let mut reply = [0u8; 8];
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0x08, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00]);

        engine.deinit().unwrap();
    }
}
