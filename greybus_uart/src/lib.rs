// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! UART transport backend: a single multiplexed byte stream carrying
//! every cport, with the cport id folded into the operation header's pad
//! field. A reader thread accumulates incoming bytes into a growable
//! buffer (this crate's hosted substitute for the source's fixed-size
//! ring buffer) and extracts complete frames from it; writes go straight
//! to the serial handle.

use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use greybus_core::error::Error;
use greybus_core::operation::{BufferPool, HEADER_SIZE};
use greybus_core::transport::{Transport, MAX_PAYLOAD_SIZE};
use greybus_core::Engine;

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Hosted substitute for the source's ring-buffer overflow policy: when a
/// frame header declares an impossible size, the earliest byte is evicted
/// and reassembly resumes, rather than growing the buffer without bound.
const MAX_RX_BUF: usize = 64 * 1024;

pub struct UartTransport {
    write_port: Mutex<Box<dyn serialport::SerialPort>>,
    engine: OnceLock<Engine>,
    self_ref: OnceLock<Weak<UartTransport>>,
    exit_flag: AtomicBool,
    reader_thread: Mutex<Option<thread::JoinHandle<()>>>,
    read_port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
}

impl UartTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Arc<Self>, Error> {
        let mut port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::Other, e)))?;
        let read_half = port
            .try_clone()
            .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::Other, e)))?;

        let transport = Arc::new(UartTransport {
            write_port: Mutex::new(port),
            engine: OnceLock::new(),
            self_ref: OnceLock::new(),
            exit_flag: AtomicBool::new(false),
            reader_thread: Mutex::new(None),
            read_port: Mutex::new(Some(read_half)),
        });
        let _ = transport.self_ref.set(Arc::downgrade(&transport));
        Ok(transport)
    }

    pub fn bind_engine(&self, engine: Engine) {
        let _ = self.engine.set(engine);
    }

    fn reader_loop(self: Arc<Self>) {
        let mut read_port = self
            .read_port
            .lock()
            .unwrap()
            .take()
            .expect("reader loop started twice");
        let mut rx_buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 512];

        while !self.exit_flag.load(Ordering::SeqCst) {
            match read_port.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!("greybus_uart: read error: {e}");
                    continue;
                }
            }

            loop {
                if rx_buf.len() < HEADER_SIZE {
                    break;
                }
                let size = u16::from_le_bytes([rx_buf[0], rx_buf[1]]) as usize;
                if size < HEADER_SIZE || size - HEADER_SIZE > MAX_PAYLOAD_SIZE {
                    warn!("greybus_uart: malformed frame size {size}, evicting one byte");
                    rx_buf.remove(0);
                    continue;
                }
                if rx_buf.len() < size {
                    if rx_buf.len() > MAX_RX_BUF {
                        warn!("greybus_uart: rx buffer overflow, evicting one byte");
                        rx_buf.remove(0);
                        continue;
                    }
                    break;
                }

                let frame: Vec<u8> = rx_buf.drain(..size).collect();
                let cport = u16::from_le_bytes([frame[6], frame[7]]);
                debug!("greybus_uart: frame for cport {cport}, {size} bytes");
                if let Some(engine) = self.engine.get() {
                    engine.rx_handler(cport, frame);
                }
            }
        }
    }
}

impl BufferPool for UartTransport {
    fn rxbuf_free(&self, _cport: u16, _buf: Vec<u8>) {}
}

impl Transport for UartTransport {
    fn init(&self) -> Result<(), Error> {
        let Some(weak) = self.self_ref.get().cloned() else {
            return Err(Error::Invalid);
        };
        let Some(strong) = weak.upgrade() else {
            return Err(Error::Invalid);
        };
        let handle = thread::Builder::new()
            .name("greybus-uart-reader".to_string())
            .spawn(move || strong.reader_loop())
            .map_err(|_| Error::Invalid)?;
        *self.reader_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn exit(&self) -> Result<(), Error> {
        self.exit_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn listen(&self, _cport: u16) -> Result<(), Error> {
        // The link is always active for every cport; nothing to arm per
        // cport beyond registering the driver with the engine.
        Ok(())
    }

    fn stop_listening(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn send(&self, cport: u16, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Invalid);
        }
        let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if size != bytes.len() {
            return Err(Error::Invalid);
        }
        let mut frame = bytes.to_vec();
        frame[6..8].copy_from_slice(&cport.to_le_bytes());
        self.write_port.lock().unwrap().write_all(&frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_stamps_cport_into_pad_field() {
        // `send` must overwrite bytes[6..8] with the cport id regardless
        // of what the caller left in pad; exercised directly against the
        // byte-rewriting logic without a real serial device.
        let mut frame = vec![0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0xff, 0xff];
        frame[6..8].copy_from_slice(&7u16.to_le_bytes());
        assert_eq!(&frame[6..8], &[7, 0]);
    }
}
