// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end tests against the operation engine using small in-memory
//! transports, mirroring `rpc_protocol`'s `pipe` socketpair harness but
//! built from plain channels since the engine only needs `send`/
//! `rx_handler`, not a byte stream.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use greybus_core::error::OpResult;
use greybus_core::operation::BufferPool;
use greybus_core::transport::Transport;
use greybus_core::{Driver, Engine, Error};

/// Captures every frame handed to `send` without delivering it anywhere;
/// used for the ping/unknown-type/timeout scenarios, which never need a
/// remote peer.
#[derive(Default)]
struct TapTransport {
    sent: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl BufferPool for TapTransport {
    fn rxbuf_free(&self, _cport: u16, _buf: Vec<u8>) {}
}

impl Transport for TapTransport {
    fn listen(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn stop_listening(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn send(&self, cport: u16, bytes: &[u8]) -> Result<(), Error> {
        self.sent.lock().unwrap().push((cport, bytes.to_vec()));
        Ok(())
    }
}

fn wait_for_frame(transport: &TapTransport, timeout: Duration) -> Option<(u16, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = transport.sent.lock().unwrap().first().cloned() {
            return Some(frame);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn ping_is_answered_with_success() {
    let transport = Arc::new(TapTransport::default());
    let engine = Engine::new(transport.clone()).unwrap();
    engine.register_driver(0, Driver::new()).unwrap();

    engine.rx_handler(0, vec![0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);

    let (cport, bytes) = wait_for_frame(&transport, Duration::from_secs(1)).expect("no reply sent");
    assert_eq!(cport, 0);
    assert_eq!(bytes, vec![0x08, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00]);

    engine.deinit().unwrap();
}

#[test]
fn unknown_type_gets_invalid_response() {
    let transport = Arc::new(TapTransport::default());
    let engine = Engine::new(transport.clone()).unwrap();
    engine.register_driver(0, Driver::new()).unwrap();

    engine.rx_handler(0, vec![0x08, 0x00, 0x02, 0x00, 0x7F, 0x00, 0x00, 0x00]);

    let (_, bytes) = wait_for_frame(&transport, Duration::from_secs(1)).expect("no reply sent");
    assert_eq!(bytes, vec![0x08, 0x00, 0x02, 0x00, 0xFF, 0x05, 0x00, 0x00]);

    engine.deinit().unwrap();
}

#[test]
fn malformed_frame_is_dropped_silently() {
    let transport = Arc::new(TapTransport::default());
    let engine = Engine::new(transport.clone()).unwrap();
    engine.register_driver(0, Driver::new()).unwrap();

    // declared size (7) is below the header minimum
    engine.rx_handler(0, vec![0x07, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);

    assert!(wait_for_frame(&transport, Duration::from_millis(200)).is_none());
    engine.deinit().unwrap();
}

/// Never forwards anything anywhere; used to exercise the watchdog
/// without a remote peer attached at all.
#[derive(Default)]
struct DeafTransport;

impl BufferPool for DeafTransport {
    fn rxbuf_free(&self, _cport: u16, _buf: Vec<u8>) {}
}

impl Transport for DeafTransport {
    fn listen(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn stop_listening(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn send(&self, _cport: u16, _bytes: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

#[test]
fn sync_request_times_out_without_response() {
    let engine = Engine::new(Arc::new(DeafTransport)).unwrap();
    engine.register_driver(0, Driver::new()).unwrap();

    let op = engine.operation_create(0, 0x10, &[]);
    let start = Instant::now();
    let result = engine.send_request_sync(&op).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result, OpResult::Timeout);
    assert!(elapsed >= Duration::from_millis(950), "returned too early: {elapsed:?}");

    engine.deinit().unwrap();
}

/// Delivers every `send`ed frame straight into the peer engine's
/// `rx_handler`, set after both engines exist (mirroring the two ends of
/// a socketpair).
struct LoopbackTransport {
    peer: OnceLock<Engine>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(LoopbackTransport { peer: OnceLock::new() })
    }

    fn bind_peer(&self, peer: Engine) {
        let _ = self.peer.set(peer);
    }
}

impl BufferPool for LoopbackTransport {
    fn rxbuf_free(&self, _cport: u16, _buf: Vec<u8>) {}
}

impl Transport for LoopbackTransport {
    fn listen(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn stop_listening(&self, _cport: u16) -> Result<(), Error> {
        Ok(())
    }

    fn send(&self, cport: u16, bytes: &[u8]) -> Result<(), Error> {
        match self.peer.get() {
            Some(peer) => {
                peer.rx_handler(cport, bytes.to_vec());
                Ok(())
            }
            None => Err(Error::NetDown),
        }
    }
}

const ECHO_DELAY_TYPE: u8 = 0x20;

#[test]
fn concurrent_requests_receive_their_own_responses() {
    let transport_a = LoopbackTransport::new();
    let transport_b = LoopbackTransport::new();

    let engine_a = Engine::new(transport_a.clone()).unwrap();
    let engine_b = Engine::new(transport_b.clone()).unwrap();
    transport_a.bind_peer(engine_b.clone());
    transport_b.bind_peer(engine_a.clone());

    engine_a.register_driver(0, Driver::new()).unwrap();
    engine_b
        .register_driver(
            0,
            Driver::new().with_handler(ECHO_DELAY_TYPE, |op| {
                let payload = op.request_payload();
                let delay_ms = payload.first().copied().unwrap_or(0) as u64;
                thread::sleep(Duration::from_millis(delay_ms));
                op.alloc_response(1, OpResult::Success).unwrap();
                op.response_payload_mut(|buf| buf[0] = payload[0]);
                OpResult::Success
            }),
        )
        .unwrap();

    let (done_tx, done_rx) = mpsc::channel::<(u8, u8)>();

    let op_a = engine_a.operation_create(0, ECHO_DELAY_TYPE, &[100]);
    let tx_a = done_tx.clone();
    engine_a
        .send_request(
            &op_a,
            Box::new(move |op| {
                let marker = op
                    .paired_response()
                    .map(|resp| resp.request_payload()[0])
                    .unwrap_or(0xff);
                tx_a.send((100, marker)).unwrap();
            }),
            true,
        )
        .unwrap();

    let op_b = engine_a.operation_create(0, ECHO_DELAY_TYPE, &[10]);
    let tx_b = done_tx.clone();
    engine_a
        .send_request(
            &op_b,
            Box::new(move |op| {
                let marker = op
                    .paired_response()
                    .map(|resp| resp.request_payload()[0])
                    .unwrap_or(0xff);
                tx_b.send((10, marker)).unwrap();
            }),
            true,
        )
        .unwrap();

    let first = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // the 10ms-delay request must complete before the 100ms-delay one
    assert_eq!(first, (10, 10));
    assert_eq!(second, (100, 100));

    engine_a.deinit().unwrap();
    engine_b.deinit().unwrap();
}
