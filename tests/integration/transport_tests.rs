//! Link failures, garbage off the wire, buffer exhaustion, and the
//! byte-stream transport end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rpclink::error::{Error, ErrorSource, ProtocolError, TransportError};
use rpclink::rpc::stream::{LEN_PREFIX_SIZE, encode_frame};
use rpclink::rpc::{
    BufferPool, ByteChannel, Endpoint, HEADER_SIZE, Header, PacketType, StreamTransport, Transport,
};

use crate::harness::{ACK, ADD, ECHO, MATH, Reports, SLOW, math_group, math_pair, wait_until};

fn add(ep: &Endpoint, a: u32, b: u32) -> Result<u32, Error> {
    ep.call_with(
        MATH,
        ADD,
        10,
        |e| {
            e.encode_u32(a)?;
            e.encode_u32(b)
        },
        |_, d| d.decode_u32(),
    )
}

#[test]
fn link_down_fails_pending_call_promptly() {
    let p = math_pair();
    let client = p.client.clone();
    let start = Instant::now();
    let waiter = std::thread::spawn(move || client.call(MATH, SLOW, 0, |_| Ok(())).map(|r| r.status()));

    assert!(wait_until(|| p.client.is_call_pending()));
    p.client_link.set_link_up(false);
    let outcome = waiter.join().unwrap();
    assert_eq!(outcome, Err(Error::Transport(TransportError::LinkDown)));
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(!p.client.is_call_pending());
}

#[test]
fn sending_on_a_down_link_is_reported() {
    let p = math_pair();
    p.client_link.set_link_up(false);
    let err = p.client.call(MATH, ACK, 0, |_| Ok(())).unwrap_err();
    assert_eq!(err, Error::Transport(TransportError::LinkDown));

    let reports = p.client_reports.all();
    assert!(reports.iter().any(|r| r.source == ErrorSource::Send && r.group == MATH && r.id == ACK));

    p.client_link.set_link_up(true);
    assert_eq!(add(&p.client, 2, 3), Ok(5));
}

#[test]
fn short_frame_is_reported_and_ignored() {
    let p = math_pair();
    p.client_link.inject(&[1, 7]).unwrap();
    assert!(wait_until(|| !p.client_reports.is_empty()));
    let report = p.client_reports.all()[0];
    assert_eq!(report.error, Error::Protocol(ProtocolError::MalformedHeader));
    assert_eq!((report.group, report.packet), (7, None));

    assert_eq!(add(&p.client, 1, 1), Ok(2));
}

#[test]
fn unknown_packet_type_is_malformed() {
    let p = math_pair();
    p.server_link.inject(&[9, MATH, ADD, 0, 0]).unwrap();
    assert!(wait_until(|| !p.server_reports.is_empty()));
    assert_eq!(p.server_reports.all()[0].error, Error::Protocol(ProtocolError::MalformedHeader));
    assert_eq!(add(&p.client, 20, 22), Ok(42));
}

#[test]
fn uncorrelated_response_is_reported() {
    let p = math_pair();
    let mut raw = [0u8; HEADER_SIZE + 1];
    let header: &mut [u8; HEADER_SIZE] = (&mut raw[..HEADER_SIZE]).try_into().unwrap();
    Header::new(PacketType::Response, MATH, ADD, 77).write(header);
    p.client_link.inject(&raw).unwrap();

    assert!(wait_until(|| !p.client_reports.is_empty()));
    let report = p.client_reports.all()[0];
    assert_eq!(report.error, Error::Protocol(ProtocolError::Uncorrelated));
    assert_eq!(report.packet, Some(PacketType::Response));
    assert!(wait_until(|| p.pool.in_use() == 0));
}

#[test]
fn exhausted_pool_is_no_buffer() {
    let p = math_pair();
    let leases: Vec<_> = std::iter::from_fn(|| p.pool.try_lease()).collect();
    assert_eq!(leases.len(), p.pool.capacity());

    let err = p.client.call(MATH, ACK, 0, |_| Ok(())).unwrap_err();
    assert_eq!(err, Error::Transport(TransportError::NoBuffer));
    assert!(!p.client.is_call_pending());

    drop(leases);
    assert_eq!(add(&p.client, 4, 4), Ok(8));
}

// ── Stream transport over in-memory pipes ─────────────────────

type Bytes = Arc<Mutex<VecDeque<u8>>>;

/// One direction each way; `read` never blocks.
struct Pipe {
    rx: Bytes,
    tx: Bytes,
}

impl ByteChannel for Pipe {
    type Error = ();

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        let mut rx = self.rx.lock().map_err(|_| ())?;
        let n = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ()> {
        // Short writes exercise the send loop.
        let n = data.len().min(64);
        self.tx.lock().map_err(|_| ())?.extend(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

fn pipes() -> (Pipe, Pipe) {
    let a: Bytes = Arc::default();
    let b: Bytes = Arc::default();
    (Pipe { rx: Arc::clone(&a), tx: Arc::clone(&b) }, Pipe { rx: b, tx: a })
}

#[test]
fn stream_transport_carries_calls_and_events() {
    let pool = BufferPool::new(16);
    let (left, right) = pipes();
    let client_link = Arc::new(StreamTransport::new(left, Arc::clone(&pool)));
    let server_link = Arc::new(StreamTransport::new(right, Arc::clone(&pool)));

    let stop = Arc::new(AtomicBool::new(false));
    let poller = {
        let (c, s, stop) = (Arc::clone(&client_link), Arc::clone(&server_link), Arc::clone(&stop));
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let moved = c.poll().unwrap_or(0) + s.poll().unwrap_or(0);
                if moved == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    let server = Endpoint::builder(Arc::clone(&server_link) as Arc<dyn Transport>)
        .name("stream-server")
        .group(math_group(Arc::new(AtomicU32::new(0))))
        .unwrap()
        .start()
        .unwrap();
    let client = Endpoint::builder(Arc::clone(&client_link) as Arc<dyn Transport>)
        .name("stream-client")
        .start()
        .unwrap();

    assert_eq!(add(&client, 40, 2), Ok(42));
    let echoed = client
        .call_with(MATH, ECHO, 64, |e| e.encode_str("over the wire"), |_, d| d.decode_str().map(str::to_owned))
        .unwrap();
    assert_eq!(echoed, "over the wire");

    let seen = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&seen);
    client
        .listen(0x30, 1, |d| d.decode_u32(), move |v| sink.store(v, Ordering::SeqCst))
        .unwrap();
    server.emit(0x30, 1, 5, |e| e.encode_u32(99)).unwrap();
    assert!(wait_until(|| seen.load(Ordering::SeqCst) == 99));

    client.shutdown();
    server.shutdown();
    stop.store(true, Ordering::Release);
    poller.join().unwrap();
    assert!(wait_until(|| pool.in_use() == 0));
}

#[test]
fn stream_frame_without_a_buffer_is_reported() {
    let pool = BufferPool::new(2);
    let (left, _right) = pipes();
    let inbound = Arc::clone(&left.rx);
    let link = Arc::new(StreamTransport::new(left, Arc::clone(&pool)));
    let reports = Reports::default();
    let endpoint = Endpoint::builder(Arc::clone(&link) as Arc<dyn Transport>)
        .name("stream-starved")
        .on_error(reports.hook())
        .start()
        .unwrap();

    let mut frame = [0u8; HEADER_SIZE + 1];
    let header: &mut [u8; HEADER_SIZE] = (&mut frame[..HEADER_SIZE]).try_into().unwrap();
    Header::new(PacketType::Event, 0x30, 1, 0).write(header);
    frame[HEADER_SIZE] = 7;
    let mut wire = [0u8; LEN_PREFIX_SIZE + HEADER_SIZE + 1];
    let n = encode_frame(&frame, &mut wire).unwrap();
    inbound.lock().unwrap().extend(&wire[..n]);

    let held: Vec<_> = std::iter::from_fn(|| pool.try_lease()).collect();
    assert_eq!(link.poll(), Ok(0));
    drop(held);

    let all = reports.all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].source, ErrorSource::Transport);
    assert_eq!((all[0].group, all[0].id, all[0].packet), (0x30, 1, Some(PacketType::Event)));
    assert_eq!(all[0].error, Error::Transport(TransportError::NoBuffer));

    endpoint.shutdown();
    assert_eq!(pool.in_use(), 0);
}
