//! Events from server to client listeners.

use std::sync::{Arc, Mutex};

use rpclink::error::{CodecError, Error, ErrorSource, ResourceError};
use rpclink::rpc::{ListenerState, PacketType};

use crate::harness::{pair, wait_until};

const TELEMETRY: u8 = 0x20;

fn collector() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |v| sink.lock().unwrap().push(v))
}

#[test]
fn events_are_delivered_in_order() {
    let p = pair(vec![], vec![]);
    let (seen, sink) = collector();
    let id = p.client.listen(TELEMETRY, 1, |d| d.decode_u32(), sink).unwrap();

    for v in 0..10 {
        p.server.emit(TELEMETRY, 1, 5, |e| e.encode_u32(v)).unwrap();
    }
    assert!(wait_until(|| seen.lock().unwrap().len() == 10));
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());

    let stats = p.client.listener_stats(id).unwrap();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn version_mismatch_is_counted_not_delivered() {
    let p = pair(vec![], vec![]);
    let (seen, sink) = collector();
    p.client.listen(TELEMETRY, 2, |d| d.decode_u32(), sink).unwrap();

    p.server.emit(TELEMETRY, 1, 5, |e| e.encode_u32(1)).unwrap();
    p.server.emit(0x21, 2, 5, |e| e.encode_u32(2)).unwrap();
    assert!(wait_until(|| p.client.listeners().unmatched() == 2));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn paused_listener_drops_and_counts() {
    let p = pair(vec![], vec![]);
    let (seen, sink) = collector();
    let id = p.client.listen(TELEMETRY, 1, |d| d.decode_u32(), sink).unwrap();

    p.client.pause_listener(id).unwrap();
    assert_eq!(p.client.listener_stats(id).unwrap().state, ListenerState::Paused);
    p.server.emit(TELEMETRY, 1, 5, |e| e.encode_u32(1)).unwrap();
    p.server.emit(TELEMETRY, 1, 5, |e| e.encode_u32(2)).unwrap();
    assert!(wait_until(|| p.client.listener_stats(id).unwrap().dropped == 2));

    p.client.resume_listener(id).unwrap();
    p.server.emit(TELEMETRY, 1, 5, |e| e.encode_u32(3)).unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 1));
    assert_eq!(*seen.lock().unwrap(), vec![3]);

    let stats = p.client.listener_stats(id).unwrap();
    assert_eq!((stats.state, stats.delivered, stats.dropped), (ListenerState::Active, 1, 2));
}

#[test]
fn listener_registration_errors() {
    let p = pair(vec![], vec![]);
    let id = p.client.listen(TELEMETRY, 1, |d| d.decode_u8(), |_| {}).unwrap();
    assert_eq!(
        p.client.listen(TELEMETRY, 1, |d| d.decode_u8(), |_| {}).unwrap_err(),
        Error::Resource(ResourceError::ListenerExists)
    );
    // Another version of the same group is a separate listener.
    assert!(p.client.listen(TELEMETRY, 2, |d| d.decode_u8(), |_| {}).is_ok());

    p.client.unlisten(id).unwrap();
    assert_eq!(p.client.unlisten(id).unwrap_err(), Error::Resource(ResourceError::ListenerNotFound));
    assert_eq!(p.client.pause_listener(id).unwrap_err(), Error::Resource(ResourceError::ListenerNotFound));
    assert!(p.client.listener_stats(id).is_none());
    assert_eq!(p.client.listeners().len(), 1);
}

#[test]
fn undecodable_event_is_reported() {
    let p = pair(vec![], vec![]);
    let (seen, sink) = collector();
    p.client.listen(TELEMETRY, 1, |d| d.decode_u32(), sink).unwrap();

    // Empty payload: the listener's decode runs out of input.
    p.server.emit(TELEMETRY, 1, 0, |_| Ok(())).unwrap();
    assert!(wait_until(|| !p.client_reports.is_empty()));
    let report = p.client_reports.all()[0];
    assert_eq!(report.source, ErrorSource::Receive);
    assert_eq!((report.group, report.id), (TELEMETRY, 1));
    assert_eq!(report.packet, Some(PacketType::Event));
    assert_eq!(report.error, Error::Codec(CodecError::Truncated));
    assert!(seen.lock().unwrap().is_empty());
}
