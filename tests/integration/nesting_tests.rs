//! Commands arriving while a synchronous call is pending run on the
//! blocked caller's thread, to a bounded depth, and never alongside a
//! handler already running for the link.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use rpclink::EndpointConfig;
use rpclink::error::Status;
use rpclink::rpc::{Group, Request};

use crate::harness::{pair, pair_with, wait_until};

const RELAY: u8 = 2;
const ASK_CLIENT: u8 = 0;

const WHOAMI: u8 = 3;
const WHO: u8 = 0;

const PING: u8 = 4;
const COUNT: u8 = 0;

const GUARD: u8 = 5;
const HOLD: u8 = 0;
const QUICK: u8 = 1;

const BOUNCE: u8 = 6;
const CALL_BACK: u8 = 0;

const HOLD_MS: u64 = 300;

/// Server side: asks the client for a value while serving the request.
fn relay_group() -> Group {
    Group::new(RELAY, "relay").command(ASK_CLIENT, |req: &mut Request<'_>| {
        let endpoint = req.endpoint().clone();
        let mut reply = endpoint.call(WHOAMI, WHO, 0, |_| Ok(())).map_err(Status::from)?;
        let value = reply.decoder().decode_u32()?;
        req.respond(5, |e| e.encode_u32(value + 1))
    })
}

/// Client side: records which thread it ran on.
fn whoami_group(seen: Arc<Mutex<Option<ThreadId>>>) -> Group {
    Group::new(WHOAMI, "whoami").command(WHO, move |req: &mut Request<'_>| {
        *seen.lock().unwrap() = Some(std::thread::current().id());
        req.respond(5, |e| e.encode_u32(41))
    })
}

/// Served on both sides: bounce `n - 1` back to the peer until zero, then
/// return the number of hops.
fn ping_group() -> Group {
    Group::new(PING, "ping").command(COUNT, |req: &mut Request<'_>| {
        let n = req.args().decode_u32()?;
        if n == 0 {
            return req.respond(5, |e| e.encode_u32(0));
        }
        let endpoint = req.endpoint().clone();
        let mut reply = endpoint
            .call(PING, COUNT, 5, |e| e.encode_u32(n - 1))
            .map_err(Status::from)?;
        if !reply.is_ok() {
            return Err(reply.status());
        }
        let hops = reply.decoder().decode_u32()?;
        req.respond(5, |e| e.encode_u32(hops + 1))
    })
}

#[test]
fn nested_command_runs_on_the_waiting_thread() {
    let seen = Arc::new(Mutex::new(None));
    let p = pair(vec![relay_group()], vec![whoami_group(Arc::clone(&seen))]);

    let mut reply = p.client.call(RELAY, ASK_CLIENT, 0, |_| Ok(())).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.decoder().decode_u32().unwrap(), 42);
    assert_eq!(*seen.lock().unwrap(), Some(std::thread::current().id()));
    assert_eq!(p.client.nesting_depth(), 0);
    assert!(!p.client.is_call_pending());
}

#[test]
fn ping_pong_within_nesting_limit() {
    let config = EndpointConfig { max_nesting: 4, ..EndpointConfig::default() };
    let p = pair_with(config, vec![ping_group()], vec![ping_group()]);

    let mut reply = p.client.call(PING, COUNT, 5, |e| e.encode_u32(5)).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.decoder().decode_u32().unwrap(), 5);
    assert!(p.client_reports.is_empty());
    assert!(p.server_reports.is_empty());
}

#[test]
fn nesting_beyond_limit_fails_innermost_call() {
    let config = EndpointConfig { max_nesting: 2, ..EndpointConfig::default() };
    let p = pair_with(config, vec![ping_group()], vec![ping_group()]);

    let reply = p.client.call(PING, COUNT, 5, |e| e.encode_u32(6)).unwrap();
    assert_eq!(reply.status(), Status::NO_MEMORY);
    assert_eq!(p.client.nesting_depth(), 0);

    // The link is usable again afterwards.
    let mut reply = p.client.call(PING, COUNT, 5, |e| e.encode_u32(1)).unwrap();
    assert_eq!(reply.decoder().decode_u32().unwrap(), 1);
}

#[test]
fn nesting_depth_is_visible_inside_handlers() {
    let depth = Arc::new(Mutex::new(0usize));
    let observed = Arc::clone(&depth);
    let observer = Group::new(WHOAMI, "depth").command(WHO, move |req: &mut Request<'_>| {
        *observed.lock().unwrap() = req.endpoint().nesting_depth();
        req.respond(5, |e| e.encode_u32(0))
    });
    let p = pair(vec![relay_group()], vec![observer]);

    p.client.call(RELAY, ASK_CLIENT, 0, |_| Ok(())).unwrap();
    assert_eq!(*depth.lock().unwrap(), 1);
}

#[test]
fn failed_nested_call_becomes_a_status() {
    let p = pair(vec![relay_group()], vec![]);
    // No WHOAMI group on the client: the nested call gets an error frame.
    let reply = p.client.call(RELAY, ASK_CLIENT, 0, |_| Ok(())).unwrap();
    assert_eq!(reply.status(), Status::INVALID_ARGS);
    assert_eq!(p.client_reports.all().len(), 1);
}

/// Handlers in flight on one endpoint, and the most seen at once.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    trace: Mutex<Vec<&'static str>>,
}

impl Gauge {
    fn enter(&self, what: &'static str) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.trace.lock().unwrap().push(what);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Server side: a long one-way handler and a quick two-way one.
fn guard_group(gauge: Arc<Gauge>, holding: Arc<AtomicBool>) -> Group {
    let quick = Arc::clone(&gauge);
    Group::new(GUARD, "guard")
        .one_way(HOLD, move |_: &mut Request<'_>| {
            gauge.enter("hold");
            holding.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(HOLD_MS));
            gauge.exit();
            Ok(())
        })
        .command(QUICK, move |req: &mut Request<'_>| {
            quick.enter("quick");
            quick.exit();
            req.respond(5, |e| e.encode_u32(7))
        })
}

/// Client side: serves a server call by calling the server back.
fn bounce_group() -> Group {
    Group::new(BOUNCE, "bounce").command(CALL_BACK, |req: &mut Request<'_>| {
        let endpoint = req.endpoint().clone();
        let mut reply = endpoint.call(GUARD, QUICK, 0, |_| Ok(())).map_err(Status::from)?;
        let value = reply.decoder().decode_u32()?;
        req.respond(5, |e| e.encode_u32(value))
    })
}

#[test]
fn command_waits_for_the_handler_already_running() {
    let gauge = Arc::new(Gauge::default());
    let holding = Arc::new(AtomicBool::new(false));
    let p = pair(
        vec![guard_group(Arc::clone(&gauge), Arc::clone(&holding))],
        vec![bounce_group()],
    );

    p.client.call_one_way(GUARD, HOLD, 0, |_| Ok(())).unwrap();
    assert!(wait_until(|| holding.load(Ordering::SeqCst)));

    // The server blocks on the client, whose handler calls QUICK on the
    // server while HOLD still runs on the server's worker.
    let mut reply = p.server.call(BOUNCE, CALL_BACK, 0, |_| Ok(())).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.decoder().decode_u32().unwrap(), 7);

    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1, "two handlers ran at once on one link");
    assert_eq!(*gauge.trace.lock().unwrap(), vec!["hold", "quick"]);
    assert!(p.server_reports.is_empty());
    assert!(!p.server.is_call_pending());
}

#[test]
fn link_serves_nested_calls_after_a_queued_handler() {
    let gauge = Arc::new(Gauge::default());
    let holding = Arc::new(AtomicBool::new(false));
    let p = pair(
        vec![guard_group(Arc::clone(&gauge), Arc::clone(&holding))],
        vec![bounce_group()],
    );

    for _ in 0..2 {
        holding.store(false, Ordering::SeqCst);
        p.client.call_one_way(GUARD, HOLD, 0, |_| Ok(())).unwrap();
        assert!(wait_until(|| holding.load(Ordering::SeqCst)));
        let reply = p.server.call(BOUNCE, CALL_BACK, 0, |_| Ok(())).unwrap();
        assert!(reply.is_ok());
    }
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert!(wait_until(|| p.pool.in_use() == 0));
}
