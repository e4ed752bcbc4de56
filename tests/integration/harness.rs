//! Shared fixtures: two endpoints on a loopback pair, a service group used
//! by most tests, and an error-report recorder.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rpclink::EndpointConfig;
use rpclink::error::{ErrorReport, Status};
use rpclink::rpc::{BufferPool, Endpoint, Group, LoopbackTransport, Request, Transport};

pub const MATH: u8 = 1;
pub const ADD: u8 = 0;
pub const FAIL: u8 = 1;
pub const SLOW: u8 = 2;
pub const ECHO: u8 = 3;
pub const POKE: u8 = 4;
pub const ACK: u8 = 5;
pub const STRICT: u8 = 6;
pub const CSTR_LEN: u8 = 7;

pub const SLOW_MS: u64 = 120;

/// Error reports captured from an endpoint's hook.
#[derive(Clone, Default)]
pub struct Reports(Arc<Mutex<Vec<ErrorReport>>>);

impl Reports {
    pub fn hook(&self) -> impl Fn(&ErrorReport) + Send + Sync + 'static {
        let sink = Arc::clone(&self.0);
        move |r| sink.lock().unwrap().push(*r)
    }

    pub fn all(&self) -> Vec<ErrorReport> {
        self.0.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

pub struct Pair {
    pub pool: Arc<BufferPool>,
    pub client_link: Arc<LoopbackTransport>,
    pub server_link: Arc<LoopbackTransport>,
    pub client: Endpoint,
    pub server: Endpoint,
    pub client_reports: Reports,
    pub server_reports: Reports,
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.client.shutdown();
        self.server.shutdown();
    }
}

pub fn pair(server_groups: Vec<Group>, client_groups: Vec<Group>) -> Pair {
    pair_with(EndpointConfig::default(), server_groups, client_groups)
}

pub fn pair_with(config: EndpointConfig, server_groups: Vec<Group>, client_groups: Vec<Group>) -> Pair {
    let pool = BufferPool::new(16);
    let (c, s) = LoopbackTransport::pair(Arc::clone(&pool));
    let client_link = Arc::new(c);
    let server_link = Arc::new(s);
    let client_reports = Reports::default();
    let server_reports = Reports::default();

    let mut server = Endpoint::builder(Arc::clone(&server_link) as Arc<dyn Transport>)
        .name("server")
        .config(config.clone())
        .unwrap()
        .on_error(server_reports.hook());
    for g in server_groups {
        server = server.group(g).unwrap();
    }
    let server = server.start().unwrap();

    let mut client = Endpoint::builder(Arc::clone(&client_link) as Arc<dyn Transport>)
        .name("client")
        .config(config)
        .unwrap()
        .on_error(client_reports.hook());
    for g in client_groups {
        client = client.group(g).unwrap();
    }
    let client = client.start().unwrap();

    Pair { pool, client_link, server_link, client, server, client_reports, server_reports }
}

/// Client with no groups against a server serving [`math_group`].
pub fn math_pair() -> Pair {
    pair(vec![math_group(Arc::new(AtomicU32::new(0)))], vec![])
}

/// Poll `cond` for up to a second.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// The service most tests call. `pokes` counts one-way `POKE` commands.
pub fn math_group(pokes: Arc<AtomicU32>) -> Group {
    Group::new(MATH, "math")
        .command(ADD, |req: &mut Request<'_>| {
            let a = req.args().decode_u32()?;
            let b = req.args().decode_u32()?;
            req.respond(5, |e| e.encode_u32(a.wrapping_add(b)))
        })
        .command(FAIL, |_: &mut Request<'_>| Err(Status(-5)))
        .command(SLOW, |req: &mut Request<'_>| {
            std::thread::sleep(Duration::from_millis(SLOW_MS));
            req.respond(1, |e| e.encode_u8(0xAB))
        })
        .command(ECHO, |req: &mut Request<'_>| {
            let s = req.args().decode_str()?;
            req.respond(s.len() + 5, |e| e.encode_str(s))
        })
        .one_way(POKE, move |_: &mut Request<'_>| {
            pokes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .command(ACK, |_: &mut Request<'_>| Ok(()))
        .command(STRICT, |req: &mut Request<'_>| {
            let _n = req.args().decode_u32()?;
            let _name = req.args().decode_str()?;
            Ok(())
        })
        .command(CSTR_LEN, |req: &mut Request<'_>| {
            let (args, pad) = req.parts();
            let name = pad.decode_cstr(args)?;
            let len = name.to_bytes().len() as u32;
            req.respond(5, |e| e.encode_u32(len))
        })
}
