//! rpclink demo: two endpoints on an in-process link.
//!
//! ```text
//!  ┌──────────────┐   loopback pair    ┌──────────────┐
//!  │ host         │◀──────────────────▶│ sensor       │
//!  │ (client)     │  shared buf pool   │ (group 0x10) │
//!  └──────────────┘                    └──────────────┘
//! ```
//!
//! Performs a synchronous call, a callback round trip (the sensor side
//! invokes a host function through its proxy handle while the host's call
//! is still pending) and an event.
#![deny(unused_must_use)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use rpclink::EndpointConfig;
use rpclink::error::Status;
use rpclink::rpc::{
    BufferPool, CallbackHandle, Decoder, Encoder, Endpoint, Group, LoopbackTransport, Request,
    Transport,
};

// ── Sensor service ────────────────────────────────────────────

const SENSOR_GROUP: u8 = 0x10;
const CMD_READ: u8 = 0;
const CMD_CALIBRATE: u8 = 1;
const EVT_VERSION: u8 = 1;

/// Fake sample per channel.
fn sample(channel: u8) -> u32 {
    1000 + u32::from(channel) * 25
}

fn read(req: &mut Request<'_>) -> Result<(), Status> {
    let channel = req.args().decode_u8()?;
    if channel > 7 {
        return Err(Status::INVALID_ARGS);
    }
    req.respond(5, |enc| enc.encode_u32(sample(channel)))
}

/// Ask the caller's correction callback for an offset, then apply it.
fn calibrate(req: &mut Request<'_>) -> Result<(), Status> {
    let channel = req.args().decode_u8()?;
    let handle: CallbackHandle = req.args().decode()?;
    let raw = sample(channel);

    let endpoint = req.endpoint().clone();
    let mut reply = endpoint
        .invoke_callback(handle, 5, |enc| enc.encode_u32(raw))
        .map_err(Status::from)?;
    if !reply.is_ok() {
        return Err(reply.status());
    }
    let offset = reply.decoder().decode_i32()?;
    let corrected = raw.saturating_add_signed(offset);
    req.respond(5, |enc| enc.encode_u32(corrected))
}

fn sensor_group() -> Group {
    Group::new(SENSOR_GROUP, "sensor")
        .command(CMD_READ, read)
        .command(CMD_CALIBRATE, calibrate)
        .on_init(|ep| info!("[{}] sensor group ready", ep.name()))
}

// ── Host side ─────────────────────────────────────────────────

/// Correction callback run on the host on behalf of the sensor side.
fn correction(ctx: usize, args: &mut Decoder<'_>, out: &mut Encoder<'_>) -> Result<(), Status> {
    let raw = args.decode_u32()?;
    info!("[host] correcting raw={} with ctx={}", raw, ctx);
    out.encode_i32(-(ctx as i32))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let pool = BufferPool::new(16);
    let (host_link, sensor_link) = LoopbackTransport::pair(Arc::clone(&pool));

    let sensor = Endpoint::builder(Arc::new(sensor_link) as Arc<dyn Transport>)
        .name("sensor")
        .group(sensor_group())?
        .start()?;

    let config = EndpointConfig::from_json(r#"{ "response_timeout_ms": 500 }"#)?;
    let host = Endpoint::builder(Arc::new(host_link) as Arc<dyn Transport>)
        .name("host")
        .config(config)?
        .on_error(|report| warn!("[host] error hook: {}", report))
        .start()?;

    // Synchronous call
    let value = host.call_with(
        SENSOR_GROUP,
        CMD_READ,
        1,
        |enc| enc.encode_u8(3),
        |status, dec| {
            if status.is_ok() { dec.decode_u32().map(Some) } else { Ok(None) }
        },
    )?;
    info!("[host] channel 3 reads {:?}", value);

    // Callback round trip
    let handle = host.callbacks().register(correction, 40)?;
    let mut reply = host.call(SENSOR_GROUP, CMD_CALIBRATE, 8, |enc| {
        enc.encode_u8(3)?;
        enc.encode(&handle)
    })?;
    if !reply.is_ok() {
        bail!("calibrate failed: {}", reply.status());
    }
    let corrected = reply.decoder().decode_u32().context("calibrate reply")?;
    reply.release();
    info!("[host] calibrated channel 3 reads {}", corrected);

    // Event
    host.listen(SENSOR_GROUP, EVT_VERSION, |dec| dec.decode_u32(), |v| {
        info!("[host] event: sample {}", v);
    })?;
    sensor.emit(SENSOR_GROUP, EVT_VERSION, 5, |enc| enc.encode_u32(sample(1)))?;
    std::thread::sleep(Duration::from_millis(50));

    sensor.shutdown();
    host.shutdown();
    info!("buffers still leased: {}", pool.in_use());
    Ok(())
}
