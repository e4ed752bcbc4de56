//! Callback proxies: a handle registered on one endpoint, invoked by the
//! peer through the reserved callback group.

use rpclink::error::{ResourceError, Status};
use rpclink::rpc::{CALLBACK_SLOTS, CallbackHandle, Decoder, Encoder, Group, Request};

use crate::harness::pair;

const SCALER: u8 = 5;
const APPLY: u8 = 0;

/// `ctx` is the factor.
fn scale(ctx: usize, args: &mut Decoder<'_>, out: &mut Encoder<'_>) -> Result<(), Status> {
    let v = args.decode_u32()?;
    out.encode_u32(v * ctx as u32)?;
    Ok(())
}

fn reject(_: usize, _: &mut Decoder<'_>, _: &mut Encoder<'_>) -> Result<(), Status> {
    Err(Status::INVALID_ARGS)
}

/// Takes a value and a handle, runs the handle on the value.
fn scaler_group() -> Group {
    Group::new(SCALER, "scaler").command(APPLY, |req: &mut Request<'_>| {
        let value = req.args().decode_u32()?;
        let handle: CallbackHandle = req.args().decode()?;
        let endpoint = req.endpoint().clone();
        let mut reply = endpoint
            .invoke_callback(handle, 5, |e| e.encode_u32(value))
            .map_err(Status::from)?;
        if !reply.is_ok() {
            return Err(reply.status());
        }
        let scaled = reply.decoder().decode_u32()?;
        req.respond(5, |e| e.encode_u32(scaled))
    })
}

#[test]
fn handle_passed_in_a_call_is_invoked_nested() {
    let p = pair(vec![scaler_group()], vec![]);
    let handle = p.client.callbacks().register(scale, 3).unwrap();

    let mut reply = p
        .client
        .call(SCALER, APPLY, 10, |e| {
            e.encode_u32(14)?;
            e.encode(&handle)
        })
        .unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.decoder().decode_u32().unwrap(), 42);
}

#[test]
fn callback_invoked_directly_is_served_by_the_worker() {
    let p = pair(vec![], vec![]);
    let handle = p.client.callbacks().register(scale, 10).unwrap();

    let mut reply = p.server.invoke_callback(handle, 5, |e| e.encode_u32(7)).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.decoder().decode_u32().unwrap(), 70);
}

#[test]
fn callback_status_is_propagated() {
    let p = pair(vec![scaler_group()], vec![]);
    let handle = p.client.callbacks().register(reject, 0).unwrap();

    let reply = p
        .client
        .call(SCALER, APPLY, 10, |e| {
            e.encode_u32(1)?;
            e.encode(&handle)
        })
        .unwrap();
    assert_eq!(reply.status(), Status::INVALID_ARGS);
}

#[test]
fn unknown_or_deregistered_handle_is_no_entry() {
    let p = pair(vec![], vec![]);
    let reply = p.server.invoke_callback(CallbackHandle(7), 0, |_| Ok(())).unwrap();
    assert_eq!(reply.status(), Status::NO_ENTRY);

    let handle = p.client.callbacks().register(scale, 2).unwrap();
    assert!(p.client.callbacks().deregister(handle));
    let reply = p.server.invoke_callback(handle, 5, |e| e.encode_u32(1)).unwrap();
    assert_eq!(reply.status(), Status::NO_ENTRY);
}

#[test]
fn registration_is_idempotent_and_bounded() {
    let p = pair(vec![], vec![]);
    let table = p.client.callbacks();
    assert_eq!(table.capacity(), CALLBACK_SLOTS);

    let first = table.register(scale, 0).unwrap();
    assert_eq!(table.register(scale, 0).unwrap(), first);
    for ctx in 1..CALLBACK_SLOTS {
        table.register(scale, ctx).unwrap();
    }
    assert_eq!(table.occupancy(), CALLBACK_SLOTS);
    assert_eq!(table.register(scale, CALLBACK_SLOTS), Err(ResourceError::CallbackTableFull));

    // Existing pairs still resolve and still work when the table is full.
    let last = table.register(scale, CALLBACK_SLOTS - 1).unwrap();
    let mut reply = p.server.invoke_callback(last, 5, |e| e.encode_u32(2)).unwrap();
    assert_eq!(reply.decoder().decode_u32().unwrap(), 2 * (CALLBACK_SLOTS as u32 - 1));
}
