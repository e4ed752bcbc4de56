//! Fuzz target: header parsing and payload decoding of a received frame.
//!
//! Treats the input as a raw frame: parses the header, then walks the
//! payload with the cursor decoder the way handlers and the reply path do,
//! copying strings into the frame's scratchpad.
//!
//! cargo fuzz run fuzz_frame_payload

#![no_main]

use libfuzzer_sys::fuzz_target;
use rpclink::rpc::{Header, MAX_FRAME_SIZE, RxBuffer};

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_FRAME_SIZE {
        return;
    }
    let Ok(mut frame) = RxBuffer::from_slice(data, None) else {
        return;
    };
    let header = match frame.header() {
        Ok(h) => h,
        Err(_) => {
            assert!(Header::parse(data).is_err());
            return;
        }
    };
    let _ = header.expects_reply();

    let (mut args, mut pad) = frame.split();
    // Status first, as a reply carries it.
    let _ = args.decode_i32();
    for _ in 0..16 {
        let at = args.position();
        let step = match at % 4 {
            0 => pad.decode_cstr(&mut args).map(|_| ()).map_err(|_| ()),
            1 => pad.decode_bytes(&mut args).map(|_| ()).map_err(|_| ()),
            2 => args.decode_map_start().map(|_| ()).map_err(|_| ()),
            _ => args.decode_u64().map(|_| ()).map_err(|_| ()),
        };
        if step.is_err() {
            assert_eq!(args.position(), at, "failed decode must not move the cursor");
            if args.decode_u8().is_err() {
                break;
            }
        }
    }
});
