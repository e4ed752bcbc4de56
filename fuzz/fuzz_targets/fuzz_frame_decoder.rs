//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences into the streaming frame decoder and
//! asserts that it never panics, always makes progress, and never yields
//! an empty or oversized frame.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use rpclink::rpc::MAX_FRAME_SIZE;
use rpclink::rpc::stream::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();

    let mut offset = 0;
    while offset < data.len() {
        let (used, frame) = decoder.feed(&data[offset..]);
        if let Some(frame) = frame {
            assert!(!frame.is_empty(), "decoder must not yield an empty frame");
            assert!(frame.len() <= MAX_FRAME_SIZE, "frame exceeds MAX_FRAME_SIZE");
        }
        assert!(used > 0, "feed must consume input");
        offset += used;
    }

    // After a reset the decoder must accept bytes cleanly again.
    decoder.reset();
    let _ = decoder.feed(data);
});
