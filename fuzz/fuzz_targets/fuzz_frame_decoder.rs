//! Fuzzes the streaming link frame decoder.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_frame_decoder
#![no_main]
use kosmos_protocol::FrameDecoder;
use kosmos_protocol::table::INSTRUCTION_WIDTH;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Split the input in two pushes so frames straddle reads.
    let (head, tail) = data.split_at(data.len() / 2);
    let mut decoder = FrameDecoder::new();
    decoder.push(head);
    decoder.push(tail);
    // Each iteration consumes input or stops.
    while let Ok(Some(frame)) = decoder.next_frame(|_| Some(INSTRUCTION_WIDTH)) {
        if let Ok(bytes) = frame.encode() {
            assert_eq!(kosmos_protocol::frame::decode_complete(&bytes), Ok(frame));
        }
    }
});
