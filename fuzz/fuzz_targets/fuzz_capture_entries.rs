//! Fuzzes LED and I2C spy capture parsing.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_capture_entries
#![no_main]
use kosmos_protocol::{group_i2c_frames, parse_i2c_entries, parse_led_entries};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let words: Vec<u32> = data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let _ = parse_led_entries(&words);
    if let Ok(events) = parse_i2c_entries(&words) {
        let _ = group_i2c_frames(&events);
    }
});
