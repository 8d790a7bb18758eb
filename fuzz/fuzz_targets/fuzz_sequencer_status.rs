//! Fuzzes the aggregated sequencer status and timer record parsers.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_sequencer_status
#![no_main]
use kosmos_protocol::SequencerStatus;
use kosmos_protocol::status::decode_timer_records;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(status) = SequencerStatus::decode(data) {
        let _ = status.encode();
    }
    let _ = decode_timer_records(data);
});
