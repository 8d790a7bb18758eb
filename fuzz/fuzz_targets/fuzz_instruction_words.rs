//! Fuzzes the PES, KBD, button/axis and optical emulator instruction decoders.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_instruction_words
#![no_main]
use kosmos_protocol::{BasInstruction, KbdInstruction, OptEmuInstruction, PesInstruction};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for c in data.chunks_exact(4) {
        let word = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        if let Ok(pes) = PesInstruction::decode(word) {
            let _ = pes.encode();
        }
        let _ = KbdInstruction::decode(word);
        if let Ok(bas) = BasInstruction::decode(word) {
            assert_eq!(bas.encode(), word);
        }
        let _ = OptEmuInstruction::decode(word);
    }
});
