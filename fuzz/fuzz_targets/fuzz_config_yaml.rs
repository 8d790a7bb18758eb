//! Fuzzes instrument configuration loading and Device Tree id allocation.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_config_yaml
#![no_main]
use kosmos_core::KosmosConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = KosmosConfig::from_yaml_str(text) {
        let _ = config.tree.resolve();
    }
});
