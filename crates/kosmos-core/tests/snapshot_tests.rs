//! Snapshot tests for tree dumps, program listings and error reports.

use std::sync::Arc;
use std::time::Duration;

use insta::assert_snapshot;
use kosmos_core::{Kosmos, KosmosConfig, ModuleConfig, SimulatedFpga, build_status_report};
use kosmos_errors::{SequencerError, SequencerErrorKind};
use kosmos_protocol::{SequencerState, SequencerStatus, StatusEntry, StatusFlags, StatusRecord};

fn instrument(modules: Vec<ModuleConfig>) -> Result<Kosmos, Box<dyn std::error::Error>> {
    let mut builder = KosmosConfig::builder();
    for module in modules {
        builder = builder.module(module);
    }
    let config = builder.build()?;
    let sim = Arc::new(SimulatedFpga::new(&config)?);
    Ok(Kosmos::new(config, sim)?)
}

#[test]
fn test_tree_description() -> Result<(), Box<dyn std::error::Error>> {
    let kosmos = instrument(vec![ModuleConfig::kbd_matrix(), ModuleConfig::led_spy()])?;
    assert_snapshot!(
        kosmos.tree().describe().trim_end().replace('\n', "|"),
        @"0x02 PES          Pes buffer=4096 fifo=64 pending=0|0x10 KBD_MATRIX   Consumer buffer=1024 fifo=16 pending=0|0x11 LED_SPY      Producer buffer=1024 fifo=16 pending=0|action 0x001 KBD_MATRIX.SEND|action 0x002 LED_SPY.START|action 0x004 LED_SPY.STOP|resume 0x001 GO_RPI|resume 0x002 KBD_MATRIX.READY"
    );
    Ok(())
}

#[test]
fn test_keystroke_listing() -> Result<(), Box<dyn std::error::Error>> {
    let mut kosmos = instrument(vec![ModuleConfig::kbd_matrix()])?;
    kosmos
        .scenario()
        .keystroke("A", Duration::from_millis(50))?
        .wait_kbd()?;
    assert_snapshot!(
        kosmos.tree().pes().disassemble().replace('\n', "|"),
        @"0000: 0x10000001 EXECUTE actions=0x001|0001: 0x83ffe000 DELAY ticks=3275200 mantissa=0xffe exponent=3 actions=0x000|0002: 0x82ffe000 DELAY ticks=1637600 mantissa=0xffe exponent=2 actions=0x000|0003: 0x80368001 DELAY ticks=87200 mantissa=0x368 exponent=0 actions=0x001|0004: 0x20000002 WAIT events=0x002"
    );
    Ok(())
}

#[test]
fn test_not_clean_report() -> Result<(), Box<dyn std::error::Error>> {
    let kosmos = instrument(vec![ModuleConfig::kbd_matrix()])?;
    let status = SequencerStatus {
        state: SequencerState::Running,
        entries: vec![
            StatusEntry {
                msg_id: 0x02,
                sub: 0,
                record: StatusRecord {
                    fifo_count: 3,
                    buffer_count: 7,
                    ..StatusRecord::default()
                },
            },
            StatusEntry {
                msg_id: 0x10,
                sub: 0,
                record: StatusRecord {
                    flags: StatusFlags::UNDERRUN,
                    ..StatusRecord::default()
                },
            },
        ],
    };
    let report = build_status_report(kosmos.tree().message_table(), &status);
    let error = SequencerError::new(SequencerErrorKind::NotClean, report);
    assert_snapshot!(
        error.to_string().replace('\n', "|"),
        @"Modules are not clean before run|Sequencer state: RUNNING|  PES: fifo=3 buffer=7|  KBD_MATRIX: fifo=0 buffer=0 UNDERRUN|  raw: 03 02 02 00 03 00 07 00 00 00 00 00 10 00 00 00 00 00 04 00 00 00"
    );
    Ok(())
}
