//! The byte-level link against the simulated instrument.

use std::sync::Arc;
use std::time::Duration;

use kosmos_core::transport::mock::MockStream;
use kosmos_core::{
    HardwareModule, Kosmos, KosmosConfig, KosmosError, ModuleConfig, SimulatedFpga,
    StreamTransport, Transport,
};
use kosmos_errors::TransportError;
use kosmos_protocol::{Frame, ModuleStatus, Reply, cmd, msg_id};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn linked(
    config: &KosmosConfig,
) -> Result<(Arc<SimulatedFpga>, MockStream), Box<dyn std::error::Error>> {
    let sim = Arc::new(SimulatedFpga::new(config)?);
    let responder = Arc::clone(&sim);
    let stream = MockStream::with_responder(move |frame| responder.handle_frame(frame));
    Ok((sim, stream))
}

#[test]
fn test_keystroke_over_stream() -> TestResult {
    let config = KosmosConfig::builder()
        .poll_interval_ms(1)
        .max_bulk_entries(2)
        .module(ModuleConfig::kbd_matrix())
        .build()?;
    let (sim, stream) = linked(&config)?;
    let transport = Arc::new(StreamTransport::new(stream.clone()));
    let mut kosmos = Kosmos::new(config, transport)?;

    kosmos
        .scenario()
        .keystroke("A", Duration::from_millis(10))?
        .wait_kbd()?;
    let pes_words = kosmos.tree().pes().base().len();
    kosmos.play()?;

    assert_eq!(sim.keyboard_reports().len(), 2);
    let bulk: Vec<(u8, usize)> = stream
        .written_frames()
        .iter()
        .filter_map(|f| match f {
            Frame::Bulk { msg_id, data, .. } => Some((*msg_id, data.len() / 4)),
            _ => None,
        })
        .collect();
    // chunks of at most two instructions
    assert!(bulk.iter().all(|(_, n)| *n <= 2));
    let pes_uploaded: usize = bulk
        .iter()
        .filter(|(id, _)| *id == msg_id::PES)
        .map(|(_, n)| n)
        .sum();
    // plus the WAIT on KBD_MATRIX.READY put at the head of the program
    assert_eq!(pes_uploaded, pes_words + 1);
    assert_eq!(stream.pending(), 0);
    Ok(())
}

#[test]
fn test_unknown_command_is_rejected_by_instrument() -> TestResult {
    let config = KosmosConfig::builder().module(ModuleConfig::opt_emu()).build()?;
    let (_sim, stream) = linked(&config)?;
    let transport = Arc::new(StreamTransport::new(stream));
    let kosmos = Kosmos::new(config, transport.clone())?;

    let id = kosmos.tree().opt_emu(0)?.settings().msg_id;
    let result = transport.send_control(id, cmd::START, &[]);
    assert!(matches!(result, Ok(Reply::Module(_))));

    // READ is not a consumer command: refused before reaching the link
    let result = transport.send_control(id, cmd::READ_1, &[]);
    assert!(matches!(result, Err(KosmosError::Transport(_))));
    Ok(())
}

#[test]
fn test_emulator_control_commands() -> TestResult {
    let config = KosmosConfig::builder().module(ModuleConfig::opt_emu()).build()?;
    let sim = Arc::new(SimulatedFpga::new(&config)?);
    let kosmos = Kosmos::new(config, sim)?;
    let emu = kosmos.tree().opt_emu(0)?;
    let transport = kosmos.tree().transport();

    let status = emu.start_emulator(transport)?;
    assert!(matches!(status, ModuleStatus::Consumer(s) if s.enabled));
    emu.force_update(transport)?;
    let status = emu.stop_emulator(transport)?;
    assert!(matches!(status, ModuleStatus::Consumer(s) if !s.enabled));

    // updating a stopped emulator is a status mismatch
    assert!(matches!(
        emu.force_update(transport),
        Err(KosmosError::Sequencer(_))
    ));
    Ok(())
}

#[test]
fn test_closed_stream() -> TestResult {
    let config = KosmosConfig::builder().build()?;
    let stream = MockStream::with_responder(|_| Vec::new());
    let transport = Arc::new(StreamTransport::new(stream));
    let kosmos = Kosmos::new(config, transport)?;
    let result = kosmos.status();
    assert!(matches!(
        result,
        Err(KosmosError::Transport(
            TransportError::Timeout { .. } | TransportError::Closed | TransportError::Io { .. }
        ))
    ));
    Ok(())
}
