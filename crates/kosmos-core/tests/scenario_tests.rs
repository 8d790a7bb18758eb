//! End-to-end scenarios played on the simulated instrument.

use std::sync::Arc;
use std::time::Duration;

use kosmos_core::config::OptEmuConfig;
use kosmos_core::sim::spi_reg;
use kosmos_core::{
    HardwareModule, Kosmos, KosmosConfig, KosmosError, ModuleConfig, MouseReport, PlayOptions,
    SimulatedFpga, TimerOp,
};
use kosmos_errors::{DomainError, FatalHardwareError, SequencerError, SequencerErrorKind};
use kosmos_protocol::capture::{I2cEventKind, I2cSpyEntry, LedSpyEntry};
use kosmos_protocol::{LedEvent, SequencerState, TimerId};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// 50 ms at the default 10 ns clock.
const FIFTY_MS_TICKS: u64 = 5_000_000;

fn config(modules: Vec<ModuleConfig>) -> Result<KosmosConfig, Box<dyn std::error::Error>> {
    let mut builder = KosmosConfig::builder().poll_interval_ms(1);
    for module in modules {
        builder = builder.module(module);
    }
    Ok(builder.build()?)
}

fn instrument(
    config: KosmosConfig,
) -> Result<(Arc<SimulatedFpga>, Kosmos), Box<dyn std::error::Error>> {
    let sim = Arc::new(SimulatedFpga::new(&config)?);
    let kosmos = Kosmos::new(config, sim.clone())?;
    Ok((sim, kosmos))
}

fn keyboard() -> Result<(Arc<SimulatedFpga>, Kosmos), Box<dyn std::error::Error>> {
    instrument(config(vec![ModuleConfig::kbd_matrix()])?)
}

fn sequencer_kind(result: Result<(), KosmosError>) -> Option<SequencerErrorKind> {
    match result {
        Err(KosmosError::Sequencer(SequencerError { kind, .. })) => Some(kind),
        _ => None,
    }
}

#[test]
fn test_single_keystroke() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    kosmos
        .scenario()
        .keystroke("A", Duration::from_millis(50))?
        .wait_kbd()?;
    kosmos.play()?;

    let reports = sim.keyboard_reports();
    let [down, up] = reports.as_slice() else {
        return Err(format!("expected two reports, got {reports:?}").into());
    };
    assert_eq!(down.keys, vec!["A".to_string()]);
    assert_eq!(down.modifiers, 0);
    assert!(up.keys.is_empty());
    assert_eq!(up.modifiers, 0);
    assert_eq!(up.tick.checked_sub(down.tick), Some(FIFTY_MS_TICKS));
    assert_eq!(sim.state(), SequencerState::Idle);
    Ok(())
}

#[test]
fn test_release_all() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    kosmos
        .scenario()
        .multiple_keys_press(&["A", "LEFT_SHIFT", "Q"])?
        .release_all()?
        .delay(Duration::from_millis(50))?;
    kosmos.play()?;

    let reports = sim.keyboard_reports();
    let [held, released] = reports.as_slice() else {
        return Err(format!("expected two reports, got {reports:?}").into());
    };
    assert_eq!(held.keys, vec!["A".to_string(), "Q".to_string()]);
    assert_eq!(held.modifiers, 0b10);
    assert!(released.keys.is_empty());
    assert_eq!(released.modifiers, 0);
    assert!(released.tick.saturating_sub(held.tick) < FIFTY_MS_TICKS);
    assert!(kosmos.tree().kbd()?.lanes().is_empty());
    assert!(kosmos.tree().kbd()?.pressed_keys().is_empty());
    Ok(())
}

#[test]
fn test_multi_key_press_single_report() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    kosmos
        .scenario()
        .multiple_keys_press(&["A", "B", "C", "D"])?
        .wait_kbd()?;

    // one refill interval per updated key, then one latch
    let refill = kosmos.config().pes.refill_interval();
    assert_eq!(kosmos.tree().kbd()?.base().len(), 5);
    assert!(kosmos.tree().pes().duration() >= refill.saturating_mul(4));
    kosmos.play()?;

    let reports = sim.keyboard_reports();
    let [report] = reports.as_slice() else {
        return Err(format!("expected one report, got {reports:?}").into());
    };
    assert_eq!(report.keys, vec!["A", "B", "C", "D"]);
    Ok(())
}

#[test]
fn test_staged_updates_latch_once() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    kosmos
        .scenario()
        .kbd_update("X", true)?
        .delay(Duration::from_micros(4))?
        .kbd_update("Y", true)?
        .delay(Duration::from_micros(4))?
        .kbd_send()?
        .wait_kbd()?;
    kosmos.play()?;
    let reports = sim.keyboard_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports.first().map(|r| r.keys.clone()),
        Some(vec!["X".to_string(), "Y".to_string()])
    );
    Ok(())
}

#[test]
fn test_sensor_motion_raw() -> TestResult {
    let emulator = ModuleConfig::OptEmu(OptEmuConfig {
        compression: false,
        ..OptEmuConfig::default()
    });
    let (sim, mut kosmos) = instrument(config(vec![emulator])?)?;
    kosmos.scenario().sensor_motion(0, 1, 2, false)?;
    assert_eq!(kosmos.tree().opt_emu(0)?.base().len(), 2);
    kosmos.play()?;

    let mouse = sim.mouse_reports();
    let [MouseReport { run, dx, dy, .. }] = mouse.as_slice() else {
        return Err(format!("expected one mouse report, got {mouse:?}").into());
    };
    assert_eq!((*run, *dx, *dy), (1, 1, 2));

    let trace: Vec<(u8, u8)> = sim
        .spi_trace()
        .iter()
        .map(|t| (t.register, t.value))
        .collect();
    assert_eq!(
        trace,
        vec![
            (spi_reg::MOTION, spi_reg::MOTION_FLAG),
            (spi_reg::DELTA_X, 1),
            (spi_reg::DELTA_Y, 2),
        ]
    );
    Ok(())
}

#[test]
fn test_sensor_frames_skip_then_repeat() -> TestResult {
    let (sim, mut kosmos) = instrument(config(vec![ModuleConfig::opt_emu()])?)?;
    kosmos.scenario().sensor_frames(0, -3, 1, false, 2, 1)?;
    kosmos.play()?;

    let mouse = sim.mouse_reports();
    assert_eq!(mouse.len(), 2);
    assert!(mouse.iter().all(|m| m.dx == -3 && m.dy == 1));
    let idle = sim
        .spi_trace()
        .iter()
        .filter(|t| t.register == spi_reg::MOTION && t.value == 0)
        .count();
    assert_eq!(idle, 2);
    Ok(())
}

#[test]
fn test_lifted_sensor_reports_nothing() -> TestResult {
    let (sim, mut kosmos) = instrument(config(vec![ModuleConfig::opt_emu()])?)?;
    kosmos
        .scenario()
        .sensor_lift(0, true)?
        .sensor_motion(0, 5, 5, true)?;
    kosmos.play()?;
    assert!(sim.mouse_reports().is_empty());
    Ok(())
}

#[test]
fn test_button_click_and_axis_move() -> TestResult {
    let (sim, mut kosmos) = instrument(config(vec![ModuleConfig::button_axis()])?)?;
    kosmos
        .scenario()
        .axis_move(0, 0, 0x0FFF)?
        .button_click(0, 2, Duration::from_millis(50))?
        .button_axis_rest(0)?
        .delay(Duration::from_millis(1))?;
    kosmos.play()?;

    let reports = sim.button_axis_reports();
    let [moved, down, up, rest] = reports.as_slice() else {
        return Err(format!("expected four reports, got {reports:?}").into());
    };
    assert_eq!(moved.axes, vec![0x0FFF, 0x0800]);
    assert!(moved.pressed.is_empty());
    assert_eq!(down.pressed, vec![2]);
    assert!(up.pressed.is_empty());
    assert_eq!(up.tick.checked_sub(down.tick), Some(FIFTY_MS_TICKS));
    assert_eq!(rest.axes, vec![0x0800, 0x0800]);

    let bas = kosmos.tree().button_axis(0)?;
    let status = bas.status(kosmos.tree().transport())?;
    assert_eq!(status.fifo_count(), 0);
    assert_eq!(status.buffer_count(), 0);
    assert!(!status.overrun());
    assert_eq!(bas.axis(0)?, 0x0800);
    Ok(())
}

#[test]
fn test_timeout_reports_running_state() -> TestResult {
    let config = config(vec![ModuleConfig::kbd_matrix()])?;
    let sim = Arc::new(SimulatedFpga::new(&config)?.with_time_scale_percent(50));
    let mut kosmos = Kosmos::new(config, sim.clone())?;
    kosmos.scenario().delay(Duration::from_secs(10))?;

    let result = kosmos.play_with(&PlayOptions::with_timeout(Duration::from_secs(1)));
    let Err(KosmosError::Sequencer(error)) = result else {
        return Err(format!("expected a sequencer error, got {result:?}").into());
    };
    assert!(error.is_timeout());
    assert_eq!(error.kind, SequencerErrorKind::Timeout { timeout_ms: 1000 });
    assert_eq!(error.report.state, "RUNNING");
    assert!(!error.report.raw.is_empty());
    // the scenario survives a failed play
    assert!(!kosmos.tree().pes().base().is_empty());
    Ok(())
}

#[test]
fn test_repetitions_replay_identical_reports() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    kosmos
        .scenario()
        .keystroke("A", Duration::from_millis(50))?
        .wait_kbd()?;
    kosmos.play_with(&PlayOptions::with_timeout(Duration::from_secs(5)).repetitions(2))?;

    let reports = sim.keyboard_reports();
    assert_eq!(reports.len(), 6);
    let first: Vec<_> = reports
        .iter()
        .filter(|r| r.run == 1)
        .map(|r| (r.tick, r.keys.clone()))
        .collect();
    assert_eq!(first.len(), 2);
    for run in 2..=3 {
        let again: Vec<_> = reports
            .iter()
            .filter(|r| r.run == run)
            .map(|r| (r.tick, r.keys.clone()))
            .collect();
        assert_eq!(again, first, "run {run}");
    }
    assert_eq!(
        sim.command_count(kosmos_protocol::msg_id::SEQUENCER, kosmos_protocol::cmd::START),
        3
    );
    assert!(kosmos.tree().pes().base().is_empty());
    Ok(())
}

#[test]
fn test_hardware_fault_on_start() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    sim.inject_fault_on_start(true);
    kosmos.scenario().keystroke("A", Duration::from_millis(1))?;
    let result = kosmos.play();
    assert_eq!(sequencer_kind(result), Some(SequencerErrorKind::HardwareFault));
    assert_eq!(sim.state(), SequencerState::Error);
    Ok(())
}

#[test]
fn test_overrun_fails_end_of_sequence() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    sim.inject_overrun("KBD_MATRIX", true)?;
    kosmos.scenario().keystroke("A", Duration::from_millis(1))?;
    let result = kosmos.play();
    assert_eq!(sequencer_kind(result), Some(SequencerErrorKind::EndOfSequence));
    assert_eq!(kosmos.tree().kbd()?.base().len(), 2);
    Ok(())
}

#[test]
fn test_overrun_injection_needs_a_known_module() -> TestResult {
    let (sim, _kosmos) = keyboard()?;
    assert!(matches!(
        sim.inject_overrun("NOPE", true),
        Err(KosmosError::Domain(DomainError::MissingModule(_)))
    ));
    Ok(())
}

#[test]
fn test_global_error_line_aborts_run() -> TestResult {
    let config = config(vec![ModuleConfig::kbd_matrix()])?;
    let sim = Arc::new(SimulatedFpga::new(&config)?);
    let mut kosmos = Kosmos::new(config, sim.clone())?.with_error_line(sim.error_line());
    sim.raise_error_line_on_start(true);
    kosmos.scenario().keystroke("A", Duration::from_millis(1))?;

    let result = kosmos.play();
    assert!(matches!(
        result,
        Err(KosmosError::FatalHardware(FatalHardwareError::GlobalErrorRaised))
    ));

    // still high: the next play refuses to start
    sim.raise_error_line_on_start(false);
    let result = kosmos.play();
    assert!(matches!(
        result,
        Err(KosmosError::FatalHardware(FatalHardwareError::GlobalErrorAlreadyHigh))
    ));

    sim.error_line().lower();
    kosmos.tree_mut().clear_all();
    kosmos.scenario().keystroke("B", Duration::from_millis(1))?;
    kosmos.play()?;
    Ok(())
}

#[test]
fn test_go_signal_resumes_program() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    sim.set_go_signal_after(Some(1000));
    kosmos.scenario().wait_go_signal()?.timestamp()?;
    kosmos.play()?;
    assert_eq!(kosmos.timer_values(TimerId::Global), vec![1002]);
    Ok(())
}

#[test]
fn test_missing_go_signal_times_out() -> TestResult {
    let (_sim, mut kosmos) = keyboard()?;
    kosmos.scenario().wait_go_signal()?;
    let result = kosmos.play_with(&PlayOptions::with_timeout(Duration::from_millis(50)));
    assert!(matches!(
        sequencer_kind(result),
        Some(SequencerErrorKind::Timeout { timeout_ms: 50 })
    ));
    Ok(())
}

#[test]
fn test_stopwatch_measures_delay() -> TestResult {
    let (_sim, mut kosmos) = keyboard()?;
    kosmos
        .scenario()
        .mark(TimerOp::Start, &[TimerId::Stopwatch1])?
        .delay(Duration::from_micros(1))?
        .mark(TimerOp::Stop, &[TimerId::Stopwatch1])?
        .mark(TimerOp::Save, &[TimerId::Stopwatch1])?;
    kosmos.play()?;
    // 100 delay ticks plus the stop marker
    assert_eq!(kosmos.timer_values(TimerId::Stopwatch1), vec![101]);
    Ok(())
}

#[test]
fn test_timer_capabilities_are_checked() -> TestResult {
    let (_sim, mut kosmos) = keyboard()?;
    let result = kosmos
        .scenario()
        .mark(TimerOp::Reset, &[TimerId::Global])
        .map(|_| ());
    assert!(matches!(
        result,
        Err(KosmosError::Domain(DomainError::UnsupportedAction { .. }))
    ));
    Ok(())
}

#[test]
fn test_led_capture_download() -> TestResult {
    let (sim, mut kosmos) = instrument(config(vec![ModuleConfig::led_spy()])?)?;
    let script = [
        LedSpyEntry {
            counter: 1000,
            channel: 3,
            inactive: false,
        },
        LedSpyEntry {
            counter: 500,
            channel: 3,
            inactive: true,
        },
    ]
    .iter()
    .map(LedSpyEntry::encode)
    .collect::<Result<Vec<_>, _>>()?;
    sim.script_capture("LED_SPY", script)?;

    kosmos
        .scenario()
        .capture_start("LED_SPY")?
        .delay(Duration::from_millis(1))?
        .capture_stop("LED_SPY")?;
    kosmos.play()?;

    assert_eq!(
        kosmos.led_events("LED_SPY")?,
        vec![
            (
                1000,
                LedEvent {
                    channel: 3,
                    active: true
                }
            ),
            (
                1500,
                LedEvent {
                    channel: 3,
                    active: false
                }
            ),
        ]
    );
    Ok(())
}

#[test]
fn test_i2c_capture_frames() -> TestResult {
    let (sim, mut kosmos) = instrument(config(vec![ModuleConfig::i2c_spy()])?)?;
    let entry = |kind, data, delta| I2cSpyEntry { data, kind, delta }.encode();
    let script = vec![
        entry(I2cEventKind::Start, 0, 10)?,
        entry(I2cEventKind::ByteAck, 0xA0, 90)?,
        entry(I2cEventKind::ByteAck, 0x12, 90)?,
        entry(I2cEventKind::ByteNack, 0x34, 90)?,
        entry(I2cEventKind::Stop, 0, 10)?,
    ];
    sim.script_capture("I2C_SPY", script)?;

    kosmos
        .scenario()
        .capture_start("I2C_SPY")?
        .delay(Duration::from_millis(1))?
        .capture_stop("I2C_SPY")?;
    kosmos.play()?;

    let frames = kosmos.i2c_frames("I2C_SPY")?;
    let [frame] = frames.as_slice() else {
        return Err(format!("expected one frame, got {frames:?}").into());
    };
    assert_eq!(frame.timestamp, 10);
    assert_eq!(frame.address, 0x50);
    assert!(!frame.read);
    assert_eq!(frame.data, vec![0x12, 0x34]);
    assert!(!frame.acked);
    Ok(())
}

#[test]
fn test_led_timestamps_restart_each_repetition() -> TestResult {
    let (sim, mut kosmos) = instrument(config(vec![ModuleConfig::led_spy()])?)?;
    let script = [
        LedSpyEntry {
            counter: 200,
            channel: 5,
            inactive: false,
        },
        LedSpyEntry {
            counter: 300,
            channel: 5,
            inactive: true,
        },
    ]
    .iter()
    .map(LedSpyEntry::encode)
    .collect::<Result<Vec<_>, _>>()?;
    sim.script_capture("LED_SPY", script)?;

    kosmos
        .scenario()
        .capture_start("LED_SPY")?
        .delay(Duration::from_millis(1))?
        .capture_stop("LED_SPY")?;
    kosmos.play_with(&PlayOptions::with_timeout(Duration::from_secs(5)).repetitions(1))?;

    let run = vec![
        (
            200,
            LedEvent {
                channel: 5,
                active: true,
            },
        ),
        (
            500,
            LedEvent {
                channel: 5,
                active: false,
            },
        ),
    ];
    assert_eq!(kosmos.led_events_by_run("LED_SPY")?, vec![run.clone(), run]);
    assert_eq!(kosmos.led_events("LED_SPY")?.len(), 4);
    Ok(())
}

#[test]
fn test_program_order_is_checked_before_upload() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    let send = kosmos.tree().kbd()?.send_action();
    kosmos.scenario().execute(send)?;
    let result = kosmos.play();
    assert!(matches!(
        result,
        Err(KosmosError::Domain(DomainError::ProgramOrder { .. }))
    ));
    assert_eq!(
        sim.command_count(kosmos_protocol::msg_id::SEQUENCER, kosmos_protocol::cmd::RESET),
        0
    );
    Ok(())
}

#[test]
fn test_non_blocking_play_then_wait() -> TestResult {
    let (sim, mut kosmos) = keyboard()?;
    kosmos.scenario().keystroke("Z", Duration::from_millis(5))?;
    kosmos.play_with(&PlayOptions::default().block(false))?;
    kosmos.wait_end_of_sequence(Duration::from_secs(1))?;
    assert_eq!(sim.keyboard_reports().len(), 2);
    Ok(())
}
