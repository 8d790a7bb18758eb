//! Demo scenarios played on the simulated instrument

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kosmos_core::sequencer::PlayOptions;
use kosmos_core::{Kosmos, KosmosConfig, ModuleConfig, SimulatedFpga};
use kosmos_errors::KosmosError;
use kosmos_protocol::capture::LedSpyEntry;
use tracing::info;

use super::{DemoCommands, first_module, load_config};
use crate::error::CliError;
use crate::output;

/// LED pattern replayed by the simulated spy: (ticks since previous
/// event on the channel, channel, inactive).
const LED_SCRIPT: [(u32, u8, bool); 6] = [
    (1000, 0, false),
    (250, 3, false),
    (500, 0, true),
    (1000, 3, true),
    (2000, 0, false),
    (2000, 0, true),
];

pub fn execute(cmd: &DemoCommands, json: bool, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    match cmd {
        DemoCommands::Keystroke {
            key,
            hold_ms,
            repeat,
            listing,
        } => keystroke(config, key, Duration::from_millis(*hold_ms), *repeat, *listing, json),
        DemoCommands::Sensor {
            dx,
            dy,
            skip,
            frames,
            raw,
        } => sensor(config, (*dx, *dy), *skip, *frames, *raw, json),
        DemoCommands::Leds { window_ms } => leds(config, Duration::from_millis(*window_ms), json),
    }
}

fn instrument(config: KosmosConfig) -> Result<(Arc<SimulatedFpga>, Kosmos), CliError> {
    let sim = Arc::new(SimulatedFpga::new(&config)?);
    let kosmos = Kosmos::new(config, sim.clone())?;
    Ok((sim, kosmos))
}

fn keystroke(
    config: KosmosConfig,
    key: &str,
    hold: Duration,
    repeat: u32,
    listing: bool,
    json: bool,
) -> Result<()> {
    first_module(
        &config,
        |m| matches!(m, ModuleConfig::KbdMatrix(_)),
        "KBD_MATRIX",
    )?;
    let timeout = config.fpga.default_timeout();
    let (sim, mut kosmos) = instrument(config)?;

    kosmos
        .scenario()
        .keystroke(key, hold)
        .and_then(|s| s.wait_kbd())
        .map_err(CliError::from)?;
    if listing && !json {
        print!("{}", kosmos.tree().pes().disassemble());
    }
    info!(key, repeat, "playing keystroke");
    kosmos
        .play_with(&PlayOptions::with_timeout(timeout).repetitions(repeat))
        .map_err(CliError::from)?;

    output::print_keyboard_reports(&sim.keyboard_reports(), json);
    Ok(())
}

fn sensor(
    config: KosmosConfig,
    (dx, dy): (i16, i16),
    skip: u16,
    frames: u16,
    raw: bool,
    json: bool,
) -> Result<()> {
    first_module(&config, |m| matches!(m, ModuleConfig::OptEmu(_)), "OPTEMU")?;
    let (sim, mut kosmos) = instrument(config)?;

    let run = |kosmos: &mut Kosmos| -> Result<(), KosmosError> {
        if raw {
            let (_, emu) = kosmos.tree_mut().pes_and_opt_emu_mut(0)?;
            emu.set_compression(false);
        }
        kosmos
            .scenario()
            .sensor_frames(0, dx, dy, false, skip, frames)?;
        kosmos.play()
    };
    run(&mut kosmos).map_err(CliError::from)?;

    output::print_sensor_output(&sim.mouse_reports(), &sim.spi_trace(), json);
    Ok(())
}

fn leds(config: KosmosConfig, window: Duration, json: bool) -> Result<()> {
    let spy = first_module(&config, |m| matches!(m, ModuleConfig::LedSpy(_)), "LED_SPY")?;
    let (sim, mut kosmos) = instrument(config)?;

    let run = |kosmos: &mut Kosmos| -> Result<_, KosmosError> {
        let mut script = Vec::with_capacity(LED_SCRIPT.len());
        for (counter, channel, inactive) in LED_SCRIPT {
            script.push(
                LedSpyEntry {
                    counter,
                    channel,
                    inactive,
                }
                .encode()?,
            );
        }
        sim.script_capture(&spy.name, script)?;
        kosmos
            .scenario()
            .capture_start(&spy.name)?
            .delay(window)?
            .capture_stop(&spy.name)?;
        kosmos.play()?;
        kosmos.led_events(&spy.name)
    };
    let events = run(&mut kosmos).map_err(CliError::from)?;

    output::print_led_events(&spy.name, &events, json);
    Ok(())
}
