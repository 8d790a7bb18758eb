//! Property-based tests for end-to-end invariants on the simulated instrument.

use std::sync::Arc;
use std::time::Duration;

use kosmos_core::config::OptEmuConfig;
use kosmos_core::sequencer::module_statuses;
use kosmos_core::{
    HardwareModule, Kosmos, KosmosConfig, KosmosResult, ModuleConfig, SimulatedFpga,
};
use kosmos_protocol::capture::LedSpyEntry;
use kosmos_protocol::{SequencerState, cmd, msg_id};
use proptest::prelude::*;

const KEYS: [&str; 6] = ["A", "B", "C", "7", "ENTER", "LEFT_SHIFT"];

#[derive(Debug, Clone)]
enum Step {
    Keystroke(&'static str, u64),
    Press(&'static str),
    Release(&'static str),
    Chord(Vec<&'static str>),
    DelayMicros(u64),
    ReleaseAll,
}

fn key() -> impl Strategy<Value = &'static str> {
    prop::sample::select(KEYS.to_vec())
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (key(), 1u64..20).prop_map(|(k, ms)| Step::Keystroke(k, ms)),
        key().prop_map(Step::Press),
        key().prop_map(Step::Release),
        prop::sample::subsequence(KEYS.to_vec(), 1..4).prop_map(Step::Chord),
        (1u64..500).prop_map(Step::DelayMicros),
        Just(Step::ReleaseAll),
    ]
}

fn build(config: KosmosConfig) -> KosmosResult<(Arc<SimulatedFpga>, Kosmos)> {
    let sim = Arc::new(SimulatedFpga::new(&config)?);
    let kosmos = Kosmos::new(config, sim.clone())?;
    Ok((sim, kosmos))
}

fn with_modules(modules: Vec<ModuleConfig>) -> KosmosResult<(Arc<SimulatedFpga>, Kosmos)> {
    let mut builder = KosmosConfig::builder().poll_interval_ms(1);
    for module in modules {
        builder = builder.module(module);
    }
    build(builder.build()?)
}

fn keyboard() -> KosmosResult<(Arc<SimulatedFpga>, Kosmos)> {
    with_modules(vec![ModuleConfig::kbd_matrix()])
}

fn apply(kosmos: &mut Kosmos, steps: &[Step]) -> KosmosResult<()> {
    let mut scenario = kosmos.scenario();
    for step in steps {
        match step {
            Step::Keystroke(key, ms) => {
                scenario.keystroke(key, Duration::from_millis(*ms))?;
            }
            Step::Press(key) => {
                scenario.key_press(key)?;
            }
            Step::Release(key) => {
                scenario.key_release(key)?;
            }
            Step::Chord(keys) => {
                scenario.multiple_keys_press(keys)?;
            }
            Step::DelayMicros(us) => {
                scenario.delay(Duration::from_micros(*us))?;
            }
            Step::ReleaseAll => {
                scenario.release_all()?;
            }
        }
    }
    Ok(())
}

fn reports(sim: &SimulatedFpga) -> Vec<(u64, u8, Vec<String>)> {
    sim.keyboard_reports()
        .into_iter()
        .map(|r| (r.tick, r.modifiers, r.keys))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_modules_clean_after_play(steps in prop::collection::vec(step(), 1..8)) {
        let (_sim, mut kosmos) = keyboard()?;
        apply(&mut kosmos, &steps)?;
        kosmos.scenario().wait_kbd()?;
        kosmos.play()?;

        let status = kosmos.status()?;
        for (name, module) in module_statuses(kosmos.tree().message_table(), &status) {
            prop_assert_eq!(module.fifo_count(), 0, "{}", name);
            prop_assert_eq!(module.buffer_count(), 0, "{}", name);
            prop_assert!(!module.overrun(), "{}", name);
        }
        prop_assert_eq!(status.state, SequencerState::Idle);
    }

    #[test]
    fn test_offline_fragments_match_single_upload(
        steps in prop::collection::vec(step(), 1..8),
        split in 0usize..8,
    ) {
        let split = split.min(steps.len());
        let (head, tail) = steps.split_at(split);

        let (direct_sim, mut direct) = keyboard()?;
        apply(&mut direct, &steps)?;
        direct.scenario().wait_kbd()?;
        direct.play()?;

        let (offline_sim, mut offline) = keyboard()?;
        offline.set_offline_mode(true);
        apply(&mut offline, head)?;
        offline.play()?;
        apply(&mut offline, tail)?;
        offline.scenario().wait_kbd()?;
        offline.set_offline_mode(false);
        offline.play()?;

        prop_assert_eq!(reports(&direct_sim), reports(&offline_sim));
    }

    #[test]
    fn test_redundant_key_state_is_suppressed(
        key in key(),
        prior in any::<bool>(),
        state in any::<bool>(),
    ) {
        let (_sim, mut kosmos) = keyboard()?;
        let kbd = kosmos.tree_mut().kbd_mut()?;
        kbd.update(key, prior)?;
        let before = kbd.base().len();

        let first = kbd.update(key, state)?;
        let second = kbd.update(key, state)?;

        prop_assert_eq!(first, prior != state);
        prop_assert!(!second);
        prop_assert_eq!(
            kbd.base().len().saturating_sub(before),
            usize::from(prior != state)
        );
    }

    #[test]
    fn test_raw_and_compressed_motion_match(
        motions in prop::collection::vec((-4i16..=3, -4i16..=3, any::<bool>()), 1..6),
    ) {
        let mut outputs = Vec::new();
        for compression in [true, false] {
            let emulator = ModuleConfig::OptEmu(OptEmuConfig {
                compression,
                ..OptEmuConfig::default()
            });
            let (sim, mut kosmos) = with_modules(vec![emulator])?;
            {
                let mut scenario = kosmos.scenario();
                for (dx, dy, lift) in &motions {
                    scenario.sensor_motion(0, *dx, *dy, *lift)?;
                }
            }
            kosmos.play()?;
            outputs.push((sim.mouse_reports(), sim.spi_trace()));
        }
        prop_assert_eq!(outputs.first(), outputs.last());
    }

    #[test]
    fn test_replay_is_deterministic(steps in prop::collection::vec(step(), 1..8)) {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let (sim, mut kosmos) = keyboard()?;
            apply(&mut kosmos, &steps)?;
            kosmos.scenario().wait_kbd()?;
            kosmos.play()?;
            runs.push(reports(&sim));
        }
        prop_assert_eq!(runs.first(), runs.last());
    }

    #[test]
    fn test_capture_replays_identically(
        entries in prop::collection::vec((1u32..100_000, 0u8..16, any::<bool>()), 1..32),
    ) {
        let (sim, mut kosmos) = with_modules(vec![ModuleConfig::led_spy()])?;
        let mut script = Vec::with_capacity(entries.len());
        for (counter, channel, inactive) in entries {
            script.push(LedSpyEntry { counter, channel, inactive }.encode()?);
        }
        sim.script_capture("LED_SPY", script)?;

        let mut captures = Vec::new();
        for _ in 0..2 {
            kosmos
                .scenario()
                .capture_start("LED_SPY")?
                .delay(Duration::from_micros(10))?
                .capture_stop("LED_SPY")?;
            kosmos.play()?;
            captures.push(kosmos.led_events("LED_SPY")?);
        }
        prop_assert_eq!(captures.first(), captures.last());
        prop_assert!(captures.first().is_some_and(|c| !c.is_empty()));
    }

    #[test]
    fn test_reset_is_idempotent(extra in 1usize..5) {
        let (sim, kosmos) = keyboard()?;
        let sequencer = kosmos.sequencer();
        sequencer.reset_sequence(kosmos.tree())?;
        for _ in 0..extra {
            let status = sequencer.reset_sequence(kosmos.tree())?;
            prop_assert_eq!(status.state, SequencerState::ResetDone);
        }
        prop_assert_eq!(sim.command_count(msg_id::SEQUENCER, cmd::RESET), 1);
    }
}
