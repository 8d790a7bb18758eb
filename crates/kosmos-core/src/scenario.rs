//! Scenario API.
//!
//! [`Kosmos`] owns the Device Tree and the Sequencer of one instrument.
//! A [`Scenario`] appends high-level stimuli to the local buffers; each
//! stimulus keeps the PES program and the module buffers in step, so that
//! every PES action has an instruction to consume.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use kosmos_core::{Kosmos, KosmosConfig, SimulatedFpga};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KosmosConfig::reference();
//! let sim = Arc::new(SimulatedFpga::new(&config)?);
//! let mut kosmos = Kosmos::new(config, sim)?;
//! kosmos
//!     .scenario()
//!     .keystroke("A", Duration::from_millis(50))?
//!     .wait_kbd()?;
//! kosmos.play()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use kosmos_errors::{DomainError, KosmosResult};
use kosmos_protocol::{I2cFrame, LedEvent, SequencerStatus, TimerId};
use tracing::{debug, info, warn};

use crate::config::KosmosConfig;
use crate::error_line::ErrorLine;
use crate::module::{
    ButtonAxis, Checkpoint, HardwareModule, KbdMatrix, OptEmu, Pes, TimerOp,
};
use crate::sequencer::{PlayOptions, Sequencer};
use crate::transport::Transport;
use crate::tree::DeviceTree;

/// One instrument: configuration, Device Tree and Sequencer.
#[derive(Debug)]
pub struct Kosmos {
    config: KosmosConfig,
    tree: DeviceTree,
    sequencer: Sequencer,
}

impl Kosmos {
    pub fn new(config: KosmosConfig, transport: Arc<dyn Transport>) -> KosmosResult<Self> {
        let tree = DeviceTree::build(&config, transport)?;
        let sequencer = Sequencer::new(&config.fpga);
        info!(modules = tree.flat().len(), "instrument ready");
        Ok(Self {
            config,
            tree,
            sequencer,
        })
    }

    #[must_use]
    pub fn with_error_line(mut self, line: Arc<dyn ErrorLine>) -> Self {
        self.sequencer = self.sequencer.with_error_line(line);
        self
    }

    pub fn config(&self) -> &KosmosConfig {
        &self.config
    }

    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut DeviceTree {
        &mut self.tree
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Append stimuli to the local buffers.
    pub fn scenario(&mut self) -> Scenario<'_> {
        Scenario {
            tree: &mut self.tree,
        }
    }

    pub fn set_offline_mode(&mut self, offline: bool) {
        self.sequencer.set_offline_mode(offline);
    }

    /// Play the buffered scenario once, with the configured timeout.
    pub fn play(&mut self) -> KosmosResult<()> {
        let options = self.sequencer.default_options();
        self.play_with(&options)
    }

    pub fn play_with(&mut self, options: &PlayOptions) -> KosmosResult<()> {
        self.sequencer.play_sequence(&mut self.tree, options)
    }

    /// Wait for a sequence started with `block: false`.
    pub fn wait_end_of_sequence(&mut self, timeout: Duration) -> KosmosResult<()> {
        self.sequencer.wait_end_of_sequence(&mut self.tree, timeout)
    }

    pub fn status(&self) -> KosmosResult<SequencerStatus> {
        self.sequencer.status(&self.tree)
    }

    /// Values saved by `timer` during the last play, in ticks.
    pub fn timer_values(&self, timer: TimerId) -> Vec<u64> {
        self.tree.timers().values(timer)
    }

    pub fn led_events(&self, name: &str) -> KosmosResult<Vec<(u64, LedEvent)>> {
        Ok(self.tree.led_spy(name)?.read_events())
    }

    /// LED edges of the last play, one list per run.
    pub fn led_events_by_run(&self, name: &str) -> KosmosResult<Vec<Vec<(u64, LedEvent)>>> {
        Ok(self.tree.led_spy(name)?.read_events_by_run())
    }

    pub fn i2c_frames(&self, name: &str) -> KosmosResult<Vec<I2cFrame>> {
        self.tree.i2c_spy(name)?.read_frames()
    }
}

/// Apply `stimulus` to the PES and one module, restoring both when it fails.
fn all_or_nothing<M, T>(
    pes: &mut Pes,
    module: &mut M,
    stimulus: impl FnOnce(&mut Pes, &mut M) -> KosmosResult<T>,
) -> KosmosResult<T>
where
    M: Checkpoint + HardwareModule,
{
    let pes_saved = pes.checkpoint();
    let module_saved = module.checkpoint();
    match stimulus(pes, module) {
        Ok(value) => Ok(value),
        Err(e) => {
            pes.restore(pes_saved);
            module.restore(module_saved);
            warn!(module = %module.name(), error = %e, "stimulus rolled back");
            Err(e)
        }
    }
}

/// Builder of stimuli over the local buffers of a [`DeviceTree`].
///
/// Every method returns `&mut Self` so that calls chain with `?`.
#[derive(Debug)]
pub struct Scenario<'a> {
    tree: &'a mut DeviceTree,
}

impl<'a> Scenario<'a> {
    pub fn new(tree: &'a mut DeviceTree) -> Self {
        Self { tree }
    }

    /// Run a keyboard stimulus; on failure neither buffer nor the key
    /// cache keep any part of it.
    fn with_kbd<T>(
        &mut self,
        stimulus: impl FnOnce(&mut Pes, &mut KbdMatrix) -> KosmosResult<T>,
    ) -> KosmosResult<T> {
        let (pes, kbd) = self.tree.pes_and_kbd_mut()?;
        all_or_nothing(pes, kbd, stimulus)
    }

    fn with_opt_emu<T>(
        &mut self,
        index: usize,
        stimulus: impl FnOnce(&mut Pes, &mut OptEmu) -> KosmosResult<T>,
    ) -> KosmosResult<T> {
        let (pes, emu) = self.tree.pes_and_opt_emu_mut(index)?;
        all_or_nothing(pes, emu, stimulus)
    }

    fn with_button_axis<T>(
        &mut self,
        index: usize,
        stimulus: impl FnOnce(&mut Pes, &mut ButtonAxis) -> KosmosResult<T>,
    ) -> KosmosResult<T> {
        let (pes, bas) = self.tree.pes_and_button_axis_mut(index)?;
        all_or_nothing(pes, bas, stimulus)
    }

    /// Press `key` now.
    pub fn key_press(&mut self, key: &str) -> KosmosResult<&mut Self> {
        self.with_kbd(|pes, kbd| {
            if kbd.press(key)? {
                pes.execute(kbd.send_action())?;
            }
            Ok(())
        })?;
        Ok(self)
    }

    pub fn key_release(&mut self, key: &str) -> KosmosResult<&mut Self> {
        self.with_kbd(|pes, kbd| {
            if kbd.release(key)? {
                pes.execute(kbd.send_action())?;
            }
            Ok(())
        })?;
        Ok(self)
    }

    /// Press `key`, hold it for `duration`, release it.
    pub fn keystroke(&mut self, key: &str, duration: Duration) -> KosmosResult<&mut Self> {
        self.with_kbd(|pes, kbd| {
            let send = kbd.send_action();
            if kbd.press(key)? {
                pes.execute(send)?;
            }
            let released = kbd.release(key)?;
            pes.delay(duration, if released { send } else { 0 })
        })?;
        Ok(self)
    }

    fn update_keys(&mut self, keys: &[&str], pressed: bool) -> KosmosResult<&mut Self> {
        if keys.is_empty() {
            return Err(DomainError::invalid_argument("no key given").into());
        }
        self.with_kbd(|pes, kbd| {
            let mut changed = 0usize;
            for key in keys {
                if kbd.update(key, pressed)? {
                    changed = changed.saturating_add(1);
                    pes.refill_delay(0)?;
                }
            }
            if changed == 0 {
                debug!(?keys, pressed, "every key already in state");
                return Ok(());
            }
            kbd.send()?;
            pes.execute(kbd.send_action())
        })?;
        Ok(self)
    }

    /// Press every key of `keys` with a single latch.
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] for an empty list or an unknown key.
    pub fn multiple_keys_press(&mut self, keys: &[&str]) -> KosmosResult<&mut Self> {
        self.update_keys(keys, true)
    }

    pub fn multiple_keys_release(&mut self, keys: &[&str]) -> KosmosResult<&mut Self> {
        self.update_keys(keys, false)
    }

    /// Release every key.
    pub fn release_all(&mut self) -> KosmosResult<&mut Self> {
        self.with_kbd(|pes, kbd| {
            kbd.reset_all()?;
            pes.execute(kbd.send_action())
        })?;
        Ok(self)
    }

    /// Stage a key state without latching it.
    pub fn kbd_update(&mut self, key: &str, pressed: bool) -> KosmosResult<&mut Self> {
        self.tree.kbd_mut()?.update(key, pressed)?;
        Ok(self)
    }

    /// Latch the staged key states.
    pub fn kbd_send(&mut self) -> KosmosResult<&mut Self> {
        self.with_kbd(|pes, kbd| {
            kbd.send()?;
            pes.execute(kbd.send_action())
        })?;
        Ok(self)
    }

    fn set_button(&mut self, index: usize, button: u8, pressed: bool) -> KosmosResult<&mut Self> {
        self.with_button_axis(index, |pes, bas| {
            if bas.set_button(button, pressed, true)? {
                pes.execute(bas.fire_action())?;
            }
            Ok(())
        })?;
        Ok(self)
    }

    /// Press `button` of button/axis stimulus `index` now.
    pub fn button_press(&mut self, index: usize, button: u8) -> KosmosResult<&mut Self> {
        self.set_button(index, button, true)
    }

    pub fn button_release(&mut self, index: usize, button: u8) -> KosmosResult<&mut Self> {
        self.set_button(index, button, false)
    }

    /// Press `button`, hold it for `duration`, release it.
    pub fn button_click(
        &mut self,
        index: usize,
        button: u8,
        duration: Duration,
    ) -> KosmosResult<&mut Self> {
        self.with_button_axis(index, |pes, bas| {
            let fire = bas.fire_action();
            if bas.press(button)? {
                pes.execute(fire)?;
            }
            let released = bas.release(button)?;
            pes.delay(duration, if released { fire } else { 0 })
        })?;
        Ok(self)
    }

    /// Move `axis` of button/axis stimulus `index` to `level`.
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] for an unknown axis or a level out of the
    /// DAC range.
    pub fn axis_move(&mut self, index: usize, axis: u8, level: u16) -> KosmosResult<&mut Self> {
        self.with_button_axis(index, |pes, bas| {
            if bas.set_axis(axis, level, true)? {
                pes.execute(bas.fire_action())?;
            }
            Ok(())
        })?;
        Ok(self)
    }

    /// Every button released and every axis at rest.
    pub fn button_axis_rest(&mut self, index: usize) -> KosmosResult<&mut Self> {
        self.with_button_axis(index, |pes, bas| {
            bas.reset_all()?;
            pes.execute(bas.fire_action())
        })?;
        Ok(self)
    }

    pub fn delay(&mut self, duration: Duration) -> KosmosResult<&mut Self> {
        self.tree.pes_mut().delay(duration, 0)?;
        Ok(self)
    }

    /// Raise raw PES actions.
    pub fn execute(&mut self, actions: u16) -> KosmosResult<&mut Self> {
        self.tree.pes_mut().execute(actions)?;
        Ok(self)
    }

    pub fn wait_kbd(&mut self) -> KosmosResult<&mut Self> {
        self.tree.pes_mut().wait_kbd()?;
        Ok(self)
    }

    /// Suspend until the host asserts the GO signal.
    pub fn wait_go_signal(&mut self) -> KosmosResult<&mut Self> {
        self.tree.pes_mut().wait_go_signal()?;
        Ok(self)
    }

    /// Move optical sensor `index` by (`dx`, `dy`) in one frame.
    pub fn sensor_motion(
        &mut self,
        index: usize,
        dx: i16,
        dy: i16,
        lift: bool,
    ) -> KosmosResult<&mut Self> {
        self.sensor_frames(index, dx, dy, lift, 0, 0)
    }

    /// `skip` idle frames, then `1 + repeat` frames moving by (`dx`, `dy`).
    pub fn sensor_frames(
        &mut self,
        index: usize,
        dx: i16,
        dy: i16,
        lift: bool,
        skip: u16,
        repeat: u16,
    ) -> KosmosResult<&mut Self> {
        self.with_opt_emu(index, |pes, emu| {
            emu.motion(dx, dy, lift)?;
            emu.skip(skip);
            emu.repeat(repeat);
            emu.commit()?;
            pes.execute(emu.send_action())
        })?;
        Ok(self)
    }

    pub fn sensor_lift(&mut self, index: usize, lifted: bool) -> KosmosResult<&mut Self> {
        self.with_opt_emu(index, |pes, emu| {
            emu.lift(lifted);
            emu.commit()?;
            pes.execute(emu.send_action())
        })?;
        Ok(self)
    }

    pub fn capture_start(&mut self, spy: &str) -> KosmosResult<&mut Self> {
        let (start, _) = self.tree.capture_actions(spy)?;
        self.tree.pes_mut().execute(start)?;
        Ok(self)
    }

    pub fn capture_stop(&mut self, spy: &str) -> KosmosResult<&mut Self> {
        let (_, stop) = self.tree.capture_actions(spy)?;
        self.tree.pes_mut().execute(stop)?;
        Ok(self)
    }

    /// Apply `op` to `timers` at this point of the program.
    pub fn mark(&mut self, op: TimerOp, timers: &[TimerId]) -> KosmosResult<&mut Self> {
        self.tree.pes_mut().timers(op, timers)?;
        Ok(self)
    }

    /// Save the global timestamp.
    pub fn timestamp(&mut self) -> KosmosResult<&mut Self> {
        self.mark(TimerOp::Save, &[TimerId::Global])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::sim::SimulatedFpga;
    use kosmos_errors::BufferError;
    use kosmos_protocol::opt_cmd;
    use kosmos_errors::KosmosError;
    use kosmos_protocol::PesInstruction;

    fn kosmos() -> Result<Kosmos, Box<dyn std::error::Error>> {
        let config = KosmosConfig::reference();
        let sim = Arc::new(SimulatedFpga::new(&config)?);
        Ok(Kosmos::new(config, sim)?)
    }

    #[test]
    fn test_keystroke_program() -> Result<(), Box<dyn std::error::Error>> {
        let mut kosmos = kosmos()?;
        kosmos
            .scenario()
            .keystroke("A", Duration::from_millis(50))?;
        let send = kosmos.tree().kbd()?.send_action();
        let program = kosmos.tree().pes().instructions();
        assert_eq!(program.first(), Some(&PesInstruction::Execute { actions: send }));
        assert_eq!(kosmos.tree().pes().count_actions(send), 2);
        assert_eq!(kosmos.tree().kbd()?.base().len(), 2);
        Ok(())
    }

    #[test]
    fn test_redundant_press_adds_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let mut kosmos = kosmos()?;
        kosmos.scenario().key_press("B")?.key_press("B")?;
        assert_eq!(kosmos.tree().pes().base().len(), 1);
        assert_eq!(kosmos.tree().kbd()?.base().len(), 1);
        Ok(())
    }

    #[test]
    fn test_multiple_keys_rejects_empty_list() -> Result<(), Box<dyn std::error::Error>> {
        let mut kosmos = kosmos()?;
        let result = kosmos.scenario().multiple_keys_press(&[]).map(|_| ());
        assert!(matches!(
            result,
            Err(KosmosError::Domain(DomainError::InvalidArgument(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_spy() -> Result<(), Box<dyn std::error::Error>> {
        let mut kosmos = kosmos()?;
        let result = kosmos.scenario().capture_start("NOPE").map(|_| ());
        assert!(matches!(
            result,
            Err(KosmosError::Domain(DomainError::MissingModule(_)))
        ));
        Ok(())
    }

    fn kosmos_with(config: KosmosConfig) -> Result<Kosmos, Box<dyn std::error::Error>> {
        let sim = Arc::new(SimulatedFpga::new(&config)?);
        Ok(Kosmos::new(config, sim)?)
    }

    #[test]
    fn test_failed_key_press_leaves_no_trace() -> Result<(), Box<dyn std::error::Error>> {
        let config = KosmosConfig::builder()
            .pes_buffer_size(3)
            .module(ModuleConfig::kbd_matrix())
            .build()?;
        let mut kosmos = kosmos_with(config)?;
        kosmos
            .scenario()
            .delay(Duration::from_micros(1))?
            .delay(Duration::from_micros(1))?;

        let result = kosmos.scenario().key_press("A").map(|_| ());
        assert!(matches!(
            result,
            Err(KosmosError::Buffer(BufferError::Overflow { capacity: 3, requested: 3, .. }))
        ));
        assert_eq!(kosmos.tree().pes().base().len(), 2);
        assert!(kosmos.tree().kbd()?.base().is_empty());
        assert!(kosmos.tree().kbd()?.pressed_keys().is_empty());

        kosmos.tree_mut().pes_mut().clear();
        kosmos.scenario().key_press("A")?;
        assert_eq!(kosmos.tree().kbd()?.pressed_keys(), vec!["A"]);
        assert_eq!(kosmos.tree().kbd()?.base().len(), 1);
        assert_eq!(kosmos.tree().pes().base().len(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_keystroke_keeps_earlier_stimuli() -> Result<(), Box<dyn std::error::Error>> {
        let config = KosmosConfig::builder()
            .pes_buffer_size(4)
            .module(ModuleConfig::kbd_matrix())
            .build()?;
        let mut kosmos = kosmos_with(config)?;
        kosmos.scenario().key_press("B")?;

        // Press fits, the release delay does not.
        let result = kosmos
            .scenario()
            .keystroke("A", Duration::from_nanos(1_270))
            .map(|_| ());
        assert!(matches!(result, Err(KosmosError::Buffer(_))));
        assert_eq!(kosmos.tree().kbd()?.pressed_keys(), vec!["B"]);
        assert_eq!(kosmos.tree().kbd()?.base().len(), 1);
        assert_eq!(kosmos.tree().pes().base().len(), 1);
        Ok(())
    }

    #[test]
    fn test_button_click_program() -> Result<(), Box<dyn std::error::Error>> {
        let config = KosmosConfig::builder()
            .module(ModuleConfig::button_axis())
            .build()?;
        let mut kosmos = kosmos_with(config)?;
        kosmos
            .scenario()
            .button_click(0, 3, Duration::from_millis(5))?
            .axis_move(0, 1, 0x0800)?;
        // The axis already rests at 0x0800.
        let bas = kosmos.tree().button_axis(0)?;
        let fire = bas.fire_action();
        assert_eq!(bas.base().len(), 2);
        assert!(!bas.is_pressed(3)?);
        let program = kosmos.tree().pes().instructions();
        assert_eq!(program.first(), Some(&PesInstruction::Execute { actions: fire }));
        assert_eq!(kosmos.tree().pes().count_actions(fire), 2);
        Ok(())
    }

    #[test]
    fn test_failed_sensor_motion_keeps_registers() -> Result<(), Box<dyn std::error::Error>> {
        let config = KosmosConfig::builder()
            .pes_buffer_size(2)
            .module(ModuleConfig::opt_emu())
            .build()?;
        let mut kosmos = kosmos_with(config)?;
        kosmos.scenario().delay(Duration::from_micros(1))?;

        let result = kosmos.scenario().sensor_motion(0, 3, -2, false).map(|_| ());
        assert!(matches!(result, Err(KosmosError::Buffer(_))));
        let emu = kosmos.tree().opt_emu(0)?;
        assert!(emu.base().is_empty());
        assert_eq!(emu.register(opt_cmd::DX), 0);
        assert_eq!(emu.register(opt_cmd::DY), 0);
        Ok(())
    }
}
