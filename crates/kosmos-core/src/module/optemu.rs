//! Optical sensor emulator.
//!
//! The emulator presents sensor registers to the DUT over SPI. The host
//! stages register values and [`OptEmu::commit`] turns the staged changes
//! into instructions: raw register writes, or one compressed entry when at
//! least two compressible registers changed and the values fit. Both
//! encodings yield the same DUT-visible motion.
//!
//! `DX`, `DY` and `LIFT` hold their value across commits; `SKIP` and
//! `REPEAT` apply to one commit only.

use std::collections::BTreeMap;

use kosmos_errors::{DomainError, KosmosResult, SequencerError, SequencerErrorKind, StatusReport};
use kosmos_protocol::{ModuleStatus, OptEmuInstruction, cmd, opt_cmd};
use tracing::{debug, error};

use super::{Checkpoint, HardwareModule, ModuleBase, ModuleSettings, counters};
use crate::config::OptEmuConfig;
use crate::transport::Transport;

fn is_one_shot(cmd_idx: u8) -> bool {
    matches!(cmd_idx, opt_cmd::SKIP | opt_cmd::REPEAT)
}

#[derive(Debug)]
pub struct OptEmu {
    base: ModuleBase,
    compression: bool,
    delta_min: i16,
    delta_max: i16,
    send_action: u16,
    registers: BTreeMap<u8, u16>,
    staged: BTreeMap<u8, u16>,
}

impl OptEmu {
    pub fn new(settings: ModuleSettings, config: &OptEmuConfig, send_action: u16) -> Self {
        Self {
            base: ModuleBase::new(settings),
            compression: config.compression,
            delta_min: config.delta_min,
            delta_max: config.delta_max,
            send_action,
            registers: BTreeMap::new(),
            staged: BTreeMap::new(),
        }
    }

    pub fn send_action(&self) -> u16 {
        self.send_action
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Override the compression policy.
    pub fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    /// Committed value of `cmd_idx`; one-shot registers always read 0.
    pub fn register(&self, cmd_idx: u8) -> u16 {
        if is_one_shot(cmd_idx) {
            return 0;
        }
        self.registers.get(&cmd_idx).copied().unwrap_or_default()
    }

    fn staged_or_committed(&self, cmd_idx: u8) -> u16 {
        self.staged
            .get(&cmd_idx)
            .copied()
            .unwrap_or_else(|| self.register(cmd_idx))
    }

    /// Stage a free raw command (`cmd_idx >= RAW_BASE`).
    pub fn set_raw(&mut self, cmd_idx: u8, value: u16) -> KosmosResult<()> {
        if cmd_idx < opt_cmd::RAW_BASE {
            return Err(DomainError::out_of_range("cmd_idx", cmd_idx, opt_cmd::RAW_BASE, u8::MAX).into());
        }
        self.staged.insert(cmd_idx, value);
        Ok(())
    }

    /// Stage a displacement and lift state.
    pub fn motion(&mut self, dx: i16, dy: i16, lift: bool) -> KosmosResult<()> {
        let (min, max) = (i64::from(self.delta_min), i64::from(self.delta_max));
        DomainError::check_range("dx", i64::from(dx), min, max)?;
        DomainError::check_range("dy", i64::from(dy), min, max)?;
        self.staged.insert(opt_cmd::DX, dx.cast_unsigned());
        self.staged.insert(opt_cmd::DY, dy.cast_unsigned());
        self.staged.insert(opt_cmd::LIFT, u16::from(lift));
        Ok(())
    }

    pub fn lift(&mut self, lifted: bool) {
        self.staged.insert(opt_cmd::LIFT, u16::from(lifted));
    }

    /// Idle frames before the motion of the next commit.
    pub fn skip(&mut self, frames: u16) {
        self.staged.insert(opt_cmd::SKIP, frames);
    }

    /// Extra motion frames of the next commit.
    pub fn repeat(&mut self, frames: u16) {
        self.staged.insert(opt_cmd::REPEAT, frames);
    }

    fn changed(&self) -> BTreeMap<u8, u16> {
        self.staged
            .iter()
            .filter(|(idx, value)| self.register(**idx) != **value)
            .map(|(idx, value)| (*idx, *value))
            .collect()
    }

    fn compressed_entry(&self, changed: &BTreeMap<u8, u16>) -> Option<OptEmuInstruction> {
        if !self.compression {
            return None;
        }
        let compressible = changed
            .keys()
            .filter(|idx| opt_cmd::COMPRESSIBLE.contains(idx))
            .count();
        if compressible < 2 {
            return None;
        }
        let dx = self.staged_or_committed(opt_cmd::DX).cast_signed();
        let dy = self.staged_or_committed(opt_cmd::DY).cast_signed();
        let lift = self.staged_or_committed(opt_cmd::LIFT) != 0;
        let skip = self.staged_or_committed(opt_cmd::SKIP);
        let repeat = self.staged_or_committed(opt_cmd::REPEAT);
        if !OptEmuInstruction::fits_compressed(dx, dy, skip, repeat) {
            return None;
        }
        OptEmuInstruction::compressed(dx, dy, lift, skip, repeat).ok()
    }

    /// Turn the staged changes into instructions ending with a commit.
    ///
    /// Returns the number of instructions appended.
    pub fn commit(&mut self) -> KosmosResult<usize> {
        let changed = self.changed();
        let (raw_only, compressible): (Vec<_>, Vec<_>) = changed
            .iter()
            .map(|(idx, value)| (*idx, *value))
            .partition(|(idx, _)| *idx >= opt_cmd::RAW_BASE);

        let mut instructions: Vec<OptEmuInstruction> = raw_only
            .iter()
            .map(|(idx, value)| OptEmuInstruction::raw(*idx, *value))
            .collect();
        if let Some(entry) = self.compressed_entry(&changed) {
            instructions.push(entry);
        } else {
            instructions.extend(
                compressible
                    .iter()
                    .map(|(idx, value)| OptEmuInstruction::raw(*idx, *value)),
            );
            match instructions.last_mut() {
                Some(last) => *last = last.with_send(true),
                None => instructions.push(OptEmuInstruction::nop().with_send(true)),
            }
        }

        let words: Vec<u32> = instructions.iter().map(OptEmuInstruction::encode).collect();
        self.base.extend(&words)?;
        for (idx, value) in changed {
            if !is_one_shot(idx) {
                self.registers.insert(idx, value);
            }
        }
        self.staged.clear();
        debug!(module = %self.base.name(), count = words.len(), "optical commit");
        Ok(words.len())
    }

    fn expect_enabled(
        &self,
        step: &str,
        status: &ModuleStatus,
        enabled: bool,
    ) -> KosmosResult<()> {
        let actual = matches!(status, ModuleStatus::Consumer(s) if s.enabled);
        if actual == enabled {
            return Ok(());
        }
        error!(module = %self.base.name(), step, expected = enabled, "emulator enable state mismatch");
        Err(SequencerError::new(
            SequencerErrorKind::InvalidStatus {
                errors: vec![format!(
                    "[{}] {step}: expected enabled={enabled}, got {actual}.",
                    self.base.name()
                )],
            },
            StatusReport::new("N/A").with_modules(vec![counters(self.base.name(), status)]),
        )
        .into())
    }

    /// Enable the emulator outputs.
    pub fn start_emulator(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        let status = self.base.control(transport, cmd::START)?;
        self.expect_enabled("start", &status, true)?;
        Ok(status)
    }

    pub fn stop_emulator(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        let status = self.base.control(transport, cmd::STOP)?;
        self.expect_enabled("stop", &status, false)?;
        Ok(status)
    }

    /// Push the register state to the sensor interface outside of a sequence.
    pub fn force_update(&self, transport: &dyn Transport) -> KosmosResult<ModuleStatus> {
        let status = self.base.control(transport, cmd::UPDATE)?;
        self.expect_enabled("force update", &status, true)?;
        Ok(status)
    }

    pub fn disassemble(&self) -> String {
        self.base
            .words()
            .iter()
            .enumerate()
            .map(|(i, w)| format!("{i:04}: {}", OptEmuInstruction::decode(*w)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl HardwareModule for OptEmu {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn on_reset(&mut self) {
        self.registers.clear();
        self.staged.clear();
    }

    fn commits(&self) -> usize {
        self.base
            .words()
            .iter()
            .filter(|w| OptEmuInstruction::decode(**w).commits())
            .count()
    }
}

impl Checkpoint for OptEmu {
    type Saved = (usize, BTreeMap<u8, u16>, BTreeMap<u8, u16>);

    fn checkpoint(&self) -> Self::Saved {
        (self.base.len(), self.registers.clone(), self.staged.clone())
    }

    fn restore(&mut self, (len, registers, staged): Self::Saved) {
        self.base.truncate(len);
        self.registers = registers;
        self.staged = staged;
    }
}
