//! Button and axis stimulus.
//!
//! The FPGA drives DUT buttons and analog axes (triggers, sticks) from a
//! channel RAM: button channels first, axis channels after them.
//! [`ButtonAxis`] mirrors that RAM in a cache which starts, like the
//! hardware, at the rest levels (buttons released, axes at the configured
//! rest level), and only emits an instruction when a level changes. A
//! `FIRE` action latches the pending levels.

use kosmos_errors::{DomainError, KosmosResult};
use kosmos_protocol::bas::{BAS_BUTTON_PRESSED, BAS_LEVEL_MAX};
use kosmos_protocol::{BasCommand, BasInstruction};
use tracing::debug;

use super::{Checkpoint, HardwareModule, ModuleBase, ModuleSettings};
use crate::config::ButtonAxisConfig;

#[derive(Debug)]
pub struct ButtonAxis {
    base: ModuleBase,
    buttons: u8,
    axes: u8,
    axis_rest: u16,
    fire_action: u16,
    levels: Vec<u16>,
}

impl ButtonAxis {
    pub fn new(settings: ModuleSettings, config: &ButtonAxisConfig, fire_action: u16) -> Self {
        let mut module = Self {
            base: ModuleBase::new(settings),
            buttons: config.buttons,
            axes: config.axes,
            axis_rest: config.axis_rest,
            fire_action,
            levels: Vec::new(),
        };
        module.rest();
        module
    }

    fn rest(&mut self) {
        self.levels = std::iter::repeat_n(0, usize::from(self.buttons))
            .chain(std::iter::repeat_n(self.axis_rest, usize::from(self.axes)))
            .collect();
    }

    pub fn buttons(&self) -> u8 {
        self.buttons
    }

    pub fn axes(&self) -> u8 {
        self.axes
    }

    pub fn axis_rest(&self) -> u16 {
        self.axis_rest
    }

    /// PES action that latches the next instruction(s).
    pub fn fire_action(&self) -> u16 {
        self.fire_action
    }

    fn button_channel(&self, button: u8) -> Result<u8, DomainError> {
        if button >= self.buttons {
            return Err(DomainError::out_of_range(
                "button",
                button,
                0,
                i64::from(self.buttons).saturating_sub(1),
            ));
        }
        Ok(button)
    }

    fn axis_channel(&self, axis: u8) -> Result<u8, DomainError> {
        let out_of_range =
            || DomainError::out_of_range("axis", axis, 0, i64::from(self.axes).saturating_sub(1));
        if axis >= self.axes {
            return Err(out_of_range());
        }
        self.buttons.checked_add(axis).ok_or_else(out_of_range)
    }

    /// Set `channel` to `level` with `command` (`UPDATE` or `UPDATE_SEND`).
    ///
    /// Returns `false` when the channel already holds that level: nothing
    /// is appended.
    fn set_level(&mut self, channel: u8, level: u16, command: BasCommand) -> KosmosResult<bool> {
        if !matches!(command, BasCommand::Update | BasCommand::UpdateSend) {
            return Err(DomainError::unsupported_action(
                self.base.name(),
                format!("{command:?} as a level update"),
            )
            .into());
        }
        let Some(current) = self.levels.get_mut(usize::from(channel)) else {
            return Err(DomainError::out_of_range(
                "channel",
                channel,
                0,
                i64::try_from(self.levels.len())
                    .unwrap_or(i64::MAX)
                    .saturating_sub(1),
            )
            .into());
        };
        if *current == level {
            debug!(module = %self.base.name(), channel, level, "redundant level update suppressed");
            return Ok(false);
        }
        self.base
            .append(BasInstruction::new(command, channel, level).encode())?;
        *current = level;
        Ok(true)
    }

    fn command(latch: bool) -> BasCommand {
        if latch {
            BasCommand::UpdateSend
        } else {
            BasCommand::Update
        }
    }

    /// Press or release `button`; `latch` selects `UPDATE_SEND` over `UPDATE`.
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] for a button the module does not have.
    pub fn set_button(&mut self, button: u8, pressed: bool, latch: bool) -> KosmosResult<bool> {
        let channel = self.button_channel(button)?;
        let level = if pressed { BAS_BUTTON_PRESSED } else { 0 };
        self.set_level(channel, level, Self::command(latch))
    }

    pub fn press(&mut self, button: u8) -> KosmosResult<bool> {
        self.set_button(button, true, true)
    }

    pub fn release(&mut self, button: u8) -> KosmosResult<bool> {
        self.set_button(button, false, true)
    }

    /// Move `axis` to `level`.
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] for an unknown axis or a level above
    /// [`BAS_LEVEL_MAX`].
    pub fn set_axis(&mut self, axis: u8, level: u16, latch: bool) -> KosmosResult<bool> {
        let channel = self.axis_channel(axis)?;
        DomainError::check_range("level", i64::from(level), 0, i64::from(BAS_LEVEL_MAX))?;
        self.set_level(channel, level, Self::command(latch))
    }

    /// Latch every pending update.
    pub fn send(&mut self) -> KosmosResult<()> {
        self.base.append(BasInstruction::send().encode())
    }

    /// Every channel back to rest, latched.
    pub fn reset_all(&mut self) -> KosmosResult<()> {
        self.base.append(BasInstruction::reset().encode())?;
        self.rest();
        Ok(())
    }

    pub fn is_pressed(&self, button: u8) -> KosmosResult<bool> {
        let channel = self.button_channel(button)?;
        Ok(self.levels.get(usize::from(channel)).is_some_and(|l| *l != 0))
    }

    pub fn axis(&self, axis: u8) -> KosmosResult<u16> {
        let channel = self.axis_channel(axis)?;
        Ok(self
            .levels
            .get(usize::from(channel))
            .copied()
            .unwrap_or(self.axis_rest))
    }

    pub fn disassemble(&self) -> String {
        self.base
            .words()
            .iter()
            .enumerate()
            .map(|(i, w)| match BasInstruction::decode(*w) {
                Ok(instruction) => format!("{i:04}: {instruction}"),
                Err(e) => format!("{i:04}: {e}"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl HardwareModule for ButtonAxis {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn on_reset(&mut self) {
        self.rest();
    }

    /// Buffered instructions that latch.
    fn commits(&self) -> usize {
        self.base
            .words()
            .iter()
            .filter_map(|w| BasInstruction::decode(*w).ok())
            .filter(|i| i.command.latches())
            .count()
    }
}

impl Checkpoint for ButtonAxis {
    type Saved = (usize, Vec<u16>);

    fn checkpoint(&self) -> Self::Saved {
        (self.base.len(), self.levels.clone())
    }

    fn restore(&mut self, (len, levels): Self::Saved) {
        self.base.truncate(len);
        self.levels = levels;
    }
}
