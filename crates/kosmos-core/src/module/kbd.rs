//! Keyboard matrix stimulus.
//!
//! The FPGA drives the DUT key matrix from a lane RAM addressed by
//! (bank, addr); each lane word holds one bit per key sharing the address.
//! [`KbdMatrix`] mirrors that RAM in a cache and only emits an instruction
//! when a lane word actually changes.

use std::collections::BTreeMap;

use kosmos_errors::{DomainError, KosmosResult};
use kosmos_protocol::kbd::KBD_LANE_BITS;
use kosmos_protocol::{KbdCommand, KbdInstruction, MatrixCoord, MatrixGeometry};
use tracing::debug;

use super::{Checkpoint, HardwareModule, ModuleBase, ModuleSettings};
use crate::config::KbdMatrixConfig;

/// Modifier keys, in HID modifier bit order.
pub const MODIFIER_KEYS: [&str; 8] = [
    "LEFT_CTRL",
    "LEFT_SHIFT",
    "LEFT_ALT",
    "LEFT_GUI",
    "RIGHT_CTRL",
    "RIGHT_SHIFT",
    "RIGHT_ALT",
    "RIGHT_GUI",
];

const SPECIAL_KEYS: [&str; 5] = ["ENTER", "ESC", "SPACE", "BACKSPACE", "TAB"];

/// Key names and their matrix positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    keys: BTreeMap<String, (u8, u8)>,
    names: BTreeMap<(u8, u8), String>,
}

impl KeyLayout {
    fn from_positions(positions: impl IntoIterator<Item = (String, (u8, u8))>) -> Self {
        let mut layout = Self {
            keys: BTreeMap::new(),
            names: BTreeMap::new(),
        };
        for (name, pos) in positions {
            layout.names.insert(pos, name.clone());
            layout.keys.insert(name, pos);
        }
        layout
    }

    /// Letters, digits, a few specials and the modifiers, laid out row by
    /// row while they fit the matrix.
    pub fn reference(geometry: MatrixGeometry) -> Self {
        let letters = ('A'..='Z').map(String::from);
        let digits = ('0'..='9').map(String::from);
        let others = SPECIAL_KEYS
            .iter()
            .chain(MODIFIER_KEYS.iter())
            .map(|k| (*k).to_string());
        let cols = usize::from(geometry.cols.max(1));
        let positions = letters
            .chain(digits)
            .chain(others)
            .enumerate()
            .filter_map(|(i, name)| {
                let row = u8::try_from(i / cols).ok()?;
                let col = u8::try_from(i % cols).ok()?;
                (row < geometry.rows).then_some((name, (row, col)))
            });
        Self::from_positions(positions)
    }

    /// The configured layout, or the reference one when none is configured.
    pub fn from_config(config: &KbdMatrixConfig, geometry: MatrixGeometry) -> Self {
        if config.layout.is_empty() {
            return Self::reference(geometry);
        }
        Self::from_positions(
            config
                .layout
                .iter()
                .map(|(name, pos)| (name.clone(), (pos.row, pos.col))),
        )
    }

    /// Row and column of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::UnknownKey`] for a key missing from the layout.
    pub fn position(&self, key: &str) -> Result<(u8, u8), DomainError> {
        self.keys
            .get(key)
            .copied()
            .ok_or_else(|| DomainError::unknown_key(key))
    }

    pub fn name_at(&self, row: u8, col: u8) -> Option<&str> {
        self.names.get(&(row, col)).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// HID modifier bit of `key`, if it is a modifier.
pub fn modifier_bit(key: &str) -> Option<u8> {
    MODIFIER_KEYS
        .iter()
        .position(|m| *m == key)
        .and_then(|i| u8::try_from(i).ok())
}

#[derive(Debug)]
pub struct KbdMatrix {
    base: ModuleBase,
    geometry: MatrixGeometry,
    layout: KeyLayout,
    send_action: u16,
    ready_event: u16,
    cache: BTreeMap<(u8, u8), u8>,
}

impl KbdMatrix {
    pub fn new(
        settings: ModuleSettings,
        geometry: MatrixGeometry,
        layout: KeyLayout,
        send_action: u16,
        ready_event: u16,
    ) -> Self {
        Self {
            base: ModuleBase::new(settings),
            geometry,
            layout,
            send_action,
            ready_event,
            cache: BTreeMap::new(),
        }
    }

    pub fn geometry(&self) -> MatrixGeometry {
        self.geometry
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// PES action that latches the next instruction(s).
    pub fn send_action(&self) -> u16 {
        self.send_action
    }

    /// Resume event raised once the last buffered instruction is consumed.
    pub fn ready_event(&self) -> u16 {
        self.ready_event
    }

    /// Set the state of `key` with `command` (`UPDATE` or `UPDATE_SEND`).
    ///
    /// Returns `false` when the lane word already holds that state: nothing
    /// is appended.
    pub fn set_state(&mut self, key: &str, pressed: bool, command: KbdCommand) -> KosmosResult<bool> {
        let (row, col) = self.layout.position(key)?;
        self.set_position_state(row, col, pressed, command)
    }

    /// Set the state of the key at (`row`, `col`).
    ///
    /// # Errors
    ///
    /// Returns a [`DomainError`] for a position outside the matrix or a
    /// command that is not a lane update.
    pub fn set_position_state(
        &mut self,
        row: u8,
        col: u8,
        pressed: bool,
        command: KbdCommand,
    ) -> KosmosResult<bool> {
        if !matches!(command, KbdCommand::Update | KbdCommand::UpdateSend) {
            return Err(DomainError::unsupported_action(
                self.base.name(),
                format!("{command:?} as a lane update"),
            )
            .into());
        }
        let coord = self.geometry.locate(row, col)?;
        let current = self.lane(coord);
        let bit = 1u8 << coord.lane_bit;
        let lane = if pressed { current | bit } else { current & !bit };
        if lane == current {
            debug!(
                module = %self.base.name(),
                row,
                col,
                pressed,
                "redundant key update suppressed"
            );
            return Ok(false);
        }
        let instruction = KbdInstruction::new(command, coord.bank, coord.addr, lane);
        self.base.append(instruction.encode()?)?;
        self.cache.insert((coord.bank, coord.addr), lane);
        Ok(true)
    }

    fn lane(&self, coord: MatrixCoord) -> u8 {
        self.cache
            .get(&(coord.bank, coord.addr))
            .copied()
            .unwrap_or_default()
    }

    /// Update the lane without latching; a later [`KbdMatrix::send`] commits it.
    pub fn update(&mut self, key: &str, pressed: bool) -> KosmosResult<bool> {
        self.set_state(key, pressed, KbdCommand::Update)
    }

    /// Update the lane and latch it in one instruction.
    pub fn update_send(&mut self, key: &str, pressed: bool) -> KosmosResult<bool> {
        self.set_state(key, pressed, KbdCommand::UpdateSend)
    }

    pub fn press(&mut self, key: &str) -> KosmosResult<bool> {
        self.update_send(key, true)
    }

    pub fn release(&mut self, key: &str) -> KosmosResult<bool> {
        self.update_send(key, false)
    }

    /// Latch every pending update.
    pub fn send(&mut self) -> KosmosResult<()> {
        self.base.append(KbdInstruction::send().encode()?)
    }

    /// Release every key and latch.
    pub fn reset_all(&mut self) -> KosmosResult<()> {
        self.base.append(KbdInstruction::reset().encode()?)?;
        self.cache.clear();
        Ok(())
    }

    pub fn is_pressed(&self, key: &str) -> KosmosResult<bool> {
        let (row, col) = self.layout.position(key)?;
        let coord = self.geometry.locate(row, col)?;
        Ok(self.lane(coord) & (1 << coord.lane_bit) != 0)
    }

    /// Names of the keys currently pressed in the cache, sorted.
    pub fn pressed_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for (&(bank, addr), &lane) in &self.cache {
            for lane_bit in (0..KBD_LANE_BITS).filter(|b| lane & (1 << b) != 0) {
                let coord = MatrixCoord {
                    bank,
                    addr,
                    lane_bit,
                };
                if let Ok((row, col)) = self.geometry.key_at(coord)
                    && let Some(name) = self.layout.name_at(row, col)
                {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        keys
    }

    /// Cached lane words, keyed by (bank, addr). Released lanes read as zero.
    pub fn lanes(&self) -> &BTreeMap<(u8, u8), u8> {
        &self.cache
    }
}

impl HardwareModule for KbdMatrix {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModuleBase {
        &mut self.base
    }

    fn on_reset(&mut self) {
        self.cache.clear();
    }

    /// Buffered instructions that latch.
    fn commits(&self) -> usize {
        self.base
            .words()
            .iter()
            .filter_map(|w| KbdInstruction::decode(*w).ok())
            .filter(|i| i.command.latches())
            .count()
    }
}

impl Checkpoint for KbdMatrix {
    type Saved = (usize, BTreeMap<(u8, u8), u8>);

    fn checkpoint(&self) -> Self::Saved {
        (self.base.len(), self.cache.clone())
    }

    fn restore(&mut self, (len, cache): Self::Saved) {
        self.base.truncate(len);
        self.cache = cache;
    }
}
