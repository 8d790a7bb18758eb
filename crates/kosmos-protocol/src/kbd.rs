//! Keyboard matrix instructions and key-to-lane mapping.
//!
//! ```text
//! 23      18 17 16 15       8 7        0
//! +---------+-----+----------+----------+
//! | command |bank |   addr   |   lane   |
//! +---------+-----+----------+----------+
//! ```
//!
//! `lane` is the full 8-bit lane word written at (`bank`, `addr`): one bit
//! per matrix key sharing that address.

use core::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Number of banks in the reference matrix.
pub const KBD_BANKS: u8 = 2;

/// Lane bits per lane word.
pub const KBD_LANE_BITS: u8 = 8;

const BANK_MAX: u8 = 0b11;
const COMMAND_MAX: u8 = 0b11_1111;

/// KBD matrix commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KbdCommand {
    /// Release every lane and latch.
    Reset,
    /// Write a lane word without latching.
    Update,
    /// Latch all pending updates.
    Send,
    /// Write a lane word and latch.
    UpdateSend,
}

impl KbdCommand {
    pub fn to_u8(self) -> u8 {
        match self {
            KbdCommand::Reset => 0,
            KbdCommand::Update => 1,
            KbdCommand::Send => 2,
            KbdCommand::UpdateSend => 3,
        }
    }

    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(KbdCommand::Reset),
            1 => Ok(KbdCommand::Update),
            2 => Ok(KbdCommand::Send),
            3 => Ok(KbdCommand::UpdateSend),
            other => Err(ProtocolError::InvalidValue {
                what: "KBD command",
                value: u32::from(other),
            }),
        }
    }

    /// Whether the command latches the lane state to the DUT.
    ///
    /// A `SEND` action consumes FIFO instructions up to and including the
    /// first latching one.
    pub fn latches(self) -> bool {
        !matches!(self, KbdCommand::Update)
    }
}

/// One KBD matrix instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KbdInstruction {
    pub command: KbdCommand,
    pub bank: u8,
    pub addr: u8,
    pub lane: u8,
}

impl KbdInstruction {
    pub fn new(command: KbdCommand, bank: u8, addr: u8, lane: u8) -> Self {
        Self {
            command,
            bank,
            addr,
            lane,
        }
    }

    pub fn reset() -> Self {
        Self::new(KbdCommand::Reset, 0, 0, 0)
    }

    pub fn send() -> Self {
        Self::new(KbdCommand::Send, 0, 0, 0)
    }

    pub fn encode(&self) -> ProtocolResult<u32> {
        if self.bank > BANK_MAX {
            return Err(ProtocolError::out_of_range("bank", self.bank, 0, BANK_MAX));
        }
        let command = self.command.to_u8();
        if command > COMMAND_MAX {
            return Err(ProtocolError::out_of_range("command", command, 0, COMMAND_MAX));
        }
        Ok((u32::from(command) << 18)
            | (u32::from(self.bank) << 16)
            | (u32::from(self.addr) << 8)
            | u32::from(self.lane))
    }

    pub fn decode(word: u32) -> ProtocolResult<Self> {
        let command = KbdCommand::from_u8(((word >> 18) & u32::from(COMMAND_MAX)) as u8)?;
        Ok(Self {
            command,
            bank: ((word >> 16) & u32::from(BANK_MAX)) as u8,
            addr: ((word >> 8) & 0xFF) as u8,
            lane: (word & 0xFF) as u8,
        })
    }
}

impl fmt::Display for KbdInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            KbdCommand::Reset => write!(f, "RESET"),
            KbdCommand::Send => write!(f, "SEND"),
            KbdCommand::Update => write!(
                f,
                "UPDATE bank={} addr={:#04x} lane={:#010b}",
                self.bank, self.addr, self.lane
            ),
            KbdCommand::UpdateSend => write!(
                f,
                "UPDATE_SEND bank={} addr={:#04x} lane={:#010b}",
                self.bank, self.addr, self.lane
            ),
        }
    }
}

/// Position of a key in the matrix state RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatrixCoord {
    pub bank: u8,
    pub addr: u8,
    /// Bit index inside the lane word.
    pub lane_bit: u8,
}

/// Matrix dimensions and the row/column to RAM mapping.
///
/// Rows split evenly across the two banks:
/// `bank = row >= rows/2`, `lane_bit = (row mod rows/2) >> 1`,
/// `addr = (col << 1) | (row & 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixGeometry {
    pub rows: u8,
    pub cols: u8,
}

impl MatrixGeometry {
    /// Validate and build a geometry.
    pub fn new(rows: u8, cols: u8) -> ProtocolResult<Self> {
        let max_rows = KBD_BANKS * KBD_LANE_BITS * 2;
        if rows < 4 || rows > max_rows {
            return Err(ProtocolError::out_of_range("rows", rows, 4, max_rows));
        }
        if rows % 4 != 0 {
            return Err(ProtocolError::InvalidValue {
                what: "matrix rows (multiple of 4)",
                value: u32::from(rows),
            });
        }
        if cols == 0 || cols > 128 {
            return Err(ProtocolError::out_of_range("cols", cols, 1, 128));
        }
        Ok(Self { rows, cols })
    }

    /// Number of addresses per bank.
    pub fn addr_count(&self) -> u16 {
        u16::from(self.cols) * 2
    }

    /// Lane bits actually used per lane word.
    pub fn lane_count(&self) -> u8 {
        self.rows / 4
    }

    pub fn locate(&self, row: u8, col: u8) -> ProtocolResult<MatrixCoord> {
        if row >= self.rows {
            return Err(ProtocolError::out_of_range("row", row, 0, self.rows - 1));
        }
        if col >= self.cols {
            return Err(ProtocolError::out_of_range("col", col, 0, self.cols - 1));
        }
        let half = self.rows / 2;
        Ok(MatrixCoord {
            bank: u8::from(row >= half),
            addr: (col << 1) | (row & 1),
            lane_bit: (row % half) >> 1,
        })
    }

    /// Inverse of [`MatrixGeometry::locate`].
    pub fn key_at(&self, coord: MatrixCoord) -> ProtocolResult<(u8, u8)> {
        self.check_coord(coord)?;
        let half = self.rows / 2;
        let row = coord.bank * half + (coord.lane_bit << 1) + (coord.addr & 1);
        let col = coord.addr >> 1;
        if row >= self.rows || col >= self.cols {
            return Err(ProtocolError::out_of_range("row", row, 0, self.rows - 1));
        }
        Ok((row, col))
    }

    /// Range-check a coordinate against this geometry.
    pub fn check_coord(&self, coord: MatrixCoord) -> ProtocolResult<()> {
        if coord.bank >= KBD_BANKS {
            return Err(ProtocolError::out_of_range("bank", coord.bank, 0, KBD_BANKS - 1));
        }
        if u16::from(coord.addr) >= self.addr_count() {
            return Err(ProtocolError::out_of_range(
                "addr",
                coord.addr,
                0,
                self.addr_count() - 1,
            ));
        }
        if coord.lane_bit >= self.lane_count() {
            return Err(ProtocolError::out_of_range(
                "lane",
                coord.lane_bit,
                0,
                self.lane_count() - 1,
            ));
        }
        Ok(())
    }
}
