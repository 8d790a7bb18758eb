//! Optical sensor emulator instructions.
//!
//! Two encodings share the 32-bit instruction word; bit 31 selects one:
//!
//! ```text
//! raw        : cmd_idx:8 [7:0], cmd_val:16 [23:8], flags:8 [31:24] (bit 24 send)
//! compressed : dx:3 [2:0], dy:3 [5:3], lift:1 [6], skip:8 [15:8], repeat:8 [23:16],
//!              flags:8 [31:24] (bit 31 set)
//! ```
//!
//! A compressed entry updates the motion registers and commits in one word.

use core::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Command indexes of the emulator register map.
pub mod opt_cmd {
    pub const DX: u8 = 0x01;
    pub const DY: u8 = 0x02;
    pub const LIFT: u8 = 0x03;
    pub const SKIP: u8 = 0x04;
    pub const REPEAT: u8 = 0x05;
    /// First free raw command index.
    pub const RAW_BASE: u8 = 0x10;

    /// Commands the compressed encoding can carry.
    pub const COMPRESSIBLE: [u8; 5] = [DX, DY, LIFT, SKIP, REPEAT];

    pub fn name(idx: u8) -> &'static str {
        match idx {
            DX => "DX",
            DY => "DY",
            LIFT => "LIFT",
            SKIP => "SKIP",
            REPEAT => "REPEAT",
            _ => "RAW",
        }
    }
}

pub const FLAG_SEND: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x80;

pub const CMP_DELTA_MIN: i16 = -4;
pub const CMP_DELTA_MAX: i16 = 3;

/// One optical emulator instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptEmuInstruction {
    Raw {
        cmd_idx: u8,
        cmd_val: u16,
        /// Commit the register state to the sensor interface.
        send: bool,
    },
    Compressed {
        dx: i8,
        dy: i8,
        lift: bool,
        skip: u8,
        repeat: u8,
    },
}

impl OptEmuInstruction {
    pub fn raw(cmd_idx: u8, cmd_val: u16) -> Self {
        OptEmuInstruction::Raw {
            cmd_idx,
            cmd_val,
            send: false,
        }
    }

    /// Raw `REPEAT = 0`, which changes nothing.
    pub fn nop() -> Self {
        Self::raw(opt_cmd::REPEAT, 0)
    }

    /// Build a compressed entry, checking the field bounds.
    pub fn compressed(dx: i16, dy: i16, lift: bool, skip: u16, repeat: u16) -> ProtocolResult<Self> {
        Ok(OptEmuInstruction::Compressed {
            dx: check_delta("dx", dx)?,
            dy: check_delta("dy", dy)?,
            lift,
            skip: u8::try_from(skip)
                .ok()
                .ok_or(ProtocolError::out_of_range("skip", skip, 0, u8::MAX))?,
            repeat: u8::try_from(repeat)
                .ok()
                .ok_or(ProtocolError::out_of_range("repeat", repeat, 0, u8::MAX))?,
        })
    }

    /// Whether the values fit a compressed entry.
    pub fn fits_compressed(dx: i16, dy: i16, skip: u16, repeat: u16) -> bool {
        (CMP_DELTA_MIN..=CMP_DELTA_MAX).contains(&dx)
            && (CMP_DELTA_MIN..=CMP_DELTA_MAX).contains(&dy)
            && skip <= u16::from(u8::MAX)
            && repeat <= u16::from(u8::MAX)
    }

    pub fn with_send(self, send: bool) -> Self {
        match self {
            OptEmuInstruction::Raw {
                cmd_idx, cmd_val, ..
            } => OptEmuInstruction::Raw {
                cmd_idx,
                cmd_val,
                send,
            },
            other => other,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, OptEmuInstruction::Raw { .. })
    }

    pub fn is_nop(&self) -> bool {
        matches!(
            self,
            OptEmuInstruction::Raw {
                cmd_idx: opt_cmd::REPEAT,
                cmd_val: 0,
                ..
            }
        )
    }

    /// Whether consuming this entry commits the register state.
    pub fn commits(&self) -> bool {
        match self {
            OptEmuInstruction::Raw { send, .. } => *send,
            OptEmuInstruction::Compressed { .. } => true,
        }
    }

    pub fn encode(&self) -> u32 {
        match *self {
            OptEmuInstruction::Raw {
                cmd_idx,
                cmd_val,
                send,
            } => {
                let flags = if send { FLAG_SEND } else { 0 };
                (u32::from(flags) << 24) | (u32::from(cmd_val) << 8) | u32::from(cmd_idx)
            }
            OptEmuInstruction::Compressed {
                dx,
                dy,
                lift,
                skip,
                repeat,
            } => {
                let dx = u32::from(dx.cast_unsigned() & 0x07);
                let dy = u32::from(dy.cast_unsigned() & 0x07);
                (u32::from(FLAG_COMPRESSED) << 24)
                    | (u32::from(repeat) << 16)
                    | (u32::from(skip) << 8)
                    | (u32::from(lift) << 6)
                    | (dy << 3)
                    | dx
            }
        }
    }

    pub fn decode(word: u32) -> Self {
        let flags = (word >> 24) as u8;
        if flags & FLAG_COMPRESSED != 0 {
            OptEmuInstruction::Compressed {
                dx: sign_extend_3bits((word & 0x07) as u8),
                dy: sign_extend_3bits(((word >> 3) & 0x07) as u8),
                lift: (word >> 6) & 1 == 1,
                skip: ((word >> 8) & 0xFF) as u8,
                repeat: ((word >> 16) & 0xFF) as u8,
            }
        } else {
            OptEmuInstruction::Raw {
                cmd_idx: (word & 0xFF) as u8,
                cmd_val: ((word >> 8) & 0xFFFF) as u16,
                send: flags & FLAG_SEND != 0,
            }
        }
    }
}

impl fmt::Display for OptEmuInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OptEmuInstruction::Raw {
                cmd_idx,
                cmd_val,
                send,
            } => write!(
                f,
                "RAW: {} CMD={cmd_idx:#04x}:{:>6}, VAL={cmd_val:#06x}:{:6}",
                if send { "UP_SEND," } else { "UPDATE, " },
                opt_cmd::name(cmd_idx),
                cmd_val.cast_signed()
            ),
            OptEmuInstruction::Compressed {
                dx,
                dy,
                lift,
                skip,
                repeat,
            } => write!(
                f,
                "CMP: dX={dx:3}, dY={dy:3}, lift={}, skip={skip}, repeat={repeat}",
                u8::from(lift)
            ),
        }
    }
}

fn check_delta(field: &'static str, value: i16) -> ProtocolResult<i8> {
    if !(CMP_DELTA_MIN..=CMP_DELTA_MAX).contains(&value) {
        return Err(ProtocolError::out_of_range(
            field,
            value,
            CMP_DELTA_MIN,
            CMP_DELTA_MAX,
        ));
    }
    Ok(i8::try_from(value).unwrap_or_default())
}

fn sign_extend_3bits(bits: u8) -> i8 {
    let value = (bits & 0x07).cast_signed();
    if value & 0x04 != 0 { value - 8 } else { value }
}
