//! Button and axis stimulus instructions.
//!
//! ```text
//! 31       26 25  24 23      16 15               0
//! +----------+------+----------+------------------+
//! | reserved | cmd  | channel  |      level       |
//! +----------+------+----------+------------------+
//! ```
//!
//! A button channel takes level 0 (released) or 1 (pressed); an axis
//! channel takes a level up to [`BAS_LEVEL_MAX`]. Buttons come first in
//! the channel space, axes follow.

use core::fmt;

use crate::error::{ProtocolError, ProtocolResult};

/// Largest axis level (12-bit DAC).
pub const BAS_LEVEL_MAX: u16 = 0x0FFF;

/// Level of a pressed button.
pub const BAS_BUTTON_PRESSED: u16 = 1;

/// Channels addressable by one module.
pub const BAS_CHANNELS: u16 = 256;

const COMMAND_MAX: u32 = 0b11;
const RESERVED_MASK: u32 = !0x03FF_FFFF;

/// BAS commands, numbered like the keyboard matrix ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasCommand {
    /// Every channel back to its rest level, latched.
    Reset,
    /// Write a channel level without latching.
    Update,
    /// Latch all pending levels.
    Send,
    /// Write a channel level and latch.
    UpdateSend,
}

impl BasCommand {
    pub fn to_u8(self) -> u8 {
        match self {
            BasCommand::Reset => 0,
            BasCommand::Update => 1,
            BasCommand::Send => 2,
            BasCommand::UpdateSend => 3,
        }
    }

    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(BasCommand::Reset),
            1 => Ok(BasCommand::Update),
            2 => Ok(BasCommand::Send),
            3 => Ok(BasCommand::UpdateSend),
            other => Err(ProtocolError::InvalidValue {
                what: "BAS command",
                value: u32::from(other),
            }),
        }
    }

    /// Whether a `FIRE` action stops after this instruction.
    pub fn latches(self) -> bool {
        !matches!(self, BasCommand::Update)
    }
}

/// One button/axis instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BasInstruction {
    pub command: BasCommand,
    pub channel: u8,
    pub level: u16,
}

impl BasInstruction {
    pub fn new(command: BasCommand, channel: u8, level: u16) -> Self {
        Self {
            command,
            channel,
            level,
        }
    }

    pub fn reset() -> Self {
        Self::new(BasCommand::Reset, 0, 0)
    }

    pub fn send() -> Self {
        Self::new(BasCommand::Send, 0, 0)
    }

    pub fn encode(&self) -> u32 {
        (u32::from(self.command.to_u8()) << 24)
            | (u32::from(self.channel) << 16)
            | u32::from(self.level)
    }

    pub fn decode(word: u32) -> ProtocolResult<Self> {
        if word & RESERVED_MASK != 0 {
            return Err(ProtocolError::InvalidValue {
                what: "BAS instruction",
                value: word,
            });
        }
        Ok(Self {
            command: BasCommand::from_u8(((word >> 24) & COMMAND_MAX) as u8)?,
            channel: ((word >> 16) & 0xFF) as u8,
            level: (word & 0xFFFF) as u16,
        })
    }
}

impl fmt::Display for BasInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            BasCommand::Reset => write!(f, "RESET"),
            BasCommand::Send => write!(f, "SEND"),
            BasCommand::Update => {
                write!(f, "UPDATE channel={} level={:#06x}", self.channel, self.level)
            }
            BasCommand::UpdateSend => write!(
                f,
                "UPDATE_SEND channel={} level={:#06x}",
                self.channel, self.level
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() -> Result<(), Box<dyn std::error::Error>> {
        let instruction = BasInstruction::new(BasCommand::UpdateSend, 9, 0x0ABC);
        assert_eq!(instruction.encode(), 0x0309_0ABC);
        assert_eq!(BasInstruction::decode(0x0309_0ABC)?, instruction);
        assert_eq!(BasInstruction::send().encode(), 0x0200_0000);
        assert_eq!(instruction.to_string(), "UPDATE_SEND channel=9 level=0x0abc");
        Ok(())
    }

    #[test]
    fn test_reserved_bits_rejected() {
        assert!(matches!(
            BasInstruction::decode(0x0400_0000),
            Err(ProtocolError::InvalidValue { what: "BAS instruction", .. })
        ));
    }

    #[test]
    fn test_only_update_defers_the_latch() {
        assert!(!BasCommand::Update.latches());
        assert!(BasCommand::UpdateSend.latches());
        assert!(BasCommand::Send.latches());
        assert!(BasCommand::Reset.latches());
    }
}
