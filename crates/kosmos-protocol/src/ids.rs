//! Message ids, command ids and return codes of the FPGA link.

use core::fmt;

/// Message ids of the core modules and the dynamic range.
pub mod msg_id {
    /// Transport-level return-code replies.
    pub const STATUS: u8 = 0x00;
    /// Sequencer (aggregated status, reset/init/start).
    pub const SEQUENCER: u8 = 0x01;
    /// Programmable Event Sequencer.
    pub const PES: u8 = 0x02;
    /// PES timers: global, local and two stopwatches.
    pub const PES_TIMER: u8 = 0x03;
    /// First id available to optional modules.
    pub const DYN_BASE: u8 = 0x10;
    /// Last id available to optional modules.
    pub const DYN_END: u8 = 0x3F;

    /// Whether `id` lies in the dynamic range.
    pub const fn is_dynamic(id: u8) -> bool {
        id >= DYN_BASE && id <= DYN_END
    }
}

/// Command ids.
pub mod cmd {
    /// Query status.
    pub const STATUS: u8 = 0x01;
    /// Reset FIFO, buffer and counters.
    pub const RESET: u8 = 0x02;
    /// Start module or sequence.
    pub const START: u8 = 0x03;
    /// Stop module.
    pub const STOP: u8 = 0x04;
    /// Force an update.
    pub const UPDATE: u8 = 0x05;
    /// Initialise the hardware FIFOs from the uploaded buffers.
    pub const INIT: u8 = 0x06;
    /// Producer read of one entry.
    pub const READ_1: u8 = 0x10;
    /// Producer read of the maximum entry count.
    pub const READ_MAX: u8 = 0x1F;
    /// Set on the command byte of every reply.
    pub const REPLY_FLAG: u8 = 0x80;
}

/// Entries returned by a `READ_MAX` producer read.
pub const PRODUCER_READ_MAX_ENTRIES: usize = (cmd::READ_MAX - cmd::READ_1 + 1) as usize;

/// Timer read commands: one 8-command block per timer.
pub mod timer_cmd {
    /// Global timestamp reads.
    pub const GLOBAL_READ_1: u8 = 0x10;
    /// Local timestamp reads.
    pub const LOCAL_READ_1: u8 = 0x18;
    /// Stopwatch 1 reads.
    pub const STOPWATCH_1_READ_1: u8 = 0x20;
    /// Stopwatch 2 reads.
    pub const STOPWATCH_2_READ_1: u8 = 0x28;
    /// Entries per read block.
    pub const READ_BLOCK: u8 = 8;
}

/// Entries returned by a full timer read.
pub const TIMER_READ_MAX_ENTRIES: usize = timer_cmd::READ_BLOCK as usize;

/// Return codes carried by [`msg_id::STATUS`] replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    /// Request accepted.
    Success = 0,
    /// Unknown message id.
    UnknownMsgId = 1,
    /// Unknown command id for this message id.
    UnknownMsgCmd = 2,
    /// Command recognised but not implemented.
    NotImplemented = 3,
    /// Payload length does not match the command.
    BadLength = 4,
    /// Flow-control rejection.
    FlowControl = 5,
    /// Module buffer overrun.
    BufferOverrun = 6,
    /// Module buffer underrun.
    BufferUnderrun = 7,
}

impl ReturnCode {
    /// Decode a return code byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::UnknownMsgId),
            2 => Some(Self::UnknownMsgCmd),
            3 => Some(Self::NotImplemented),
            4 => Some(Self::BadLength),
            5 => Some(Self::FlowControl),
            6 => Some(Self::BufferOverrun),
            7 => Some(Self::BufferUnderrun),
            _ => None,
        }
    }

    /// Wire value.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Symbolic name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::UnknownMsgId => "UNKNOWN_MSG_ID",
            Self::UnknownMsgCmd => "UNKNOWN_MSG_CMD",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::BadLength => "BAD_LENGTH",
            Self::FlowControl => "FLOW_CONTROL",
            Self::BufferOverrun => "BUFFER_OVERRUN",
            Self::BufferUnderrun => "BUFFER_UNDERRUN",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name of a return code byte, including unknown values.
pub fn return_code_name(value: u8) -> String {
    match ReturnCode::from_u8(value) {
        Some(code) => code.name().to_string(),
        None => format!("UNKNOWN({value:#04x})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_range() {
        assert!(!msg_id::is_dynamic(msg_id::PES_TIMER));
        assert!(msg_id::is_dynamic(msg_id::DYN_BASE));
        assert!(msg_id::is_dynamic(msg_id::DYN_END));
        assert!(!msg_id::is_dynamic(0x40));
    }

    #[test]
    fn test_return_code_roundtrip() {
        for value in 0u8..=7 {
            let code = ReturnCode::from_u8(value);
            assert_eq!(code.map(ReturnCode::to_u8), Some(value));
        }
        assert_eq!(ReturnCode::from_u8(8), None);
        assert_eq!(return_code_name(9), "UNKNOWN(0x09)");
    }

    #[test]
    fn test_read_sizes() {
        assert_eq!(PRODUCER_READ_MAX_ENTRIES, 16);
        assert_eq!(TIMER_READ_MAX_ENTRIES, 8);
    }
}
