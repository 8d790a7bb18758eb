//! PES instruction set.
//!
//! Every instruction is one 32-bit little-endian word:
//!
//! ```text
//! 31    28 27    24 23            12 11             0
//! +-------+--------+----------------+----------------+
//! | opcode|  nib   |    mantissa    |  action mask   |   DELAY / SUBDELAY
//! +-------+--------+----------------+----------------+
//! | opcode|          (reserved)     |  event mask    |   EXECUTE / WAIT
//! +-------+-------------------------+----------------+
//! | opcode|          (reserved)     |  marker ops    |   MARKER
//! +-------+-------------------------+----------------+
//! ```
//!
//! Durations are expressed in FPGA clock ticks. Only `DELAY`, `SUBDELAY`
//! and `WAIT` suspend the sequencer; every other instruction takes one tick.

use core::fmt;

use bitflags::bitflags;

use crate::error::{ProtocolError, ProtocolResult};

/// Opcodes (bits 31..28).
pub mod opcode {
    pub const NOP: u8 = 0x0;
    pub const EXECUTE: u8 = 0x1;
    pub const WAIT: u8 = 0x2;
    pub const MARKER: u8 = 0x3;
    pub const SUBDELAY: u8 = 0x4;
    pub const DELAY: u8 = 0x8;
}

/// Number of action (and resume) event bits.
pub const EVENT_BITS: u32 = 12;

/// Valid bits of an action or resume event mask.
pub const EVENT_MASK: u16 = (1 << EVENT_BITS) - 1;

/// Ticks per `DELAY` mantissa unit.
pub const DELAY_UNIT_TICKS: u64 = 100;

/// Largest `DELAY` mantissa.
pub const DELAY_MANTISSA_MAX: u16 = 0xFFE;

/// Largest `DELAY` exponent.
pub const DELAY_EXPONENT_MAX: u8 = 15;

/// Ticks per `SUBDELAY` nibble unit.
pub const SUBDELAY_UNIT_TICKS: u64 = 10;

/// Largest `SUBDELAY` nibble.
pub const SUBDELAY_NIBBLE_MAX: u8 = 9;

/// Duration of a `SUBDELAY` with nibble 0.
pub const SUBDELAY_HALF_TICKS: u64 = 5;

bitflags! {
    /// Timer operations carried by a `MARKER` instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MarkerOps: u16 {
        const SAVE_GLOBAL = 0x001;
        const SAVE_LOCAL = 0x002;
        const SAVE_STOPWATCH_1 = 0x004;
        const SAVE_STOPWATCH_2 = 0x008;
        const RESET_LOCAL = 0x010;
        const RESET_STOPWATCH_1 = 0x020;
        const RESET_STOPWATCH_2 = 0x040;
        const STOPWATCH_1_GO = 0x080;
        const STOPWATCH_2_GO = 0x100;
        const STOPWATCH_1_STOP = 0x200;
        const STOPWATCH_2_STOP = 0x400;
    }
}

/// A decoded PES instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PesInstruction {
    Nop,
    /// Raise `actions` and continue.
    Execute { actions: u16 },
    /// Suspend until any of `events` is asserted.
    Wait { events: u16 },
    /// Apply timer operations.
    Marker { ops: MarkerOps },
    /// Short delay: nibble 0 is 5 ticks, otherwise `nibble * 10` ticks.
    SubDelay { nibble: u8, actions: u16 },
    /// Long delay of `mantissa * 2^exponent * 100` ticks.
    Delay {
        exponent: u8,
        mantissa: u16,
        actions: u16,
    },
}

impl PesInstruction {
    /// Encode into a 32-bit word, validating every field.
    pub fn encode(&self) -> ProtocolResult<u32> {
        let word = match *self {
            PesInstruction::Nop => u32::from(opcode::NOP) << 28,
            PesInstruction::Execute { actions } => {
                check_mask("actions", actions)?;
                (u32::from(opcode::EXECUTE) << 28) | u32::from(actions)
            }
            PesInstruction::Wait { events } => {
                check_mask("events", events)?;
                (u32::from(opcode::WAIT) << 28) | u32::from(events)
            }
            PesInstruction::Marker { ops } => (u32::from(opcode::MARKER) << 28) | u32::from(ops.bits()),
            PesInstruction::SubDelay { nibble, actions } => {
                check_mask("actions", actions)?;
                if nibble > SUBDELAY_NIBBLE_MAX {
                    return Err(ProtocolError::out_of_range(
                        "subdelay",
                        nibble,
                        0,
                        SUBDELAY_NIBBLE_MAX,
                    ));
                }
                (u32::from(opcode::SUBDELAY) << 28) | (u32::from(nibble) << 24) | u32::from(actions)
            }
            PesInstruction::Delay {
                exponent,
                mantissa,
                actions,
            } => {
                check_mask("actions", actions)?;
                if exponent > DELAY_EXPONENT_MAX {
                    return Err(ProtocolError::out_of_range(
                        "exponent",
                        exponent,
                        0,
                        DELAY_EXPONENT_MAX,
                    ));
                }
                if mantissa == 0 || mantissa > DELAY_MANTISSA_MAX {
                    return Err(ProtocolError::out_of_range(
                        "mantissa",
                        mantissa,
                        1,
                        DELAY_MANTISSA_MAX,
                    ));
                }
                (u32::from(opcode::DELAY) << 28)
                    | (u32::from(exponent) << 24)
                    | (u32::from(mantissa) << 12)
                    | u32::from(actions)
            }
        };
        Ok(word)
    }

    /// Decode a 32-bit word.
    pub fn decode(word: u32) -> ProtocolResult<Self> {
        let op = ((word >> 28) & 0xF) as u8;
        let nibble = ((word >> 24) & 0xF) as u8;
        let mantissa = ((word >> 12) & 0xFFF) as u16;
        let low = (word & u32::from(EVENT_MASK)) as u16;
        match op {
            opcode::NOP => Ok(PesInstruction::Nop),
            opcode::EXECUTE => Ok(PesInstruction::Execute { actions: low }),
            opcode::WAIT => Ok(PesInstruction::Wait { events: low }),
            opcode::MARKER => Ok(PesInstruction::Marker {
                ops: MarkerOps::from_bits_truncate((word & 0x7FF) as u16),
            }),
            opcode::SUBDELAY if nibble <= SUBDELAY_NIBBLE_MAX => Ok(PesInstruction::SubDelay {
                nibble,
                actions: low,
            }),
            opcode::DELAY if mantissa != 0 && mantissa <= DELAY_MANTISSA_MAX => {
                Ok(PesInstruction::Delay {
                    exponent: nibble,
                    mantissa,
                    actions: low,
                })
            }
            _ => Err(ProtocolError::InvalidValue {
                what: "PES instruction",
                value: word,
            }),
        }
    }

    /// Ticks the sequencer spends on this instruction, not counting `WAIT` suspension.
    pub fn duration_ticks(&self) -> u64 {
        match *self {
            PesInstruction::SubDelay { nibble: 0, .. } => SUBDELAY_HALF_TICKS,
            PesInstruction::SubDelay { nibble, .. } => u64::from(nibble) * SUBDELAY_UNIT_TICKS,
            PesInstruction::Delay {
                exponent, mantissa, ..
            } => (u64::from(mantissa) << exponent) * DELAY_UNIT_TICKS,
            _ => 1,
        }
    }

    /// Actions raised by this instruction.
    pub fn actions(&self) -> u16 {
        match *self {
            PesInstruction::Execute { actions }
            | PesInstruction::SubDelay { actions, .. }
            | PesInstruction::Delay { actions, .. } => actions,
            _ => 0,
        }
    }

    /// Same instruction raising `actions` instead, for instructions that carry actions.
    pub fn with_actions(self, actions: u16) -> Self {
        match self {
            PesInstruction::Execute { .. } => PesInstruction::Execute { actions },
            PesInstruction::SubDelay { nibble, .. } => PesInstruction::SubDelay { nibble, actions },
            PesInstruction::Delay {
                exponent, mantissa, ..
            } => PesInstruction::Delay {
                exponent,
                mantissa,
                actions,
            },
            other => other,
        }
    }

    pub fn is_delay(&self) -> bool {
        matches!(
            self,
            PesInstruction::Delay { .. } | PesInstruction::SubDelay { .. }
        )
    }
}

impl fmt::Display for PesInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PesInstruction::Nop => write!(f, "NOP"),
            PesInstruction::Execute { actions } => write!(f, "EXECUTE actions={actions:#05x}"),
            PesInstruction::Wait { events } => write!(f, "WAIT events={events:#05x}"),
            PesInstruction::Marker { ops } => write!(f, "MARKER ops={:#05x}", ops.bits()),
            PesInstruction::SubDelay { nibble, actions } => write!(
                f,
                "SUBDELAY ticks={} nibble={nibble} actions={actions:#05x}",
                self.duration_ticks()
            ),
            PesInstruction::Delay {
                exponent,
                mantissa,
                actions,
            } => write!(
                f,
                "DELAY ticks={} mantissa={mantissa:#05x} exponent={exponent} actions={actions:#05x}",
                self.duration_ticks()
            ),
        }
    }
}

fn check_mask(field: &'static str, mask: u16) -> ProtocolResult<()> {
    if mask & !EVENT_MASK != 0 {
        return Err(ProtocolError::out_of_range(field, mask, 0, EVENT_MASK));
    }
    Ok(())
}

/// Ticks of the longest single `DELAY` instruction.
pub const DELAY_MAX_TICKS: u64 =
    ((DELAY_MANTISSA_MAX as u64) << DELAY_EXPONENT_MAX) * DELAY_UNIT_TICKS;

/// Split a delay into PES instructions.
///
/// The longest `DELAY` steps come first, followed by `SUBDELAY` steps and
/// one-tick `EXECUTE` instructions for the remainder. The last instruction
/// raises `actions`, so the actions fire exactly when the delay ends.
pub fn encode_delay(ticks: u64, actions: u16) -> ProtocolResult<Vec<PesInstruction>> {
    encode_delay_within(ticks, actions, usize::MAX)
}

/// [`encode_delay`] that gives up once more than `limit` instructions
/// would be needed.
///
/// The bound is checked before anything is built, so the cost of a
/// rejected delay does not grow with its length.
///
/// # Errors
///
/// Returns [`ProtocolError::ProgramTooLong`] when the delay does not fit
/// in `limit` instructions.
pub fn encode_delay_within(
    ticks: u64,
    actions: u16,
    limit: usize,
) -> ProtocolResult<Vec<PesInstruction>> {
    if ticks == 0 {
        return Err(ProtocolError::out_of_range("delay ticks", 0u8, 1u8, u32::MAX));
    }
    check_mask("actions", actions)?;
    if !usize::try_from(ticks / DELAY_MAX_TICKS).is_ok_and(|steps| steps <= limit) {
        return Err(ProtocolError::ProgramTooLong { limit });
    }

    let mut instructions = Vec::new();
    let mut remaining = ticks;
    let push = |instructions: &mut Vec<PesInstruction>, instruction: PesInstruction| {
        if instructions.len() >= limit {
            return Err(ProtocolError::ProgramTooLong { limit });
        }
        instructions.push(instruction);
        Ok(())
    };

    while remaining >= DELAY_UNIT_TICKS {
        let units = remaining / DELAY_UNIT_TICKS;
        let exponent = if units > u64::from(DELAY_MANTISSA_MAX) {
            (units / u64::from(DELAY_MANTISSA_MAX))
                .ilog2()
                .min(u32::from(DELAY_EXPONENT_MAX))
        } else {
            0
        };
        let mantissa = (units >> exponent).min(u64::from(DELAY_MANTISSA_MAX));
        let instruction = PesInstruction::Delay {
            exponent: u8::try_from(exponent).unwrap_or(DELAY_EXPONENT_MAX),
            mantissa: u16::try_from(mantissa).unwrap_or(DELAY_MANTISSA_MAX),
            actions: 0,
        };
        remaining = remaining.saturating_sub(instruction.duration_ticks());
        push(&mut instructions, instruction)?;
    }

    while remaining >= SUBDELAY_UNIT_TICKS {
        let nibble = (remaining / SUBDELAY_UNIT_TICKS).min(u64::from(SUBDELAY_NIBBLE_MAX));
        let instruction = PesInstruction::SubDelay {
            nibble: u8::try_from(nibble).unwrap_or(SUBDELAY_NIBBLE_MAX),
            actions: 0,
        };
        remaining = remaining.saturating_sub(instruction.duration_ticks());
        push(&mut instructions, instruction)?;
    }

    if remaining >= SUBDELAY_HALF_TICKS {
        push(
            &mut instructions,
            PesInstruction::SubDelay {
                nibble: 0,
                actions: 0,
            },
        )?;
        remaining -= SUBDELAY_HALF_TICKS;
    }

    for _ in 0..remaining {
        push(&mut instructions, PesInstruction::Execute { actions: 0 })?;
    }

    if let Some(last) = instructions.last_mut() {
        *last = last.with_actions(actions);
    }
    Ok(instructions)
}

/// Total execution time of a PES program, not counting `WAIT` suspension.
pub fn execution_duration_ticks(instructions: &[PesInstruction]) -> u64 {
    instructions.iter().map(PesInstruction::duration_ticks).sum()
}

/// Execution time in nanoseconds.
pub fn execution_duration_ns(instructions: &[PesInstruction], clock_period_ns: u64) -> u64 {
    execution_duration_ticks(instructions).saturating_mul(clock_period_ns)
}

/// Convert a duration to ticks, flooring at the clock period.
///
/// Returns the tick count and the truncated remainder in nanoseconds.
pub fn ns_to_ticks(ns: u64, clock_period_ns: u64) -> (u64, u64) {
    if clock_period_ns == 0 {
        return (0, ns);
    }
    (ns / clock_period_ns, ns % clock_period_ns)
}

/// Round a duration up to the next multiple of the clock period.
pub fn roundup_delay_ns(ns: u64, clock_period_ns: u64) -> u64 {
    if clock_period_ns == 0 {
        return ns;
    }
    ns.div_ceil(clock_period_ns).saturating_mul(clock_period_ns)
}

/// Round a duration in seconds up to the clock period.
pub fn roundup_delay_s(seconds: f64, clock_period_ns: u64) -> f64 {
    let ns = (seconds * 1e9).ceil().max(0.0) as u64;
    roundup_delay_ns(ns, clock_period_ns) as f64 / 1e9
}

/// Encode a program into words.
pub fn encode_program(instructions: &[PesInstruction]) -> ProtocolResult<Vec<u32>> {
    instructions.iter().map(PesInstruction::encode).collect()
}

/// Disassemble a program, one instruction per line.
pub fn disassemble(words: &[u32]) -> String {
    words
        .iter()
        .enumerate()
        .map(|(i, w)| match PesInstruction::decode(*w) {
            Ok(instr) => format!("{i:04}: {w:#010x} {instr}"),
            Err(_) => format!("{i:04}: {w:#010x} <invalid>"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
