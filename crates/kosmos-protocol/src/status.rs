//! Status records.
//!
//! Every module answers a status or reset request with one 8-byte record:
//!
//! ```text
//! fifo_count:16 LE, buffer_count:16 LE, flags:8, state:8, reserved:16
//! ```
//!
//! How the record is interpreted depends on the module's status shape,
//! modelled by [`ModuleStatus`]. Callers never match on the module type;
//! they ask the record for its [`Capabilities`].

use core::fmt;

use bitflags::bitflags;

use crate::error::{ProtocolError, ProtocolResult};

/// Size of one status record.
pub const STATUS_RECORD_LEN: usize = 8;

/// Number of records in the timers reply.
pub const TIMER_COUNT: usize = 4;

bitflags! {
    /// Status flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u8 {
        const FIFO_OVERRUN = 0x01;
        const BUFFER_OVERRUN = 0x02;
        const UNDERRUN = 0x04;
        const SOFT_RESET = 0x08;
        const BAD_OPCODE = 0x10;
        const ENABLED = 0x20;
    }
}

bitflags! {
    /// What a status shape reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u16 {
        const FIFO = 1 << 0;
        const BUFFER = 1 << 1;
        const OVERRUN = 1 << 2;
        const UNDERRUN = 1 << 3;
        const SOFT_RESET = 1 << 4;
        const BAD_OPCODE = 1 << 5;
        const CAPTURE_STATE = 1 << 6;
        const ENABLED = 1 << 7;
    }
}

/// Raw 8-byte status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub fifo_count: u16,
    pub buffer_count: u16,
    pub flags: StatusFlags,
    pub state: u8,
}

impl StatusRecord {
    pub fn encode(&self) -> [u8; STATUS_RECORD_LEN] {
        let fifo = self.fifo_count.to_le_bytes();
        let buffer = self.buffer_count.to_le_bytes();
        [
            fifo[0],
            fifo[1],
            buffer[0],
            buffer[1],
            self.flags.bits(),
            self.state,
            0,
            0,
        ]
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        match buf {
            [f0, f1, b0, b1, flags, state, _, _, ..] => Ok(Self {
                fifo_count: u16::from_le_bytes([*f0, *f1]),
                buffer_count: u16::from_le_bytes([*b0, *b1]),
                flags: StatusFlags::from_bits_retain(*flags),
                state: *state,
            }),
            _ => Err(ProtocolError::Truncated {
                expected: STATUS_RECORD_LEN,
                actual: buf.len(),
            }),
        }
    }
}

/// Status shape of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusShape {
    Pes,
    Consumer,
    Producer,
    Timer,
}

impl StatusShape {
    pub fn capabilities(self) -> Capabilities {
        match self {
            StatusShape::Pes => {
                Capabilities::FIFO
                    | Capabilities::BUFFER
                    | Capabilities::OVERRUN
                    | Capabilities::SOFT_RESET
                    | Capabilities::BAD_OPCODE
            }
            StatusShape::Consumer => {
                Capabilities::FIFO
                    | Capabilities::BUFFER
                    | Capabilities::OVERRUN
                    | Capabilities::UNDERRUN
                    | Capabilities::ENABLED
            }
            StatusShape::Producer => {
                Capabilities::FIFO
                    | Capabilities::BUFFER
                    | Capabilities::OVERRUN
                    | Capabilities::CAPTURE_STATE
            }
            StatusShape::Timer => Capabilities::BUFFER | Capabilities::OVERRUN,
        }
    }
}

/// Producer capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CaptureState {
    #[default]
    ResetOrStopped,
    Started,
}

impl CaptureState {
    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            CaptureState::Started
        } else {
            CaptureState::ResetOrStopped
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            CaptureState::ResetOrStopped => 0,
            CaptureState::Started => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PesStatus {
    pub fifo_count: u16,
    pub buffer_count: u16,
    pub overrun: bool,
    /// FIFO ran dry. Expected once the program has been consumed.
    pub underrun: bool,
    pub soft_reset: bool,
    pub bad_opcode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerStatus {
    pub fifo_count: u16,
    pub buffer_count: u16,
    pub overrun: bool,
    pub underrun: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerStatus {
    pub fifo_count: u16,
    pub buffer_count: u16,
    pub overrun: bool,
    pub capture_state: CaptureState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerStatus {
    pub buffer_count: u16,
    pub overrun: bool,
}

/// Decoded module status, one variant per status shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Pes(PesStatus),
    Consumer(ConsumerStatus),
    Producer(ProducerStatus),
    Timer(TimerStatus),
}

impl ModuleStatus {
    /// Interpret a raw record according to `shape`.
    pub fn from_record(shape: StatusShape, record: &StatusRecord) -> Self {
        let flags = record.flags;
        let overrun = flags.intersects(StatusFlags::FIFO_OVERRUN | StatusFlags::BUFFER_OVERRUN);
        match shape {
            StatusShape::Pes => ModuleStatus::Pes(PesStatus {
                fifo_count: record.fifo_count,
                buffer_count: record.buffer_count,
                overrun,
                underrun: flags.contains(StatusFlags::UNDERRUN),
                soft_reset: flags.contains(StatusFlags::SOFT_RESET),
                bad_opcode: flags.contains(StatusFlags::BAD_OPCODE),
            }),
            StatusShape::Consumer => ModuleStatus::Consumer(ConsumerStatus {
                fifo_count: record.fifo_count,
                buffer_count: record.buffer_count,
                overrun,
                underrun: flags.contains(StatusFlags::UNDERRUN),
                enabled: flags.contains(StatusFlags::ENABLED),
            }),
            StatusShape::Producer => ModuleStatus::Producer(ProducerStatus {
                fifo_count: record.fifo_count,
                buffer_count: record.buffer_count,
                overrun,
                capture_state: CaptureState::from_u8(record.state),
            }),
            StatusShape::Timer => ModuleStatus::Timer(TimerStatus {
                buffer_count: record.buffer_count,
                overrun,
            }),
        }
    }

    /// Encode back into a raw record.
    pub fn to_record(&self) -> StatusRecord {
        let mut flags = StatusFlags::empty();
        match *self {
            ModuleStatus::Pes(s) => {
                flags.set(StatusFlags::BUFFER_OVERRUN, s.overrun);
                flags.set(StatusFlags::UNDERRUN, s.underrun);
                flags.set(StatusFlags::SOFT_RESET, s.soft_reset);
                flags.set(StatusFlags::BAD_OPCODE, s.bad_opcode);
                StatusRecord {
                    fifo_count: s.fifo_count,
                    buffer_count: s.buffer_count,
                    flags,
                    state: 0,
                }
            }
            ModuleStatus::Consumer(s) => {
                flags.set(StatusFlags::BUFFER_OVERRUN, s.overrun);
                flags.set(StatusFlags::UNDERRUN, s.underrun);
                flags.set(StatusFlags::ENABLED, s.enabled);
                StatusRecord {
                    fifo_count: s.fifo_count,
                    buffer_count: s.buffer_count,
                    flags,
                    state: 0,
                }
            }
            ModuleStatus::Producer(s) => {
                flags.set(StatusFlags::BUFFER_OVERRUN, s.overrun);
                StatusRecord {
                    fifo_count: s.fifo_count,
                    buffer_count: s.buffer_count,
                    flags,
                    state: s.capture_state.to_u8(),
                }
            }
            ModuleStatus::Timer(s) => {
                flags.set(StatusFlags::BUFFER_OVERRUN, s.overrun);
                StatusRecord {
                    fifo_count: 0,
                    buffer_count: s.buffer_count,
                    flags,
                    state: 0,
                }
            }
        }
    }

    pub fn shape(&self) -> StatusShape {
        match self {
            ModuleStatus::Pes(_) => StatusShape::Pes,
            ModuleStatus::Consumer(_) => StatusShape::Consumer,
            ModuleStatus::Producer(_) => StatusShape::Producer,
            ModuleStatus::Timer(_) => StatusShape::Timer,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shape().capabilities()
    }

    /// FIFO occupancy, 0 for shapes without a FIFO.
    pub fn fifo_count(&self) -> u16 {
        match self {
            ModuleStatus::Pes(s) => s.fifo_count,
            ModuleStatus::Consumer(s) => s.fifo_count,
            ModuleStatus::Producer(s) => s.fifo_count,
            ModuleStatus::Timer(_) => 0,
        }
    }

    pub fn buffer_count(&self) -> u16 {
        match self {
            ModuleStatus::Pes(s) => s.buffer_count,
            ModuleStatus::Consumer(s) => s.buffer_count,
            ModuleStatus::Producer(s) => s.buffer_count,
            ModuleStatus::Timer(s) => s.buffer_count,
        }
    }

    pub fn overrun(&self) -> bool {
        match self {
            ModuleStatus::Pes(s) => s.overrun,
            ModuleStatus::Consumer(s) => s.overrun,
            ModuleStatus::Producer(s) => s.overrun,
            ModuleStatus::Timer(s) => s.overrun,
        }
    }

    /// Underrun that counts as an error. The PES underrun is not one.
    pub fn underrun(&self) -> bool {
        match self {
            ModuleStatus::Consumer(s) => s.underrun,
            _ => false,
        }
    }

    /// Counts and overrun all zero.
    pub fn is_clean(&self) -> bool {
        self.fifo_count() == 0 && self.buffer_count() == 0 && !self.overrun()
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Pes(s) => write!(
                f,
                "fifo={} buffer={} overrun={} underrun={} soft_reset={} bad_opcode={}",
                s.fifo_count, s.buffer_count, s.overrun, s.underrun, s.soft_reset, s.bad_opcode
            ),
            ModuleStatus::Consumer(s) => write!(
                f,
                "fifo={} buffer={} overrun={} underrun={} enabled={}",
                s.fifo_count, s.buffer_count, s.overrun, s.underrun, s.enabled
            ),
            ModuleStatus::Producer(s) => write!(
                f,
                "fifo={} buffer={} overrun={} capture={:?}",
                s.fifo_count, s.buffer_count, s.overrun, s.capture_state
            ),
            ModuleStatus::Timer(s) => {
                write!(f, "buffer={} overrun={}", s.buffer_count, s.overrun)
            }
        }
    }
}

/// Sequencer global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SequencerState {
    #[default]
    Idle,
    ResetDone,
    InitDone,
    Running,
    Error,
}

impl SequencerState {
    pub fn from_u8(value: u8) -> ProtocolResult<Self> {
        match value {
            0 => Ok(Self::Idle),
            1 => Ok(Self::ResetDone),
            2 => Ok(Self::InitDone),
            3 => Ok(Self::Running),
            4 => Ok(Self::Error),
            other => Err(ProtocolError::InvalidValue {
                what: "sequencer state",
                value: u32::from(other),
            }),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::ResetDone => 1,
            Self::InitDone => 2,
            Self::Running => 3,
            Self::Error => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::ResetDone => "RESET_DONE",
            Self::InitDone => "INIT_DONE",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One module record inside the aggregated sequencer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    pub msg_id: u8,
    /// Timer index for the timers module, 0 otherwise.
    pub sub: u8,
    pub record: StatusRecord,
}

const ENTRY_LEN: usize = 2 + STATUS_RECORD_LEN;

/// Aggregated sequencer status: global state plus every module's record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequencerStatus {
    pub state: SequencerState,
    pub entries: Vec<StatusEntry>,
}

impl SequencerStatus {
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let count = u8::try_from(self.entries.len())
            .ok()
            .ok_or(ProtocolError::PayloadTooLong(self.entries.len()))?;
        let mut out = Vec::with_capacity(2 + self.entries.len() * ENTRY_LEN);
        out.push(self.state.to_u8());
        out.push(count);
        for entry in &self.entries {
            out.push(entry.msg_id);
            out.push(entry.sub);
            out.extend_from_slice(&entry.record.encode());
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let [state, count, rest @ ..] = buf else {
            return Err(ProtocolError::Truncated {
                expected: 2,
                actual: buf.len(),
            });
        };
        let count = usize::from(*count);
        let expected = count * ENTRY_LEN;
        if rest.len() < expected {
            return Err(ProtocolError::Truncated {
                expected: 2 + expected,
                actual: buf.len(),
            });
        }
        let mut entries = Vec::with_capacity(count);
        for chunk in rest.chunks_exact(ENTRY_LEN).take(count) {
            if let [msg_id, sub, record @ ..] = chunk {
                entries.push(StatusEntry {
                    msg_id: *msg_id,
                    sub: *sub,
                    record: StatusRecord::decode(record)?,
                });
            }
        }
        Ok(Self {
            state: SequencerState::from_u8(*state)?,
            entries,
        })
    }

    /// Record of module `msg_id` (and timer `sub`).
    pub fn entry(&self, msg_id: u8, sub: u8) -> Option<&StatusRecord> {
        self.entries
            .iter()
            .find(|e| e.msg_id == msg_id && e.sub == sub)
            .map(|e| &e.record)
    }
}

/// Decode the timers reply: [`TIMER_COUNT`] consecutive records.
pub fn decode_timer_records(buf: &[u8]) -> ProtocolResult<[StatusRecord; TIMER_COUNT]> {
    ProtocolError::check_len(buf, TIMER_COUNT * STATUS_RECORD_LEN)?;
    let mut records = [StatusRecord::default(); TIMER_COUNT];
    for (record, chunk) in records.iter_mut().zip(buf.chunks_exact(STATUS_RECORD_LEN)) {
        *record = StatusRecord::decode(chunk)?;
    }
    Ok(records)
}

/// Encode the timers reply.
pub fn encode_timer_records(records: &[StatusRecord; TIMER_COUNT]) -> Vec<u8> {
    records.iter().flat_map(StatusRecord::encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = StatusRecord {
            fifo_count: 0x0102,
            buffer_count: 0x0304,
            flags: StatusFlags::SOFT_RESET | StatusFlags::UNDERRUN,
            state: 1,
        };
        assert_eq!(
            record.encode(),
            [0x02, 0x01, 0x04, 0x03, 0x0C, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_pes_underrun_not_an_error() {
        let record = StatusRecord {
            flags: StatusFlags::UNDERRUN,
            ..StatusRecord::default()
        };
        let status = ModuleStatus::from_record(StatusShape::Pes, &record);
        assert!(!status.underrun());
        assert!(status.is_clean());

        let status = ModuleStatus::from_record(StatusShape::Consumer, &record);
        assert!(status.underrun());
    }

    #[test]
    fn test_timer_has_no_fifo() {
        let record = StatusRecord {
            fifo_count: 9,
            ..StatusRecord::default()
        };
        let status = ModuleStatus::from_record(StatusShape::Timer, &record);
        assert_eq!(status.fifo_count(), 0);
        assert!(!status.capabilities().contains(Capabilities::FIFO));
    }

    #[test]
    fn test_either_overrun_flag_counts() {
        for flag in [StatusFlags::FIFO_OVERRUN, StatusFlags::BUFFER_OVERRUN] {
            let record = StatusRecord {
                flags: flag,
                ..StatusRecord::default()
            };
            assert!(ModuleStatus::from_record(StatusShape::Producer, &record).overrun());
        }
    }

    #[test]
    fn test_sequencer_status_decode() -> Result<(), Box<dyn std::error::Error>> {
        let status = SequencerStatus {
            state: SequencerState::Running,
            entries: vec![StatusEntry {
                msg_id: 0x02,
                sub: 0,
                record: StatusRecord {
                    fifo_count: 4,
                    ..StatusRecord::default()
                },
            }],
        };
        let bytes = status.encode()?;
        assert_eq!(bytes.len(), 12);
        assert_eq!(SequencerStatus::decode(&bytes)?, status);
        Ok(())
    }

    #[test]
    fn test_sequencer_status_truncated() {
        assert!(matches!(
            SequencerStatus::decode(&[0x00, 0x01, 0x02]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_state() {
        assert!(matches!(
            SequencerStatus::decode(&[0x09, 0x00]),
            Err(ProtocolError::InvalidValue { .. })
        ));
    }
}
