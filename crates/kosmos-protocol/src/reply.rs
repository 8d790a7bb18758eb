//! Control reply payloads.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{ReturnCode, msg_id};
use crate::status::{
    ModuleStatus, SequencerStatus, StatusRecord, StatusShape, TIMER_COUNT, decode_timer_records,
    encode_timer_records,
};
use crate::table::ReplyKind;

/// A decoded control reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Sequencer(SequencerStatus),
    Module(ModuleStatus),
    Timers([ModuleStatus; TIMER_COUNT]),
    /// Raw entries read from a producer or timer, little endian.
    Entries(Vec<u64>),
}

impl Reply {
    /// Decode `payload` according to its reply class.
    pub fn decode(kind: ReplyKind, payload: &[u8]) -> ProtocolResult<Self> {
        match kind {
            ReplyKind::SequencerStatus => SequencerStatus::decode(payload).map(Reply::Sequencer),
            ReplyKind::ModuleStatus(shape) => {
                let record = StatusRecord::decode(payload)?;
                Ok(Reply::Module(ModuleStatus::from_record(shape, &record)))
            }
            ReplyKind::TimerStatus => {
                let records = decode_timer_records(payload)?;
                Ok(Reply::Timers(records.map(|r| {
                    ModuleStatus::from_record(StatusShape::Timer, &r)
                })))
            }
            ReplyKind::Entries { width } => decode_entries(width, payload).map(Reply::Entries),
        }
    }

    /// Encode the reply payload.
    pub fn encode(&self, kind: ReplyKind) -> ProtocolResult<Vec<u8>> {
        match (self, kind) {
            (Reply::Sequencer(status), ReplyKind::SequencerStatus) => status.encode(),
            (Reply::Module(status), ReplyKind::ModuleStatus(_)) => {
                Ok(status.to_record().encode().to_vec())
            }
            (Reply::Timers(statuses), ReplyKind::TimerStatus) => {
                Ok(encode_timer_records(&statuses.map(|s| s.to_record())))
            }
            (Reply::Entries(entries), ReplyKind::Entries { width }) => {
                encode_entries(width, entries)
            }
            _ => Err(ProtocolError::InvalidValue {
                what: "reply class",
                value: 0,
            }),
        }
    }
}

fn decode_entries(width: usize, payload: &[u8]) -> ProtocolResult<Vec<u64>> {
    if !(1..=8).contains(&width) {
        return Err(ProtocolError::InvalidValue {
            what: "entry width",
            value: u32::try_from(width).unwrap_or(u32::MAX),
        });
    }
    let [count, data @ ..] = payload else {
        return Err(ProtocolError::Truncated {
            expected: 1,
            actual: 0,
        });
    };
    let count = usize::from(*count);
    ProtocolError::check_len(data, count * width)?;
    Ok(data
        .chunks_exact(width)
        .take(count)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            for (dst, src) in bytes.iter_mut().zip(chunk) {
                *dst = *src;
            }
            u64::from_le_bytes(bytes)
        })
        .collect())
}

fn encode_entries(width: usize, entries: &[u64]) -> ProtocolResult<Vec<u8>> {
    let count = u8::try_from(entries.len())
        .ok()
        .ok_or(ProtocolError::PayloadTooLong(entries.len()))?;
    let mut out = Vec::with_capacity(1 + entries.len() * width);
    out.push(count);
    for entry in entries {
        out.extend(entry.to_le_bytes().into_iter().take(width));
    }
    Ok(out)
}

/// Transport-level return code reply, sent on [`msg_id::STATUS`].
///
/// Payload: `req_msg_id:8, req_cmd_id:8, code:8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCodeReply {
    pub msg_id: u8,
    pub cmd_id: u8,
    pub code: u8,
}

impl ReturnCodeReply {
    pub const MSG_ID: u8 = msg_id::STATUS;

    pub fn new(msg_id: u8, cmd_id: u8, code: ReturnCode) -> Self {
        Self {
            msg_id,
            cmd_id,
            code: code.to_u8(),
        }
    }

    pub fn encode(&self) -> [u8; 3] {
        [self.msg_id, self.cmd_id, self.code]
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        match payload {
            [msg_id, cmd_id, code, ..] => Ok(Self {
                msg_id: *msg_id,
                cmd_id: *cmd_id,
                code: *code,
            }),
            _ => Err(ProtocolError::Truncated {
                expected: 3,
                actual: payload.len(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ReturnCode::Success.to_u8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CaptureState, ProducerStatus};

    #[test]
    fn test_entries_width4() -> Result<(), Box<dyn std::error::Error>> {
        let payload = [2, 0x01, 0x00, 0x00, 0x80, 0xFF, 0xFF, 0xFF, 0x00];
        let reply = Reply::decode(ReplyKind::Entries { width: 4 }, &payload)?;
        assert_eq!(reply, Reply::Entries(vec![0x8000_0001, 0x00FF_FFFF]));
        Ok(())
    }

    #[test]
    fn test_entries_count_exceeds_payload() {
        let payload = [3, 0x01, 0x00, 0x00, 0x80];
        assert!(matches!(
            Reply::decode(ReplyKind::Entries { width: 4 }, &payload),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_module_reply() -> Result<(), Box<dyn std::error::Error>> {
        let status = ModuleStatus::Producer(ProducerStatus {
            fifo_count: 1,
            buffer_count: 2,
            overrun: false,
            capture_state: CaptureState::Started,
        });
        let kind = ReplyKind::ModuleStatus(StatusShape::Producer);
        let bytes = Reply::Module(status).encode(kind)?;
        assert_eq!(Reply::decode(kind, &bytes)?, Reply::Module(status));
        Ok(())
    }

    #[test]
    fn test_return_code_reply() -> Result<(), Box<dyn std::error::Error>> {
        let reply = ReturnCodeReply::decode(&[0x02, 0x09, 0x02])?;
        assert!(!reply.is_success());
        assert_eq!(reply.code, ReturnCode::UnknownMsgCmd.to_u8());
        Ok(())
    }
}
