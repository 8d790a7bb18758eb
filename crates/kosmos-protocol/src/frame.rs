//! Link framing.
//!
//! Every frame on the byte stream has the layout:
//!
//! ```text
//! [0xA5 sync][kind:8][body][crc32:32 LE over kind+body]
//! kind 0x01 control : id:8 cmd:8 len:8 payload[len]
//! kind 0x02 bulk    : id:8 count:16 LE instructions[count * inst_width]
//! kind 0x03 bulk-ack: id:8 code:8
//! ```
//!
//! The bulk body length depends on the instruction width of the target
//! module, so decoding takes a width lookup (usually the frozen
//! [`MessageTable`](crate::table::MessageTable)).

use crate::error::{ProtocolError, ProtocolResult};

/// Sync byte opening every frame.
pub const SYNC: u8 = 0xA5;

/// Frame kind bytes.
pub mod kind {
    /// Control request or reply.
    pub const CONTROL: u8 = 0x01;
    /// Bulk instruction upload.
    pub const BULK: u8 = 0x02;
    /// Bulk acknowledgement.
    pub const BULK_ACK: u8 = 0x03;
}

/// Largest control payload.
pub const MAX_CONTROL_PAYLOAD: usize = u8::MAX as usize;

/// Largest bulk instruction count.
pub const MAX_BULK_COUNT: usize = u16::MAX as usize;

const CRC_LEN: usize = 4;
const HEADER_LEN: usize = 2;

/// A decoded link frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Control message: request from the host or reply from the FPGA.
    Control {
        msg_id: u8,
        cmd_id: u8,
        payload: Vec<u8>,
    },
    /// Bulk instruction stream, host to FPGA only.
    Bulk { msg_id: u8, count: u16, data: Vec<u8> },
    /// Bulk acknowledgement; a non-zero code is a flow-control rejection.
    BulkAck { msg_id: u8, code: u8 },
}

impl Frame {
    /// Build a control frame.
    pub fn control(msg_id: u8, cmd_id: u8, payload: &[u8]) -> ProtocolResult<Self> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }
        Ok(Frame::Control {
            msg_id,
            cmd_id,
            payload: payload.to_vec(),
        })
    }

    /// Build a bulk frame from 32-bit instruction words.
    pub fn bulk_words(msg_id: u8, words: &[u32]) -> ProtocolResult<Self> {
        let count = u16::try_from(words.len())
            .ok()
            .ok_or(ProtocolError::PayloadTooLong(words.len()))?;
        let data = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        Ok(Frame::Bulk {
            msg_id,
            count,
            data,
        })
    }

    /// Message id carried by the frame.
    pub fn msg_id(&self) -> u8 {
        match self {
            Frame::Control { msg_id, .. }
            | Frame::Bulk { msg_id, .. }
            | Frame::BulkAck { msg_id, .. } => *msg_id,
        }
    }

    /// Encode the frame, including sync byte and CRC.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.body_len() + HEADER_LEN + CRC_LEN);
        out.push(SYNC);
        match self {
            Frame::Control {
                msg_id,
                cmd_id,
                payload,
            } => {
                let len = u8::try_from(payload.len())
                    .ok()
                    .ok_or(ProtocolError::PayloadTooLong(payload.len()))?;
                out.extend_from_slice(&[kind::CONTROL, *msg_id, *cmd_id, len]);
                out.extend_from_slice(payload);
            }
            Frame::Bulk {
                msg_id,
                count,
                data,
            } => {
                out.extend_from_slice(&[kind::BULK, *msg_id]);
                out.extend_from_slice(&count.to_le_bytes());
                out.extend_from_slice(data);
            }
            Frame::BulkAck { msg_id, code } => {
                out.extend_from_slice(&[kind::BULK_ACK, *msg_id, *code]);
            }
        }
        let crc = crc32fast::hash(out.get(1..).unwrap_or_default());
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Control { payload, .. } => 3 + payload.len(),
            Frame::Bulk { data, .. } => 3 + data.len(),
            Frame::BulkAck { .. } => 2,
        }
    }
}

/// Incremental frame decoder for a byte stream.
///
/// Bytes are pushed as they arrive; [`FrameDecoder::next_frame`] returns
/// `Ok(None)` until a complete frame is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered, e.g. after a framing error.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Decode the next complete frame, if any.
    ///
    /// `bulk_width` maps a message id to its instruction width in bytes.
    pub fn next_frame(
        &mut self,
        bulk_width: impl Fn(u8) -> Option<usize>,
    ) -> ProtocolResult<Option<Frame>> {
        let Some(total) = frame_len(&self.buf, bulk_width)? else {
            return Ok(None);
        };
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame_bytes: Vec<u8> = self.buf.drain(..total).collect();
        decode_complete(&frame_bytes).map(Some)
    }
}

/// Total length of the frame starting at `buf[0]`, once enough header bytes are known.
fn frame_len(
    buf: &[u8],
    bulk_width: impl Fn(u8) -> Option<usize>,
) -> ProtocolResult<Option<usize>> {
    let Some(&sync) = buf.first() else {
        return Ok(None);
    };
    if sync != SYNC {
        return Err(ProtocolError::BadSync(sync));
    }
    let Some(&frame_kind) = buf.get(1) else {
        return Ok(None);
    };
    let body = match frame_kind {
        kind::CONTROL => match buf.get(4) {
            Some(&len) => 3 + usize::from(len),
            None => return Ok(None),
        },
        kind::BULK => match (buf.get(2), buf.get(3), buf.get(4)) {
            (Some(&msg_id), Some(&lo), Some(&hi)) => {
                let width = bulk_width(msg_id).ok_or(ProtocolError::UnknownMessage {
                    msg_id,
                    cmd_id: 0,
                })?;
                3 + usize::from(u16::from_le_bytes([lo, hi])) * width
            }
            _ => return Ok(None),
        },
        kind::BULK_ACK => 2,
        other => return Err(ProtocolError::UnknownFrameKind(other)),
    };
    Ok(Some(HEADER_LEN + body + CRC_LEN))
}

/// Decode one complete frame, validating the CRC.
pub fn decode_complete(bytes: &[u8]) -> ProtocolResult<Frame> {
    ProtocolError::check_len(bytes, HEADER_LEN + 2 + CRC_LEN)?;
    let crc_start = bytes.len() - CRC_LEN;
    let (covered, crc_bytes) = bytes.split_at(crc_start);
    let actual = crc32fast::hash(covered.get(1..).unwrap_or_default());
    let expected = u32::from_le_bytes([
        crc_bytes.first().copied().unwrap_or_default(),
        crc_bytes.get(1).copied().unwrap_or_default(),
        crc_bytes.get(2).copied().unwrap_or_default(),
        crc_bytes.get(3).copied().unwrap_or_default(),
    ]);
    if actual != expected {
        return Err(ProtocolError::CrcMismatch { expected, actual });
    }

    match covered {
        [SYNC, kind::CONTROL, msg_id, cmd_id, len, payload @ ..] => {
            if payload.len() != usize::from(*len) {
                return Err(ProtocolError::Truncated {
                    expected: usize::from(*len),
                    actual: payload.len(),
                });
            }
            Ok(Frame::Control {
                msg_id: *msg_id,
                cmd_id: *cmd_id,
                payload: payload.to_vec(),
            })
        }
        [SYNC, kind::BULK, msg_id, lo, hi, data @ ..] => Ok(Frame::Bulk {
            msg_id: *msg_id,
            count: u16::from_le_bytes([*lo, *hi]),
            data: data.to_vec(),
        }),
        [SYNC, kind::BULK_ACK, msg_id, code] => Ok(Frame::BulkAck {
            msg_id: *msg_id,
            code: *code,
        }),
        [SYNC, other, ..] => Err(ProtocolError::UnknownFrameKind(*other)),
        [sync, ..] => Err(ProtocolError::BadSync(*sync)),
        [] => Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            actual: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn width4(_: u8) -> Option<usize> {
        Some(4)
    }

    #[test]
    fn test_control_layout() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = Frame::control(0x02, 0x01, &[])?.encode()?;
        assert_eq!(bytes.get(..5), Some(&[0xA5, 0x01, 0x02, 0x01, 0x00][..]));
        assert_eq!(bytes.len(), 9);
        Ok(())
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = Frame::bulk_words(0x02, &[0x1000_0001, 0x8001_9000])?.encode()?;
        let (head, tail) = bytes.split_at(6);
        let mut decoder = FrameDecoder::new();
        decoder.push(head);
        assert_eq!(decoder.next_frame(width4)?, None);
        decoder.push(tail);
        let frame = decoder.next_frame(width4)?;
        assert!(matches!(frame, Some(Frame::Bulk { msg_id: 0x02, count: 2, .. })));
        assert_eq!(decoder.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_crc_mismatch_detected() -> Result<(), Box<dyn std::error::Error>> {
        let mut bytes = Frame::BulkAck {
            msg_id: 0x02,
            code: 0,
        }
        .encode()?;
        if let Some(b) = bytes.get_mut(3) {
            *b ^= 0xFF;
        }
        assert!(matches!(
            decode_complete(&bytes),
            Err(ProtocolError::CrcMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_bad_sync() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x00, 0x01]);
        assert_eq!(decoder.next_frame(width4), Err(ProtocolError::BadSync(0x00)));
    }

    #[test]
    fn test_unknown_bulk_width() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[SYNC, kind::BULK, 0x33, 0x01, 0x00]);
        assert!(matches!(
            decoder.next_frame(|_| None),
            Err(ProtocolError::UnknownMessage { msg_id: 0x33, .. })
        ));
    }

    #[test]
    fn test_payload_too_long() {
        let payload = vec![0u8; 256];
        assert_eq!(
            Frame::control(0x01, 0x01, &payload),
            Err(ProtocolError::PayloadTooLong(256))
        );
    }
}
