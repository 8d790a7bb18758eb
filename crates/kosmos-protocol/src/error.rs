//! Protocol codec errors.

use kosmos_errors::{DomainError, KosmosError, TransportError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{field} = {value} does not fit [{min}, {max}]")]
    FieldOutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Bad sync byte: {0:#04x}")]
    BadSync(u8),

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Unknown message {msg_id:#04x}:{cmd_id:#04x}")]
    UnknownMessage { msg_id: u8, cmd_id: u8 },

    #[error("Payload too long: {0} bytes")]
    PayloadTooLong(usize),

    #[error("Invalid {what} value: {value:#x}")]
    InvalidValue { what: &'static str, value: u32 },

    #[error("Program needs more than {limit} instructions")]
    ProgramTooLong { limit: usize },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    pub(crate) fn out_of_range(
        field: &'static str,
        value: impl Into<i64>,
        min: impl Into<i64>,
        max: impl Into<i64>,
    ) -> Self {
        ProtocolError::FieldOutOfRange {
            field,
            value: value.into(),
            min: min.into(),
            max: max.into(),
        }
    }

    pub(crate) fn check_len(buf: &[u8], expected: usize) -> ProtocolResult<()> {
        if buf.len() < expected {
            return Err(ProtocolError::Truncated {
                expected,
                actual: buf.len(),
            });
        }
        Ok(())
    }
}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnknownMessage { msg_id, cmd_id } => TransportError::UnknownMessage {
                module_id: msg_id,
                cmd_id,
            },
            other => TransportError::framing(other.to_string()),
        }
    }
}

impl From<ProtocolError> for KosmosError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::FieldOutOfRange {
                field,
                value,
                min,
                max,
            } => DomainError::out_of_range(field, value, min, max).into(),
            ProtocolError::ProgramTooLong { limit } => {
                DomainError::invalid_argument(ProtocolError::ProgramTooLong { limit }.to_string())
                    .into()
            }
            other => TransportError::from(other).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_error_maps_to_domain() {
        let err: KosmosError = ProtocolError::out_of_range("bank", 2u8, 0u8, 1u8).into();
        assert!(matches!(err, KosmosError::Domain(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_framing_errors_map_to_transport() {
        let err: KosmosError = ProtocolError::BadSync(0x00).into();
        assert!(matches!(
            err,
            KosmosError::Transport(TransportError::Framing { .. })
        ));

        let err: KosmosError = ProtocolError::UnknownMessage {
            msg_id: 0x12,
            cmd_id: 0x01,
        }
        .into();
        assert!(matches!(
            err,
            KosmosError::Transport(TransportError::UnknownMessage { .. })
        ));
    }

    #[test]
    fn test_program_too_long_maps_to_domain() {
        let err: KosmosError = ProtocolError::ProgramTooLong { limit: 4 }.into();
        assert!(matches!(err, KosmosError::Domain(_)));
    }

    #[test]
    fn test_check_len() {
        assert_eq!(
            ProtocolError::check_len(&[0u8; 3], 4),
            Err(ProtocolError::Truncated {
                expected: 4,
                actual: 3
            })
        );
        assert_eq!(ProtocolError::check_len(&[0u8; 4], 4), Ok(()));
    }
}
