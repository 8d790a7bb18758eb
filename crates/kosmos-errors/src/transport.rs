//! FPGA link errors.

use crate::common::ErrorSeverity;

/// Errors raised while exchanging frames with the FPGA.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No complete reply within the link timeout
    #[error("Timed out waiting for {operation}")]
    Timeout {
        /// What the transport was waiting for
        operation: String,
    },

    /// Malformed frame: bad sync byte, truncated frame, checksum mismatch
    #[error("Framing error: {reason}")]
    Framing {
        /// Description of the framing failure
        reason: String,
    },

    /// Bulk upload rejected by the FPGA flow control
    #[error("Bulk upload to module {module_id:#04x} rejected (code {code:#04x})")]
    FlowControl {
        /// Target module message id
        module_id: u8,
        /// Rejection code from the bulk acknowledgement
        code: u8,
    },

    /// The FPGA answered with a non-success return code
    #[error("Request {module_id:#04x}:{cmd_id:#04x} failed with return code {code:#04x}:{name}")]
    ReturnCode {
        /// Request message id
        module_id: u8,
        /// Request command id
        cmd_id: u8,
        /// Return code
        code: u8,
        /// Return code name
        name: String,
    },

    /// Reply does not match the request
    #[error(
        "Unexpected reply {got_id:#04x}:{got_cmd:#04x} to request {module_id:#04x}:{cmd_id:#04x}"
    )]
    UnexpectedReply {
        /// Request message id
        module_id: u8,
        /// Request command id
        cmd_id: u8,
        /// Reply message id
        got_id: u8,
        /// Reply command id, including the reply flag
        got_cmd: u8,
    },

    /// No reply class registered for this request
    #[error("No reply class registered for {module_id:#04x}:{cmd_id:#04x}")]
    UnknownMessage {
        /// Request message id
        module_id: u8,
        /// Request command id
        cmd_id: u8,
    },

    /// The byte stream was closed
    #[error("Link closed")]
    Closed,

    /// Other I/O failures
    #[error("I/O error: {message}")]
    Io {
        /// I/O error description
        message: String,
    },
}

impl TransportError {
    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        TransportError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a framing error.
    pub fn framing(reason: impl Into<String>) -> Self {
        TransportError::Framing {
            reason: reason.into(),
        }
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransportError::Timeout { .. } => ErrorSeverity::Error,
            TransportError::Framing { .. } => ErrorSeverity::Error,
            TransportError::FlowControl { .. } => ErrorSeverity::Error,
            TransportError::ReturnCode { .. } => ErrorSeverity::Error,
            TransportError::UnexpectedReply { .. } => ErrorSeverity::Error,
            TransportError::UnknownMessage { .. } => ErrorSeverity::Error,
            TransportError::Closed => ErrorSeverity::Critical,
            TransportError::Io { .. } => ErrorSeverity::Error,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::Framing { .. }
                | TransportError::FlowControl { .. }
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::timeout(e.to_string())
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => TransportError::Closed,
            _ => TransportError::Io {
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kind_mapping() {
        let e = std::io::Error::new(std::io::ErrorKind::WouldBlock, "nothing yet");
        assert!(matches!(
            TransportError::from(e),
            TransportError::Timeout { .. }
        ));

        let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(TransportError::from(e), TransportError::Closed);

        let e = std::io::Error::other("boom");
        assert!(matches!(TransportError::from(e), TransportError::Io { .. }));
    }

    #[test]
    fn test_retryable() {
        assert!(TransportError::timeout("status reply").is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }

    #[test]
    fn test_return_code_display() {
        let err = TransportError::ReturnCode {
            module_id: 0x02,
            cmd_id: 0x01,
            code: 0x02,
            name: "UNKNOWN_MSG_CMD".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request 0x02:0x01 failed with return code 0x02:UNKNOWN_MSG_CMD"
        );
    }
}
