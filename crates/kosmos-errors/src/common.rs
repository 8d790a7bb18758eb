//! Top-level error type and its classification.

use core::fmt;

use crate::{
    BufferError, ConfigError, DomainError, FatalHardwareError, SequencerError, TransportError,
};

/// Top-level error type of the Kosmos core.
#[derive(Debug, thiserror::Error)]
pub enum KosmosError {
    /// FPGA link errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid argument at append time
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Local buffer errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Sequencer state-machine errors, including timeouts
    #[error("Sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    /// Global-error line raised during a run
    #[error("Fatal hardware error: {0}")]
    FatalHardware(#[from] FatalHardwareError),

    /// Configuration and Device Tree construction errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KosmosError {
    /// Get the error category for classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            KosmosError::Transport(_) => ErrorCategory::Transport,
            KosmosError::Domain(_) => ErrorCategory::Domain,
            KosmosError::Buffer(_) => ErrorCategory::Buffer,
            KosmosError::Sequencer(_) => ErrorCategory::Sequencer,
            KosmosError::FatalHardware(_) => ErrorCategory::Hardware,
            KosmosError::Config(_) => ErrorCategory::Config,
        }
    }

    /// Get the error severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            KosmosError::Transport(e) => e.severity(),
            KosmosError::Domain(_) => ErrorSeverity::Warning,
            KosmosError::Buffer(_) => ErrorSeverity::Error,
            KosmosError::Sequencer(e) => e.severity(),
            KosmosError::FatalHardware(_) => ErrorSeverity::Critical,
            KosmosError::Config(_) => ErrorSeverity::Error,
        }
    }

    /// Whether a test case may catch this error and carry on.
    ///
    /// Only sequencer timeouts and domain errors qualify.
    pub fn is_recoverable(&self) -> bool {
        self.severity() < ErrorSeverity::Error
    }

    /// Whether this is a sequencer timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, KosmosError::Sequencer(e) if e.is_timeout())
    }

    /// Borrow the sequencer error, if any.
    pub fn as_sequencer(&self) -> Option<&SequencerError> {
        match self {
            KosmosError::Sequencer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KosmosError {
    fn from(e: std::io::Error) -> Self {
        KosmosError::Transport(TransportError::from(e))
    }
}

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    /// FPGA link errors
    Transport = 0,
    /// Argument validation errors
    Domain = 1,
    /// Local buffer errors
    Buffer = 2,
    /// Sequencer errors
    Sequencer = 3,
    /// Asynchronous hardware faults
    Hardware = 4,
    /// Configuration errors
    Config = 5,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transport => write!(f, "Transport"),
            ErrorCategory::Domain => write!(f, "Domain"),
            ErrorCategory::Buffer => write!(f, "Buffer"),
            ErrorCategory::Sequencer => write!(f, "Sequencer"),
            ErrorCategory::Hardware => write!(f, "Hardware"),
            ErrorCategory::Config => write!(f, "Config"),
        }
    }
}

/// Error severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorSeverity {
    /// Informational, no action required
    Info = 0,
    /// Warning, the caller may retry or continue
    Warning = 1,
    /// Error, the current test must abort
    Error = 2,
    /// Critical, a full hardware reset is required
    Critical = 3,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARN"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SequencerErrorKind, StatusReport};

    #[test]
    fn test_category_mapping() {
        let err: KosmosError = DomainError::unknown_key("F13").into();
        assert_eq!(err.category(), ErrorCategory::Domain);

        let err: KosmosError = BufferError::overflow("PES", 4, 5).into();
        assert_eq!(err.category(), ErrorCategory::Buffer);

        let err: KosmosError = FatalHardwareError::GlobalErrorRaised.into();
        assert_eq!(err.category(), ErrorCategory::Hardware);
    }

    #[test]
    fn test_only_timeout_and_domain_are_recoverable() {
        let timeout: KosmosError = SequencerError::new(
            SequencerErrorKind::Timeout { timeout_ms: 1000 },
            StatusReport::new("RUNNING"),
        )
        .into();
        assert!(timeout.is_recoverable());
        assert!(timeout.is_timeout());

        let fault: KosmosError =
            SequencerError::new(SequencerErrorKind::HardwareFault, StatusReport::new("ERROR"))
                .into();
        assert!(!fault.is_recoverable());
        assert!(!fault.is_timeout());

        let domain: KosmosError = DomainError::invalid_argument("empty key list").into();
        assert!(domain.is_recoverable());

        let transport: KosmosError = TransportError::framing("bad sync byte").into();
        assert!(!transport.is_recoverable());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Warning < ErrorSeverity::Error);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err: KosmosError = io.into();
        assert!(matches!(
            err,
            KosmosError::Transport(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_display_prefix() {
        let err: KosmosError = DomainError::unknown_key("F13").into();
        assert!(err.to_string().starts_with("Domain error:"));
    }
}
