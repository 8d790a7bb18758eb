//! Configuration and Device Tree construction errors.

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid {
        /// Offending field path
        field: String,
        /// Reason
        reason: String,
    },

    /// Configuration file could not be read
    #[error("Failed to read {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// I/O error description
        message: String,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse {path}: {message}")]
    Parse {
        /// File path
        path: String,
        /// Parser error description
        message: String,
    },

    /// Two modules share the same canonical name
    #[error("Duplicate module name: {0}")]
    DuplicateName(String),

    /// Module message id outside the dynamic range
    #[error("Module {module} uses message id {msg_id:#04x} outside [{min:#04x}, {max:#04x}]")]
    MsgIdOutOfRange {
        /// Module canonical name
        module: String,
        /// Requested message id
        msg_id: u8,
        /// Dynamic range start
        min: u8,
        /// Dynamic range end
        max: u8,
    },

    /// Required module absent from the tree
    #[error("Required module missing: {0}")]
    MissingModule(String),

    /// No free event bit left
    #[error("No free {kind} event bit (capacity {capacity})")]
    EventSpaceExhausted {
        /// Event kind: action or resume
        kind: String,
        /// Bits available
        capacity: u32,
    },
}

impl ConfigError {
    /// Create a validation error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
