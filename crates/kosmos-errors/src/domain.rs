//! Argument validation errors raised when appending instructions.

/// Invalid argument at append time.
///
/// These never reach the FPGA; the offending instruction is not buffered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Numeric value outside its allowed range
    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Name of the offending field
        field: String,
        /// Actual value
        value: i64,
        /// Inclusive minimum
        min: i64,
        /// Inclusive maximum
        max: i64,
    },

    /// Key name not present in the layout
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Module does not support the requested action
    #[error("{module} does not support {action}")]
    UnsupportedAction {
        /// Module canonical name
        module: String,
        /// Requested action
        action: String,
    },

    /// Other malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Optional module not instantiated in the Device Tree
    #[error("Module not present in the device tree: {0}")]
    MissingModule(String),

    /// More PES EXECUTE actions target a module than it has commit instructions buffered
    #[error(
        "PES program triggers {module} {executes} time(s) but only {commits} commit instruction(s) are buffered"
    )]
    ProgramOrder {
        /// Module canonical name
        module: String,
        /// EXECUTE instructions targeting the module
        executes: usize,
        /// Commit instructions buffered in the module
        commits: usize,
    },
}

impl DomainError {
    /// Create an out-of-range error.
    pub fn out_of_range(
        field: impl Into<String>,
        value: impl Into<i64>,
        min: impl Into<i64>,
        max: impl Into<i64>,
    ) -> Self {
        DomainError::OutOfRange {
            field: field.into(),
            value: value.into(),
            min: min.into(),
            max: max.into(),
        }
    }

    /// Create an unknown key error.
    pub fn unknown_key(key: impl Into<String>) -> Self {
        DomainError::UnknownKey(key.into())
    }

    /// Create an unsupported action error.
    pub fn unsupported_action(module: impl Into<String>, action: impl Into<String>) -> Self {
        DomainError::UnsupportedAction {
            module: module.into(),
            action: action.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        DomainError::InvalidArgument(reason.into())
    }

    /// Check that `value` lies within `[min, max]`.
    pub fn check_range(field: &str, value: i64, min: i64, max: i64) -> Result<(), Self> {
        if value < min || value > max {
            return Err(Self::out_of_range(field, value, min, max));
        }
        Ok(())
    }
}
