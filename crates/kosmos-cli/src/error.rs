//! Error types for kosmosctl

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] kosmos_errors::ConfigError),

    #[error("Instrument unreachable at {address}: {message}")]
    Unreachable { address: String, message: String },

    #[error("Module not fitted: {0}")]
    ModuleNotFitted(String),

    #[error("Run failed: {0}")]
    RunFailed(#[from] kosmos_errors::KosmosError),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::ModuleNotFitted(_) => 2,
            CliError::InvalidConfiguration(_) => 4,
            CliError::Unreachable { .. } => 5,
            CliError::RunFailed(e) if e.is_recoverable() => 6,
            CliError::RunFailed(_) => 7,
        }
    }
}
