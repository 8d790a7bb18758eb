//! Global-error line faults.

/// Asynchronous hardware fault signalled on the global-error line.
///
/// These abort the current test and require a full hardware reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FatalHardwareError {
    /// The FPGA raised the global-error line during a run
    #[error("FPGA raised the global error line")]
    GlobalErrorRaised,

    /// The line was already high when a run started
    #[error("Global error line already high before the run")]
    GlobalErrorAlreadyHigh,
}
