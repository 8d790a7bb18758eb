//! Sequencer state-machine errors.
//!
//! Every sequencer error carries a [`StatusReport`]: a snapshot of the
//! aggregated FPGA status taken when the error was detected, so that a
//! failing test log shows the module counters without a second round trip.

use core::fmt;

use crate::common::ErrorSeverity;

/// Per-module counters included in a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleCounters {
    /// Module canonical name
    pub name: String,
    /// Entries in the FPGA FIFO
    pub fifo_count: u16,
    /// Entries in the FPGA buffer
    pub buffer_count: u16,
    /// Overrun flag
    pub overrun: bool,
    /// Underrun flag
    pub underrun: bool,
}

impl fmt::Display for ModuleCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: fifo={} buffer={}",
            self.name, self.fifo_count, self.buffer_count
        )?;
        if self.overrun {
            write!(f, " OVERRUN")?;
        }
        if self.underrun {
            write!(f, " UNDERRUN")?;
        }
        Ok(())
    }
}

/// Snapshot of the FPGA status attached to a sequencer error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReport {
    /// Sequencer state name
    pub state: String,
    /// Per-module counters
    pub modules: Vec<ModuleCounters>,
    /// Raw status payload
    pub raw: Vec<u8>,
}

impl StatusReport {
    /// Create a report holding only the sequencer state.
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            modules: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// Attach module counters.
    pub fn with_modules(mut self, modules: Vec<ModuleCounters>) -> Self {
        self.modules = modules;
        self
    }

    /// Attach the raw payload.
    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = raw;
        self
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequencer state: {}", self.state)?;
        for module in &self.modules {
            write!(f, "\n  {module}")?;
        }
        if !self.raw.is_empty() {
            write!(f, "\n  raw:")?;
            for byte in &self.raw {
                write!(f, " {byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// What went wrong in the sequencer state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerErrorKind {
    /// Modules still hold data before a run
    NotClean,
    /// A step left the sequencer in the wrong state
    UnexpectedState {
        /// Step name
        step: String,
        /// Expected state name
        expected: String,
        /// Observed state name
        actual: String,
    },
    /// Module status validation failed
    InvalidStatus {
        /// One message per failed check
        errors: Vec<String>,
    },
    /// The sequencer reported ERROR
    HardwareFault,
    /// The sequence ended in an unexpected way
    EndOfSequence,
    /// The sequence did not finish in time
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
    /// Invalid run parameters
    InvalidArguments(String),
}

impl fmt::Display for SequencerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerErrorKind::NotClean => write!(f, "Modules are not clean before run"),
            SequencerErrorKind::UnexpectedState {
                step,
                expected,
                actual,
            } => write!(f, "{step}: expected state {expected}, got {actual}"),
            SequencerErrorKind::InvalidStatus { errors } => {
                write!(f, "Invalid module status")?;
                for error in errors {
                    write!(f, "\n  - {error}")?;
                }
                Ok(())
            }
            SequencerErrorKind::HardwareFault => write!(f, "Sequencer reported ERROR"),
            SequencerErrorKind::EndOfSequence => write!(f, "Unexpected end of sequence"),
            SequencerErrorKind::Timeout { timeout_ms } => {
                write!(f, "Sequence did not finish within {timeout_ms} ms")
            }
            SequencerErrorKind::InvalidArguments(reason) => {
                write!(f, "Invalid arguments: {reason}")
            }
        }
    }
}

/// Sequencer error with its status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}\n{report}")]
pub struct SequencerError {
    /// Failure kind
    pub kind: SequencerErrorKind,
    /// Status snapshot
    pub report: StatusReport,
}

impl SequencerError {
    /// Create a sequencer error.
    pub fn new(kind: SequencerErrorKind, report: StatusReport) -> Self {
        Self { kind, report }
    }

    /// Whether the sequence timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, SequencerErrorKind::Timeout { .. })
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind {
            SequencerErrorKind::Timeout { .. } => ErrorSeverity::Warning,
            SequencerErrorKind::HardwareFault => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let report = StatusReport::new("RUNNING")
            .with_modules(vec![ModuleCounters {
                name: "PES".to_string(),
                fifo_count: 3,
                buffer_count: 7,
                overrun: false,
                underrun: true,
            }])
            .with_raw(vec![0x03, 0x00]);
        assert_eq!(
            report.to_string(),
            "Sequencer state: RUNNING\n  PES: fifo=3 buffer=7 UNDERRUN\n  raw: 03 00"
        );
    }

    #[test]
    fn test_invalid_status_lists_every_error() {
        let err = SequencerError::new(
            SequencerErrorKind::InvalidStatus {
                errors: vec!["PES: bad opcode".to_string(), "LED_SPY: overrun".to_string()],
            },
            StatusReport::new("IDLE"),
        );
        let text = err.to_string();
        assert!(text.contains("  - PES: bad opcode"));
        assert!(text.contains("  - LED_SPY: overrun"));
        assert!(text.ends_with("Sequencer state: IDLE"));
    }

    #[test]
    fn test_severity() {
        let timeout = SequencerError::new(
            SequencerErrorKind::Timeout { timeout_ms: 10 },
            StatusReport::default(),
        );
        assert_eq!(timeout.severity(), ErrorSeverity::Warning);
        let fault = SequencerError::new(SequencerErrorKind::HardwareFault, StatusReport::default());
        assert_eq!(fault.severity(), ErrorSeverity::Critical);
    }
}
