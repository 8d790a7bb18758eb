//! Error types for the Kosmos orchestration core.
//!
//! Every fallible operation of the core returns a [`KosmosError`]. The enum
//! wraps one sub-error per failure domain:
//!
//! - [`transport`]: framing, timeout and flow-control failures on the FPGA link
//! - [`domain`]: invalid arguments rejected at append time, never sent to the FPGA
//! - [`buffer`]: local instruction buffer overflow
//! - [`sequencer`]: state-machine violations, with a structured [`StatusReport`]
//! - [`fatal`]: the asynchronous global-error line
//! - [`config`]: configuration and Device Tree construction errors
//!
//! Test cases are expected to catch only two of them: a sequencer timeout
//! (see [`KosmosError::is_timeout`]) and [`DomainError`]. Both report
//! [`KosmosError::is_recoverable`] as `true`; everything else aborts the run.
//!
//! # Example
//!
//! ```
//! use kosmos_errors::prelude::*;
//!
//! fn check_bank(bank: u8) -> KosmosResult<u8> {
//!     if bank > 1 {
//!         return Err(DomainError::out_of_range("bank", bank, 0, 1).into());
//!     }
//!     Ok(bank)
//! }
//!
//! assert!(check_bank(2).is_err_and(|e| e.is_recoverable()));
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod buffer;
pub mod common;
pub mod config;
pub mod domain;
pub mod fatal;
pub mod prelude;
pub mod sequencer;
pub mod transport;

pub use buffer::BufferError;
pub use common::{ErrorCategory, ErrorSeverity, KosmosError};
pub use config::ConfigError;
pub use domain::DomainError;
pub use fatal::FatalHardwareError;
pub use sequencer::{ModuleCounters, SequencerError, SequencerErrorKind, StatusReport};
pub use transport::TransportError;

/// A specialized `Result` type for Kosmos operations.
pub type KosmosResult<T> = std::result::Result<T, KosmosError>;
