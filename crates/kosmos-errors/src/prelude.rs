//! Convenience re-exports for error handling.
//!
//! ```
//! use kosmos_errors::prelude::*;
//!
//! fn upload(count: usize) -> KosmosResult<()> {
//!     if count > 4 {
//!         return Err(BufferError::overflow("PES", 4, count).into());
//!     }
//!     Ok(())
//! }
//! # assert!(upload(5).is_err());
//! ```

pub use crate::{
    KosmosResult,
    buffer::BufferError,
    common::{ErrorCategory, ErrorSeverity, KosmosError},
    config::ConfigError,
    domain::DomainError,
    fatal::FatalHardwareError,
    sequencer::{ModuleCounters, SequencerError, SequencerErrorKind, StatusReport},
    transport::TransportError,
};
