//! Local instruction buffer errors.

/// Errors of the host-side instruction buffers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// Appending would reach the FPGA buffer capacity
    #[error("{module} buffer overflow: {requested} entries requested, capacity {capacity}")]
    Overflow {
        /// Module canonical name
        module: String,
        /// FPGA buffer size in entries
        capacity: usize,
        /// Local buffer length after the append
        requested: usize,
    },

    /// Capture download returned fewer or more entries than announced
    #[error("{module} download mismatch: expected {expected} entries, got {actual}")]
    DownloadMismatch {
        /// Module canonical name
        module: String,
        /// Entries announced by the status
        expected: usize,
        /// Entries actually received
        actual: usize,
    },
}

impl BufferError {
    /// Create an overflow error.
    pub fn overflow(module: impl Into<String>, capacity: usize, requested: usize) -> Self {
        BufferError::Overflow {
            module: module.into(),
            capacity,
            requested,
        }
    }

    /// Create a download mismatch error.
    pub fn download_mismatch(module: impl Into<String>, expected: usize, actual: usize) -> Self {
        BufferError::DownloadMismatch {
            module: module.into(),
            expected,
            actual,
        }
    }
}
