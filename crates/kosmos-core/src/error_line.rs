//! Hardware global-error line.
//!
//! The FPGA drives a global-error line that rises asynchronously when a
//! module faults. `play_sequence` holds an [`ErrorLineGuard`] for the whole
//! run: the guard checks the line is low, subscribes a flag the line sets
//! when it rises, and unsubscribes on drop, on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kosmos_errors::FatalHardwareError;
use tracing::{debug, error};

/// Source of the global-error signal.
pub trait ErrorLine: Send + Sync {
    /// Current level of the line.
    fn is_high(&self) -> bool;

    /// Set `flag` when the line rises, until [`ErrorLine::unsubscribe`].
    fn subscribe(&self, flag: Arc<AtomicBool>);

    fn unsubscribe(&self);
}

/// Line of an instrument without global-error wiring. Never rises.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullErrorLine;

impl ErrorLine for NullErrorLine {
    fn is_high(&self) -> bool {
        false
    }

    fn subscribe(&self, _flag: Arc<AtomicBool>) {}

    fn unsubscribe(&self) {}
}

/// Subscription to the error line, held for the duration of a run.
pub struct ErrorLineGuard<'a> {
    line: &'a dyn ErrorLine,
    raised: Arc<AtomicBool>,
}

impl<'a> ErrorLineGuard<'a> {
    /// Subscribe to `line`.
    ///
    /// # Errors
    ///
    /// Returns [`FatalHardwareError::GlobalErrorAlreadyHigh`] when the line
    /// is high before the run starts.
    pub fn install(line: &'a dyn ErrorLine) -> Result<Self, FatalHardwareError> {
        if line.is_high() {
            error!("global error line is high before the run");
            return Err(FatalHardwareError::GlobalErrorAlreadyHigh);
        }
        let raised = Arc::new(AtomicBool::new(false));
        line.subscribe(Arc::clone(&raised));
        debug!("global error handler installed");
        Ok(Self { line, raised })
    }

    /// Whether the line rose since the guard was installed.
    pub fn raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Fail if the line rose.
    pub fn check(&self) -> Result<(), FatalHardwareError> {
        if self.raised() {
            error!("global error line raised during the run");
            return Err(FatalHardwareError::GlobalErrorRaised);
        }
        Ok(())
    }
}

impl Drop for ErrorLineGuard<'_> {
    fn drop(&mut self) {
        self.line.unsubscribe();
        debug!("global error handler removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TestLine {
        high: AtomicBool,
        flag: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl TestLine {
        fn raise(&self) {
            self.high.store(true, Ordering::Release);
            if let Some(flag) = self.flag.lock().as_ref() {
                flag.store(true, Ordering::Release);
            }
        }
    }

    impl ErrorLine for TestLine {
        fn is_high(&self) -> bool {
            self.high.load(Ordering::Acquire)
        }

        fn subscribe(&self, flag: Arc<AtomicBool>) {
            *self.flag.lock() = Some(flag);
        }

        fn unsubscribe(&self) {
            *self.flag.lock() = None;
        }
    }

    #[test]
    fn test_guard_sees_rising_line() -> Result<(), Box<dyn std::error::Error>> {
        let line = TestLine::default();
        {
            let guard = ErrorLineGuard::install(&line)?;
            guard.check()?;
            line.raise();
            assert_eq!(guard.check(), Err(FatalHardwareError::GlobalErrorRaised));
        }
        assert!(line.flag.lock().is_none());
        assert!(matches!(
            ErrorLineGuard::install(&line),
            Err(FatalHardwareError::GlobalErrorAlreadyHigh)
        ));
        Ok(())
    }
}
