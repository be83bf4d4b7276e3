//! Exclusive claim on a run.

use crate::errors::ContractViolation;
use std::sync::atomic::{AtomicBool, Ordering};

/// Holds a run's `active` flag for the lifetime of the guard.
///
/// Claiming is a single compare-and-swap, so two callers can never both
/// observe the flag as free. The flag is released on drop, including when
/// the owning future is dropped or unwinds.
#[derive(Debug)]
pub(crate) struct ActiveGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ActiveGuard<'a> {
    /// Claims the flag or reports a reentrant call.
    pub(crate) fn claim(flag: &'a AtomicBool, run: &str) -> Result<Self, ContractViolation> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self { flag })
            .map_err(|_| ContractViolation::Reentrant {
                run: run.to_string(),
            })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
