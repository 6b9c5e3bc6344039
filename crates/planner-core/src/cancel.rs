use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PlannerError, PlannerResult};

/// Caller-owned abort flag, checked by long-running computations between
/// batches of independent work.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Fails with `PlannerError::Cancelled` once `cancel` has been called.
    pub fn check(&self) -> PlannerResult<()> {
        if self.is_cancelled() {
            Err(PlannerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
