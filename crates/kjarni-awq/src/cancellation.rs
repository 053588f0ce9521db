//! Cooperative cancellation between blocks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{AwqError, AwqResult};

/// A token the pipeline polls at block boundaries.
///
/// A block's transitions are never interrupted: the token is only consulted
/// after one block has been evicted and before the next becomes resident.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a new token together with the handle that triggers it.
    ///
    /// ```ignore
    /// let (token, handle) = CancellationToken::new();
    /// let pipeline = AwqPipeline::new(model, config)?.with_cancellation(token);
    /// // from another thread
    /// handle.cancel();
    /// ```
    pub fn new() -> (Self, CancellationHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = CancellationToken {
            cancelled: cancelled.clone(),
        };
        (token, CancellationHandle { cancelled })
    }

    /// Creates a token that is never cancelled.
    pub fn never() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Cancelled` if a stop was requested, carrying how many blocks
    /// finished before the boundary.
    pub fn check_boundary(&self, completed_blocks: usize) -> AwqResult<()> {
        if self.is_cancelled() {
            Err(AwqError::Cancelled { completed_blocks })
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::never()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Triggers cancellation for every clone of the paired token.
#[derive(Clone, Debug)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}
