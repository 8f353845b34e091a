//! Error types for the request scheduler and the blockwise cache.
//!
//! The taxonomy is small and deliberate:
//!
//! - [`RequestError::Cancelled`] is raised *inside* a cancelled request at
//!   its own suspension points. Handle it by cleaning up and returning; it
//!   is swallowed at the task boundary and never reaches the scheduler as a
//!   failure.
//! - [`RequestError::InvalidRequest`] is raised when waiting on a request
//!   that was already cancelled by someone else. The waiter must restart
//!   the computation itself.
//! - [`RequestError::Failed`] carries the original workload error, shared
//!   via `Arc` so it re-raises in every current and future waiter.
//!
//! Cache errors wrap request errors unchanged: an upstream compute failure
//! surfaces to every reader of the affected block, never swallowed.

use std::sync::Arc;
use thiserror::Error;

use crate::roi::Roi;

/// A shareable workload error.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by [`Request`](crate::task::Request) operations.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The current request was cancelled.
    ///
    /// Raised at a suspension point of the request observing it. Clean up
    /// and return; propagating with `?` is always correct.
    #[error("request cancelled")]
    Cancelled,

    /// Waited on a request that was already cancelled elsewhere.
    ///
    /// The computation must be restarted by the caller.
    #[error("waited on a request that was cancelled elsewhere")]
    InvalidRequest,

    /// A request waited on itself before finishing.
    #[error("request waited on itself")]
    CircularWait,

    /// The request workload failed.
    #[error("request workload failed: {0}")]
    Failed(#[source] SharedError),
}

impl RequestError {
    /// Wraps an arbitrary workload error.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(err))
    }

    /// Wraps an already-boxed workload error.
    #[must_use]
    pub fn failed_boxed(err: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self::Failed(Arc::from(err))
    }

    /// True if this is a cancellation (of either flavor).
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::InvalidRequest)
    }
}

/// Errors surfaced by [`ArrayCache`](crate::cache::ArrayCache) operations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The requested region falls outside the cached shape.
    #[error("region {roi} out of bounds for shape {shape:?}")]
    OutOfBounds {
        /// The offending region.
        roi: Roi,
        /// The cache's full shape.
        shape: Vec<usize>,
    },

    /// A buffer shape did not match the region it was written to, or an
    /// upstream tile came back with the wrong shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape implied by the region.
        expected: Vec<usize>,
        /// Shape actually supplied.
        actual: Vec<usize>,
    },

    /// A fetch request failed or was cancelled; the original error is
    /// preserved inside.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Errors from [`RequestPool`](crate::task::RequestPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Requests cannot be added to a pool that has already been submitted.
    #[error("request pool already started")]
    AlreadyStarted,
}
