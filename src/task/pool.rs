//! Convenience for launching a batch of requests and waiting on all of
//! them.

use crate::error::{PoolError, RequestError};
use crate::task::Request;

/// A batch of requests submitted together and awaited as a unit.
///
/// Results are discarded; the pool reports only the first error
/// encountered, in insertion order. Useful for block prefetches and other
/// side-effecting fan-outs.
pub struct RequestPool<T> {
    requests: Vec<Request<T>>,
    started: bool,
}

impl<T: Clone + Send + 'static> RequestPool<T> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            started: false,
        }
    }

    /// Adds a request to the batch.
    ///
    /// # Errors
    ///
    /// Fails with [`PoolError::AlreadyStarted`] once the pool has been
    /// submitted.
    pub fn add(&mut self, request: Request<T>) -> Result<(), PoolError> {
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        self.requests.push(request);
        Ok(())
    }

    /// Number of requests in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True if no requests were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Submits every request in the batch. Idempotent.
    pub fn submit_all(&mut self) {
        self.started = true;
        for request in &self.requests {
            request.submit();
        }
    }

    /// Submits the batch and blocks the calling foreign thread until every
    /// request completes.
    ///
    /// All requests are driven to completion even after an error is seen,
    /// so the batch leaves no work in flight. Returns the first error in
    /// insertion order.
    ///
    /// # Errors
    ///
    /// The first [`RequestError`] produced by any request in the batch.
    pub fn wait_all(&mut self) -> Result<(), RequestError> {
        self.submit_all();
        let mut first_error = None;
        for request in &self.requests {
            if let Err(error) = request.wait() {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Submits the batch and waits for every request from within another
    /// request, suspending instead of blocking.
    ///
    /// # Errors
    ///
    /// The first [`RequestError`] produced by any request in the batch.
    pub async fn join_all(&mut self) -> Result<(), RequestError> {
        self.submit_all();
        let mut first_error = None;
        for request in &self.requests {
            if let Err(error) = request.join().await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

impl<T: Clone + Send + 'static> Default for RequestPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn wait_all_runs_every_request() {
        let scheduler = Scheduler::builder().num_workers(2).build();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = RequestPool::new();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.add(Request::new(&scheduler, async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.wait_all().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        scheduler.shutdown();
    }

    #[test]
    fn add_after_start_is_rejected() {
        let scheduler = Scheduler::builder().num_workers(1).build();
        let mut pool = RequestPool::new();
        pool.add(Request::new(&scheduler, async { Ok(()) })).unwrap();
        pool.submit_all();
        let late = Request::new(&scheduler, async { Ok(()) });
        assert!(matches!(pool.add(late), Err(PoolError::AlreadyStarted)));
        scheduler.shutdown();
    }

    #[test]
    fn wait_all_surfaces_first_error_after_draining() {
        let scheduler = Scheduler::builder().num_workers(2).build();
        let completed = Arc::new(AtomicUsize::new(0));
        let mut pool = RequestPool::new();
        let tally = Arc::clone(&completed);
        pool.add(Request::new(&scheduler, async move {
            tally.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
        pool.add(Request::new(&scheduler, async {
            Err(RequestError::failed(std::io::Error::other("block 3 fetch")))
        }))
        .unwrap();
        let tally = Arc::clone(&completed);
        pool.add(Request::new(&scheduler, async move {
            tally.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        let error = pool.wait_all().unwrap_err();
        assert!(matches!(error, RequestError::Failed(_)));
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        scheduler.shutdown();
    }
}
