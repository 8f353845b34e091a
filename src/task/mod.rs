//! Requests: cancellable, waitable units of deferred computation.
//!
//! A [`Request`] wraps a future producing a single result. It is created
//! unstarted, and runs either on the [`Scheduler`]'s worker pool (after
//! [`Request::submit`]) or inline in the context that first waits for it —
//! the "direct execute" fast path that avoids scheduling overhead for the
//! common case of a dependency waited on before anyone else touched it.
//!
//! Two waiting modes, one contract:
//!
//! - A **foreign thread** (any thread not driving a request) calls
//!   [`Request::wait`], which physically blocks. It first marks the request
//!   uncancellable, so a computation a real thread depends on can never be
//!   cancelled out from under it.
//! - A **request** waits by awaiting [`Request::join`], which suspends the
//!   waiting request instead of blocking its worker thread. Cancellation of
//!   the *waiting* request is checked immediately before suspending and
//!   immediately after waking, surfacing as [`RequestError::Cancelled`].
//!
//! Cancellation is cooperative and flows strictly downward: a request may
//! only become cancelled when nothing uncancellable depends on it, and the
//! mark then cascades into every child request it spawned.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::{Condvar, Mutex};

use crate::error::RequestError;
use crate::scheduler::Scheduler;

mod pool;

pub use pool::RequestPool;

/// A type-erased request body as stored in the scheduler table.
pub(crate) type BoxBody = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Nesting limit for the direct-execute fast path.
///
/// Each adopted body adds a frame to the carrier's poll stack, so a deep
/// chain of never-started dependencies would otherwise recurse without
/// bound. Beyond this depth the dependency is submitted to the pool
/// instead, trading the fast path for a bounded stack.
const MAX_INLINE_DEPTH: usize = 32;

thread_local! {
    /// Stack of requests executing on this thread. The top entry is the
    /// current request; entries below it are requests whose bodies adopted
    /// the ones above (direct execute).
    static CURRENT: RefCell<Vec<Arc<RequestCore>>> = const { RefCell::new(Vec::new()) };
}

/// The request the calling context is executing, if any.
pub(crate) fn current_request() -> Option<Arc<RequestCore>> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Pushes `core` as the current request until the guard drops.
pub(crate) fn push_current(core: Arc<RequestCore>) -> CurrentGuard {
    CURRENT.with(|stack| stack.borrow_mut().push(core));
    CurrentGuard
}

fn current_depth() -> usize {
    CURRENT.with(|stack| stack.borrow().len())
}

pub(crate) struct CurrentGuard;

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Untyped per-request state: lifecycle flags, relationships, and the
/// completion event foreign threads block on.
///
/// Flag order matters: `execution_complete` is set strictly after the
/// result, failure, and `cancelled` have their final values, so the
/// lock-free fast paths in `wait`/`join` are sound.
pub(crate) struct RequestCore {
    started: AtomicBool,
    cancelled: AtomicBool,
    uncancellable: AtomicBool,
    finished: AtomicBool,
    execution_complete: AtomicBool,
    links: Mutex<Links>,
    completed: Mutex<bool>,
    completed_cv: Condvar,
    scheduler: Scheduler,
}

#[derive(Default)]
struct Links {
    /// The request that spawned this one.
    parent: Option<Weak<RequestCore>>,
    /// Requests spawned from within this one. Drained on cancellation.
    children: Vec<Arc<RequestCore>>,
    /// Requests currently waiting on this one (cancellation rule 3).
    pending: Vec<Arc<RequestCore>>,
    /// Wakers of suspended waiters, drained exactly once at completion.
    waiters: Vec<Waker>,
}

impl RequestCore {
    fn new(scheduler: Scheduler) -> Self {
        Self {
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            uncancellable: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            execution_complete: AtomicBool::new(false),
            links: Mutex::new(Links::default()),
            completed: Mutex::new(false),
            completed_cv: Condvar::new(),
            scheduler,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_execution_complete(&self) -> bool {
        self.execution_complete.load(Ordering::Acquire)
    }

    /// Atomically claims the right to start this request. Exactly one
    /// caller wins; everyone else sees the request as already started.
    fn claim_started(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_uncancellable(&self) {
        self.uncancellable.store(true, Ordering::Release);
    }

    /// Registers a waker to be fired at completion. Returns false if the
    /// request already completed (the caller must not suspend).
    fn register_waiter(&self, waker: &Waker) -> bool {
        let mut links = self.links.lock();
        if self.is_execution_complete() {
            return false;
        }
        links.waiters.push(waker.clone());
        true
    }

    fn add_pending(self: &Arc<Self>, waiter: &Arc<RequestCore>) {
        self.links.lock().pending.push(Arc::clone(waiter));
    }

    fn remove_pending(self: &Arc<Self>, waiter: &Arc<RequestCore>) {
        self.links
            .lock()
            .pending
            .retain(|p| !Arc::ptr_eq(p, waiter));
    }

    /// Marks cancelled if permitted, then cascades into children.
    ///
    /// Permitted only when no foreign thread waits on this request, the
    /// parent (if any) is already cancelled, and every request pending on
    /// this one is cancelled. Holding the links lock while storing the
    /// flag guarantees children spawned concurrently either land in the
    /// drained list or inherit the cancelled mark at construction.
    fn cancel_request(&self) {
        let (parent, pending) = {
            let links = self.links.lock();
            (links.parent.clone(), links.pending.clone())
        };
        if self.uncancellable.load(Ordering::Acquire) {
            return;
        }
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            if !parent.is_cancelled() {
                return;
            }
        }
        if !pending.iter().all(|p| p.is_cancelled()) {
            return;
        }

        let children = {
            let mut links = self.links.lock();
            if self.uncancellable.load(Ordering::Acquire) {
                return;
            }
            self.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut links.children)
        };
        tracing::trace!(children = children.len(), "request cancelled");
        for child in children {
            child.cancel_request();
        }
    }

    /// Blocks the calling thread until the request completes.
    fn block_until_complete(&self) {
        let mut completed = self.completed.lock();
        while !*completed {
            self.completed_cv.wait(&mut completed);
        }
    }
}

enum Terminal {
    Finished,
    Cancelled,
    Failed,
}

type FinishedCallback<T> = Box<dyn FnOnce(&T) + Send>;
type CancelledCallback = Box<dyn FnOnce() + Send>;
type FailedCallback = Box<dyn FnOnce(&RequestError) + Send>;

struct Callbacks<T> {
    finished: Vec<FinishedCallback<T>>,
    cancelled: Vec<CancelledCallback>,
    failed: Vec<FailedCallback>,
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self {
            finished: Vec::new(),
            cancelled: Vec::new(),
            failed: Vec::new(),
        }
    }
}

struct Shared<T> {
    core: Arc<RequestCore>,
    /// The workload, present until claimed by submit/direct-execute.
    body: Mutex<Option<BoxBody>>,
    /// Write-once result slot, populated before `execution_complete`.
    outcome: Mutex<Option<Result<T, RequestError>>>,
    callbacks: Mutex<Callbacks<T>>,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn take_body(&self) -> Option<BoxBody> {
        self.body.lock().take()
    }

    /// Runs the terminal transition exactly once: store the outcome, fire
    /// the matching callbacks, then publish completion to every waiter.
    ///
    /// The flip of `finished`, the outcome store, and the callback drain
    /// share one critical section on the callbacks lock, so a concurrent
    /// `notify_*` registration either lands in the drained list or sees
    /// the outcome fully published.
    fn complete(&self, outcome: Result<T, RequestError>) {
        let (terminal, drained) = {
            let mut callbacks = self.callbacks.lock();
            if self.core.finished.swap(true, Ordering::AcqRel) {
                return;
            }
            let terminal = match &outcome {
                Ok(_) => Terminal::Finished,
                Err(RequestError::Cancelled) => {
                    // A cancellation observed inside the body confirms the
                    // cancelled mark; it is not a failure.
                    self.core.cancelled.store(true, Ordering::Release);
                    Terminal::Cancelled
                }
                Err(_) => Terminal::Failed,
            };
            *self.outcome.lock() = Some(outcome);
            (terminal, std::mem::take(&mut *callbacks))
        };
        match terminal {
            Terminal::Finished => {
                let value = match self.outcome.lock().as_ref() {
                    Some(Ok(value)) => value.clone(),
                    _ => unreachable!("finished request has a value"),
                };
                for callback in drained.finished {
                    callback(&value);
                }
            }
            Terminal::Cancelled => {
                for callback in drained.cancelled {
                    callback();
                }
            }
            Terminal::Failed => {
                let error = match self.outcome.lock().as_ref() {
                    Some(Err(error)) => error.clone(),
                    _ => unreachable!("failed request has an error"),
                };
                for callback in drained.failed {
                    callback(&error);
                }
            }
        }

        self.core.execution_complete.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut self.core.links.lock().waiters);
        for waker in waiters {
            waker.wake();
        }
        {
            let mut completed = self.core.completed.lock();
            *completed = true;
        }
        self.core.completed_cv.notify_all();
    }

    /// The result as seen by a waiter, after `execution_complete`.
    fn waiter_outcome(&self) -> Result<T, RequestError> {
        if self.core.is_cancelled() {
            return Err(RequestError::InvalidRequest);
        }
        match self.outcome.lock().as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(error)) => Err(error.clone()),
            None => unreachable!("completed request has an outcome"),
        }
    }
}

/// A handle to a deferred, cancellable computation with a single result.
///
/// Handles are cheap to clone and share one underlying request.
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("started", &self.shared.core.started.load(Ordering::Relaxed))
            .field(
                "cancelled",
                &self.shared.core.cancelled.load(Ordering::Relaxed),
            )
            .field(
                "complete",
                &self.shared.core.is_execution_complete(),
            )
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Request<T> {
    /// Creates an unstarted request for `body` on the given scheduler.
    ///
    /// When called from within a running request, the new request becomes
    /// a child of it and inherits its cancellation state.
    pub fn new<F>(scheduler: &Scheduler, body: F) -> Self
    where
        F: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let core = Arc::new(RequestCore::new(scheduler.clone()));
        if let Some(parent) = current_request() {
            let mut parent_links = parent.links.lock();
            parent_links.children.push(Arc::clone(&core));
            // Same critical section as the cancel cascade: we either join
            // the drained child list or inherit the mark here.
            core.cancelled
                .store(parent.is_cancelled(), Ordering::Release);
            drop(parent_links);
            core.links.lock().parent = Some(Arc::downgrade(&parent));
        }

        let shared = Arc::new(Shared {
            core,
            body: Mutex::new(None),
            outcome: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
        });
        let wrapped: BoxBody = Box::pin({
            let shared = Arc::clone(&shared);
            async move {
                // Cancelled before it ever ran: skip the workload.
                let outcome = if shared.core.is_cancelled() {
                    Err(RequestError::Cancelled)
                } else {
                    body.await
                };
                shared.complete(outcome);
            }
        });
        *shared.body.lock() = Some(wrapped);
        Self { shared }
    }

    /// Schedules the request if it has not started yet. Idempotent.
    pub fn submit(&self) {
        if self.shared.core.claim_started() {
            let body = self
                .shared
                .take_body()
                .expect("unstarted request holds its body");
            self.shared
                .core
                .scheduler
                .schedule(Arc::clone(&self.shared.core), body);
        }
    }

    /// Blocks the calling foreign thread until the request completes and
    /// returns its result, re-raising a stored failure.
    ///
    /// Marks the request uncancellable first: a computation a real thread
    /// is blocked on must run to completion. If the request has not
    /// started, it is executed directly on the calling thread instead of
    /// being scheduled.
    ///
    /// # Panics
    ///
    /// Panics when called from within a request; use [`Request::join`]
    /// there.
    pub fn wait(&self) -> Result<T, RequestError> {
        assert!(
            current_request().is_none(),
            "Request::wait() called from within a request; await join() instead"
        );
        if self.shared.core.is_execution_complete() {
            return self.shared.waiter_outcome();
        }
        self.shared.core.set_uncancellable();
        if self.shared.core.claim_started() {
            let body = self
                .shared
                .take_body()
                .expect("unstarted request holds its body");
            block_on(body);
        } else {
            self.shared.core.block_until_complete();
        }
        self.shared.waiter_outcome()
    }

    /// Waits for the request from within another request.
    ///
    /// This is a suspension point: the current request's cancellation flag
    /// is checked before suspending and after waking, surfacing as
    /// [`RequestError::Cancelled`]. Waiting on a request cancelled
    /// elsewhere yields [`RequestError::InvalidRequest`]. If the target
    /// has not started, its body is adopted and polled inline.
    pub fn join(&self) -> JoinFuture<'_, T> {
        JoinFuture {
            request: self,
            state: JoinState::Init,
        }
    }

    /// Registers a callback fired exactly once with the result when the
    /// request finishes successfully — immediately if it already has.
    ///
    /// Also submits the request, so this doubles as fire-and-forget
    /// scheduling.
    pub fn notify_finished<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let fire_now = {
            let mut callbacks = self.shared.callbacks.lock();
            if self.shared.core.finished.load(Ordering::Acquire) {
                Some(callback)
            } else {
                callbacks.finished.push(Box::new(callback));
                None
            }
        };
        if let Some(callback) = fire_now {
            let value = match self.shared.outcome.lock().as_ref() {
                Some(Ok(value)) => Some(value.clone()),
                _ => None,
            };
            if let Some(value) = value {
                callback(&value);
            }
        } else {
            self.submit();
        }
    }

    /// Registers a callback fired exactly once if the request terminates
    /// cancelled — immediately if it already has.
    pub fn notify_cancelled<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fire_now = {
            let mut callbacks = self.shared.callbacks.lock();
            if self.shared.core.finished.load(Ordering::Acquire) {
                if self.shared.core.is_cancelled() {
                    Some(callback)
                } else {
                    None
                }
            } else {
                callbacks.cancelled.push(Box::new(callback));
                None
            }
        };
        if let Some(callback) = fire_now {
            callback();
        }
    }

    /// Registers a callback fired exactly once with the error if the
    /// request fails — immediately if it already has.
    pub fn notify_failed<F>(&self, callback: F)
    where
        F: FnOnce(&RequestError) + Send + 'static,
    {
        let fire_now = {
            let mut callbacks = self.shared.callbacks.lock();
            if self.shared.core.finished.load(Ordering::Acquire) {
                if self.shared.core.is_cancelled() {
                    None
                } else {
                    Some(callback)
                }
            } else {
                callbacks.failed.push(Box::new(callback));
                None
            }
        };
        if let Some(callback) = fire_now {
            let error = match self.shared.outcome.lock().as_ref() {
                Some(Err(error)) => Some(error.clone()),
                _ => None,
            };
            if let Some(error) = error {
                callback(&error);
            }
        }
    }

    /// Requests cooperative cancellation.
    ///
    /// Takes effect only if no foreign thread is blocked on this request,
    /// its parent (if any) is cancelled or absent, and every request
    /// waiting on it is cancelled; the mark then cascades into all child
    /// requests. A running request observes the mark at its next
    /// suspension point.
    pub fn cancel(&self) {
        self.shared.core.cancel_request();
    }

    /// True once the request reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.core.is_execution_complete()
    }

    /// True if the request carries the cancelled mark.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.core.is_cancelled()
    }
}

enum JoinState {
    Init,
    /// Suspended with a waker registered on the target.
    Waiting,
    /// The target's body was adopted and is polled inline.
    Inline(BoxBody),
    Done,
}

/// Future returned by [`Request::join`].
pub struct JoinFuture<'a, T: Clone + Send + 'static> {
    request: &'a Request<T>,
    state: JoinState,
}

/// Records the waits-on edge used by the cancellation rules.
fn link_waiter(target: &Arc<RequestCore>, current: Option<&Arc<RequestCore>>) {
    match current {
        Some(current) => target.add_pending(current),
        // A foreign context (top-level block_on) is waiting: the target
        // must not be cancelled out from under it.
        None => target.set_uncancellable(),
    }
}

fn unlink_waiter(target: &Arc<RequestCore>, current: Option<&Arc<RequestCore>>) {
    if let Some(current) = current {
        target.remove_pending(current);
    }
}

impl<T: Clone + Send + 'static> Future for JoinFuture<'_, T> {
    type Output = Result<T, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let current = current_request();
        loop {
            let target = Arc::clone(&this.request.shared);
            match std::mem::replace(&mut this.state, JoinState::Done) {
                JoinState::Init => {
                    if let Some(current) = &current {
                        if current.is_cancelled() {
                            return Poll::Ready(Err(RequestError::Cancelled));
                        }
                        if Arc::ptr_eq(current, &target.core) {
                            // Waiting on self is only legal once finished
                            // (e.g. from inside a completion callback).
                            return Poll::Ready(if target.core.is_execution_complete() {
                                target.waiter_outcome()
                            } else {
                                Err(RequestError::CircularWait)
                            });
                        }
                    }
                    if target.core.is_execution_complete() {
                        return Poll::Ready(target.waiter_outcome());
                    }
                    if target.core.is_cancelled() {
                        // Cancelled by someone else before completing:
                        // the waiter must restart the work itself.
                        return Poll::Ready(Err(RequestError::InvalidRequest));
                    }
                    if current_depth() < MAX_INLINE_DEPTH && target.core.claim_started() {
                        // Direct execute: adopt the body instead of
                        // scheduling a separate task.
                        let body = target
                            .take_body()
                            .expect("unstarted request holds its body");
                        link_waiter(&target.core, current.as_ref());
                        this.state = JoinState::Inline(body);
                        continue;
                    }
                    this.request.submit();
                    if target.core.register_waiter(cx.waker()) {
                        link_waiter(&target.core, current.as_ref());
                        this.state = JoinState::Waiting;
                        return Poll::Pending;
                    }
                    // Completed between the check above and registration.
                    return Poll::Ready(target.waiter_outcome());
                }
                JoinState::Waiting => {
                    if let Some(current) = &current {
                        if current.is_cancelled() {
                            unlink_waiter(&target.core, Some(current));
                            return Poll::Ready(Err(RequestError::Cancelled));
                        }
                    }
                    if target.core.is_execution_complete() {
                        unlink_waiter(&target.core, current.as_ref());
                        return Poll::Ready(target.waiter_outcome());
                    }
                    // Spurious wake: re-arm.
                    if target.core.register_waiter(cx.waker()) {
                        this.state = JoinState::Waiting;
                        return Poll::Pending;
                    }
                    unlink_waiter(&target.core, current.as_ref());
                    return Poll::Ready(target.waiter_outcome());
                }
                JoinState::Inline(mut body) => {
                    let guard = push_current(Arc::clone(&target.core));
                    let polled = body.as_mut().poll(cx);
                    drop(guard);
                    match polled {
                        Poll::Pending => {
                            this.state = JoinState::Inline(body);
                            return Poll::Pending;
                        }
                        Poll::Ready(()) => {
                            unlink_waiter(&target.core, current.as_ref());
                            if let Some(current) = &current {
                                if current.is_cancelled() {
                                    return Poll::Ready(Err(RequestError::Cancelled));
                                }
                            }
                            return Poll::Ready(target.waiter_outcome());
                        }
                    }
                }
                JoinState::Done => panic!("JoinFuture polled after completion"),
            }
        }
    }
}

impl<T: Clone + Send + 'static> Drop for JoinFuture<'_, T> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, JoinState::Done) {
            JoinState::Waiting => {
                unlink_waiter(&self.request.shared.core, current_request().as_ref());
            }
            JoinState::Inline(body) => {
                // The adopted body is dropped before finishing; terminal-
                // cancel the target so its other waiters do not hang.
                drop(body);
                unlink_waiter(&self.request.shared.core, current_request().as_ref());
                self.request
                    .shared
                    .core
                    .cancelled
                    .store(true, Ordering::Release);
                self.request.shared.complete(Err(RequestError::Cancelled));
            }
            JoinState::Init | JoinState::Done => {}
        }
    }
}

/// Drives a future to completion on the calling thread, parking between
/// polls. This is the foreign-thread execution primitive behind
/// [`Request::wait`] and the cache's blocking read entry point.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    struct Unparker {
        ready: Mutex<bool>,
        cv: Condvar,
    }

    impl Unparker {
        fn park(&self) {
            let mut ready = self.ready.lock();
            while !*ready {
                self.cv.wait(&mut ready);
            }
            *ready = false;
        }
    }

    impl Wake for Unparker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            *self.ready.lock() = true;
            self.cv.notify_one();
        }
    }

    let unparker = Arc::new(Unparker {
        ready: Mutex::new(false),
        cv: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&unparker));
    let mut cx = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => unparker.park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        Scheduler::builder().num_workers(2).build()
    }

    #[test]
    fn wait_runs_unstarted_request_inline() {
        let scheduler = scheduler();
        let request = Request::new(&scheduler, async { Ok(21 * 2) });
        assert_eq!(request.wait().unwrap(), 42);
        assert!(request.is_finished());
        scheduler.shutdown();
    }

    #[test]
    fn submit_then_wait() {
        let scheduler = scheduler();
        let request = Request::new(&scheduler, async { Ok("done") });
        request.submit();
        request.submit(); // idempotent
        assert_eq!(request.wait().unwrap(), "done");
        scheduler.shutdown();
    }

    #[test]
    fn wait_reraises_failure_in_every_waiter() {
        let scheduler = scheduler();
        let request: Request<u32> = Request::new(&scheduler, async {
            Err(RequestError::failed(std::io::Error::other("compute broke")))
        });
        let err = request.wait().unwrap_err();
        assert!(matches!(err, RequestError::Failed(_)));
        // A second waiter sees the same stored failure.
        let again = request.wait().unwrap_err();
        assert!(matches!(again, RequestError::Failed(_)));
        scheduler.shutdown();
    }

    #[test]
    fn notify_finished_fires_immediately_when_done() {
        let scheduler = scheduler();
        let request = Request::new(&scheduler, async { Ok(5u32) });
        request.wait().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        request.notify_finished(move |value| {
            assert_eq!(*value, 5);
            flag.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
        scheduler.shutdown();
    }

    #[test]
    fn notify_finished_submits() {
        let scheduler = scheduler();
        let request = Request::new(&scheduler, async { Ok(1u8) });
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        request.notify_finished(move |_| *flag.lock() = true);
        // Fire-and-forget: the callback arrives without any wait() call.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !*fired.lock() {
            assert!(std::time::Instant::now() < deadline, "callback never fired");
            std::thread::yield_now();
        }
        scheduler.shutdown();
    }

    #[test]
    fn cancel_before_start_skips_workload() {
        let scheduler = scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&ran);
        let request = Request::new(&scheduler, async move {
            observer.store(true, Ordering::SeqCst);
            Ok(())
        });
        request.cancel();
        assert!(request.is_cancelled());
        let cancelled_fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled_fired);
        request.notify_cancelled(move || flag.store(true, Ordering::SeqCst));
        request.submit();
        while !request.is_finished() {
            std::thread::yield_now();
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert!(cancelled_fired.load(Ordering::SeqCst));
        scheduler.shutdown();
    }

    #[test]
    fn foreign_waiter_makes_request_uncancellable() {
        let scheduler = scheduler();
        let request = Request::new(&scheduler, async { Ok(9) });
        // wait() marks uncancellable before doing anything else.
        assert_eq!(request.wait().unwrap(), 9);
        request.cancel();
        assert!(!request.is_cancelled());
        scheduler.shutdown();
    }

    #[test]
    fn nested_request_waits_for_dependency() {
        let scheduler = scheduler();
        let dependency = Request::new(&scheduler, async { Ok(10u32) });
        let dep = dependency.clone();
        let outer = Request::new(&scheduler, async move {
            let base = dep.join().await?;
            Ok(base + 1)
        });
        assert_eq!(outer.wait().unwrap(), 11);
        scheduler.shutdown();
    }

    #[test]
    fn block_on_drives_suspending_futures() {
        let value = block_on(async {
            std::future::ready(1).await + std::future::ready(2).await
        });
        assert_eq!(value, 3);
    }
}
