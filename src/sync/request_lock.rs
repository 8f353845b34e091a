//! A mutex that both foreign threads and requests can wait on.
//!
//! A request must never block its worker thread: with as many suspended
//! lock waiters as there are workers, a blocking mutex would deadlock the
//! pool. [`RequestLock`] gives requests an awaitable acquisition path
//! ([`RequestLock::lock`]) next to a blocking one for foreign threads
//! ([`RequestLock::lock_blocking`]), with a single FIFO queue across both
//! kinds of waiter.
//!
//! Handoff is direct: releasing the lock grants it to the queue head
//! without ever marking it free, so a late arrival cannot barge past
//! queued waiters. Acquisition is not a cancellation point; a cancelled
//! request still obtains the lock, letting cleanup paths run under it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};

/// A fair mutual-exclusion lock protecting a value of type `T`.
pub struct RequestLock<T> {
    state: Mutex<LockState>,
    data: RwLock<T>,
}

struct LockState {
    held: bool,
    queue: VecDeque<Waiter>,
}

enum Waiter {
    Thread(Arc<ThreadWaiter>),
    Task(Arc<TaskWaiter>),
}

struct ThreadWaiter {
    granted: Mutex<bool>,
    cv: Condvar,
}

struct TaskWaiter {
    granted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl<T> RequestLock<T> {
    /// Creates an unlocked lock around `value`.
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState {
                held: false,
                queue: VecDeque::new(),
            }),
            data: RwLock::new(value),
        }
    }

    /// Acquires the lock, blocking the calling foreign thread.
    ///
    /// Must not be called from within a request; suspended requests would
    /// starve the worker thread this blocks. Use [`RequestLock::lock`]
    /// there.
    pub fn lock_blocking(&self) -> RequestLockGuard<'_, T> {
        let waiter = {
            let mut state = self.state.lock();
            if !state.held && state.queue.is_empty() {
                state.held = true;
                None
            } else {
                let waiter = Arc::new(ThreadWaiter {
                    granted: Mutex::new(false),
                    cv: Condvar::new(),
                });
                state.queue.push_back(Waiter::Thread(Arc::clone(&waiter)));
                Some(waiter)
            }
        };
        if let Some(waiter) = waiter {
            let mut granted = waiter.granted.lock();
            while !*granted {
                waiter.cv.wait(&mut granted);
            }
        }
        self.guard()
    }

    /// Acquires the lock if it is free and nobody is queued.
    pub fn try_lock(&self) -> Option<RequestLockGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.held || !state.queue.is_empty() {
            return None;
        }
        state.held = true;
        drop(state);
        Some(self.guard())
    }

    /// Acquires the lock from within a request, suspending until granted.
    ///
    /// Never fails and never observes cancellation; the caller decides
    /// what to do with a cancelled context after acquisition.
    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture {
            lock: self,
            state: FutureState::Init,
        }
    }

    fn guard(&self) -> RequestLockGuard<'_, T> {
        RequestLockGuard {
            lock: self,
            inner: Some(self.data.write()),
        }
    }

    /// Hands the lock to the queue head, or frees it if nobody waits.
    ///
    /// The grant flag is set in the same critical section that dequeues
    /// the waiter, so a waiter abandoning the queue observes either its
    /// entry or the grant, never a gap between them.
    fn unlock(&self) {
        let granted = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(Waiter::Thread(waiter)) => {
                    *waiter.granted.lock() = true;
                    Waiter::Thread(waiter)
                }
                Some(Waiter::Task(waiter)) => {
                    waiter.granted.store(true, Ordering::Release);
                    Waiter::Task(waiter)
                }
                None => {
                    state.held = false;
                    return;
                }
            }
        };
        match granted {
            Waiter::Thread(waiter) => {
                waiter.cv.notify_one();
            }
            Waiter::Task(waiter) => {
                if let Some(waker) = waiter.waker.lock().take() {
                    waker.wake();
                }
            }
        }
    }
}

impl<T: Default> Default for RequestLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for RequestLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestLock")
            .field("held", &state.held)
            .field("waiters", &state.queue.len())
            .finish()
    }
}

enum FutureState {
    Init,
    Queued(Arc<TaskWaiter>),
    Done,
}

/// Future returned by [`RequestLock::lock`].
pub struct LockFuture<'a, T> {
    lock: &'a RequestLock<T>,
    state: FutureState,
}

impl<'a, T> Future for LockFuture<'a, T> {
    type Output = RequestLockGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            FutureState::Init => {
                let mut state = this.lock.state.lock();
                if !state.held && state.queue.is_empty() {
                    state.held = true;
                    drop(state);
                    this.state = FutureState::Done;
                    return Poll::Ready(this.lock.guard());
                }
                let waiter = Arc::new(TaskWaiter {
                    granted: AtomicBool::new(false),
                    waker: Mutex::new(Some(cx.waker().clone())),
                });
                state.queue.push_back(Waiter::Task(Arc::clone(&waiter)));
                drop(state);
                this.state = FutureState::Queued(waiter);
                Poll::Pending
            }
            FutureState::Queued(waiter) => {
                if waiter.granted.load(Ordering::Acquire) {
                    this.state = FutureState::Done;
                    return Poll::Ready(this.lock.guard());
                }
                // Re-arm with the latest waker before re-checking, so a
                // grant racing this poll still wakes somebody.
                *waiter.waker.lock() = Some(cx.waker().clone());
                if waiter.granted.load(Ordering::Acquire) {
                    this.state = FutureState::Done;
                    return Poll::Ready(this.lock.guard());
                }
                Poll::Pending
            }
            FutureState::Done => panic!("LockFuture polled after acquisition"),
        }
    }
}

impl<T> Drop for LockFuture<'_, T> {
    fn drop(&mut self) {
        if let FutureState::Queued(waiter) = std::mem::replace(&mut self.state, FutureState::Done)
        {
            let still_queued = {
                let mut state = self.lock.state.lock();
                let before = state.queue.len();
                state
                    .queue
                    .retain(|queued| match queued {
                        Waiter::Task(task) => !Arc::ptr_eq(task, &waiter),
                        Waiter::Thread(_) => true,
                    });
                state.queue.len() != before
            };
            // Granted between the last poll and this drop: the lock was
            // handed to us, pass it on.
            if !still_queued && waiter.granted.load(Ordering::Acquire) {
                self.lock.unlock();
            }
        }
    }
}

/// Exclusive access to the value in a [`RequestLock`].
///
/// Releasing the guard grants the lock to the next queued waiter.
pub struct RequestLockGuard<'a, T> {
    lock: &'a RequestLock<T>,
    inner: Option<RwLockWriteGuard<'a, T>>,
}

impl<T> std::ops::Deref for RequestLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard holds data until drop")
    }
}

impl<T> std::ops::DerefMut for RequestLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard holds data until drop")
    }
}

impl<T> Drop for RequestLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the data before handing the lock over, so the grantee
        // never blocks on our write guard.
        self.inner.take();
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn uncontended_blocking_lock() {
        let lock = RequestLock::new(5u32);
        {
            let mut guard = lock.lock_blocking();
            *guard += 1;
        }
        assert_eq!(*lock.lock_blocking(), 6);
    }

    #[test]
    fn blocking_waiters_take_turns() {
        let lock = Arc::new(RequestLock::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let mut guard = lock.lock_blocking();
                    *guard += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock_blocking(), 800);
    }

    #[test]
    fn release_hands_off_to_queued_thread() {
        let lock = Arc::new(RequestLock::new(false));
        let guard = lock.lock_blocking();
        let contender = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let mut guard = lock.lock_blocking();
                *guard = true;
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        contender.join().unwrap();
        assert!(*lock.lock_blocking());
    }

    #[test]
    fn try_lock_respects_holder_and_queue() {
        let lock = RequestLock::new(0u8);
        let guard = lock.try_lock().expect("free lock");
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn async_lock_fast_path() {
        let lock = RequestLock::new(1u8);
        let guard = crate::task::block_on(lock.lock());
        assert_eq!(*guard, 1);
    }
}
