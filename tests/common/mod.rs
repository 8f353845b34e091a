#![allow(dead_code)]
//! Shared integration test utilities.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::task::{Context, Poll, Waker};

use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging (idempotent). Honors `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// A manually opened gate usable from both futures and threads.
///
/// Lets tests hold a request at a known suspension point (or a fetch
/// callback at a known blocking point) until the test opens the gate.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    open: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
    cv: Condvar,
    lock: Mutex<()>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        {
            // Taken so the store cannot slip between a blocking waiter's
            // check and its wait.
            let _guard = self.inner.lock.lock().unwrap();
            self.inner.open.store(true, Ordering::Release);
        }
        let wakers = std::mem::take(&mut *self.inner.wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
        self.inner.cv.notify_all();
    }

    /// Suspends the awaiting future until the gate opens.
    pub fn wait(&self) -> GateFuture {
        GateFuture {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Blocks the calling thread until the gate opens.
    pub fn wait_blocking(&self) {
        let mut guard = self.inner.lock.lock().unwrap();
        while !self.inner.open.load(Ordering::Acquire) {
            guard = self.inner.cv.wait(guard).unwrap();
        }
    }
}

pub struct GateFuture {
    inner: Arc<GateInner>,
}

impl Future for GateFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.open.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        self.inner.wakers.lock().unwrap().push(cx.waker().clone());
        if self.inner.open.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
