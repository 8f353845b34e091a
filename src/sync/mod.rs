//! Synchronization primitives usable from both foreign threads and
//! requests.

mod request_lock;

pub use request_lock::{LockFuture, RequestLock, RequestLockGuard};
