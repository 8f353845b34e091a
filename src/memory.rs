//! Memory accounting and eviction across caches.
//!
//! Caches register with a [`MemoryRegistry`] and report their allocations.
//! When memory must be reclaimed, the registry walks registered caches in
//! eviction-priority order and asks each to give memory back. Eviction is
//! always a request, never a command: a cache refuses while it has work in
//! flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A consumer of cache memory that can be asked to release it.
pub trait Evictable: Send + Sync {
    /// Bytes currently held.
    fn used_bytes(&self) -> usize;

    /// Relative eviction priority; lower values are evicted first.
    fn eviction_priority(&self) -> f64;

    /// Asks the consumer to release memory. Returns the bytes actually
    /// freed, which may be zero if the consumer cannot safely release
    /// anything right now.
    fn request_eviction(&self) -> usize;
}

/// Registry of evictable memory consumers.
///
/// Holds weak references only; a dropped consumer is pruned on the next
/// walk.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: Mutex<Vec<Weak<dyn Evictable>>>,
    total: AtomicUsize,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer to the registry.
    pub fn register(&self, consumer: Weak<dyn Evictable>) {
        self.entries.lock().push(consumer);
    }

    /// Records bytes newly allocated by a registered consumer.
    pub fn report_allocation(&self, bytes: usize) {
        self.total.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Records bytes released by a registered consumer.
    pub fn report_release(&self, bytes: usize) {
        self.total.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Total bytes currently reported as allocated.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Asks consumers to release memory until at least `target_bytes`
    /// have been freed or every consumer has been asked once. Returns the
    /// bytes actually freed.
    ///
    /// Consumers are visited in ascending eviction priority. The walk
    /// happens outside the registry lock, so an eviction that itself
    /// reports a release cannot deadlock.
    pub fn reclaim(&self, target_bytes: usize) -> usize {
        let mut consumers: Vec<Arc<dyn Evictable>> = {
            let mut entries = self.entries.lock();
            entries.retain(|weak| weak.strong_count() > 0);
            entries.iter().filter_map(Weak::upgrade).collect()
        };
        consumers.sort_by(|a, b| {
            a.eviction_priority()
                .partial_cmp(&b.eviction_priority())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut freed = 0;
        for consumer in consumers {
            if freed >= target_bytes {
                break;
            }
            let released = consumer.request_eviction();
            if released > 0 {
                self.report_release(released);
                freed += released;
            }
        }
        tracing::debug!(freed, target_bytes, "memory reclaim pass finished");
        freed
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("total_bytes", &self.total_bytes())
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}
