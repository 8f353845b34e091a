//! The blockwise array cache.
//!
//! An [`ArrayCache`] sits between consumers asking for arbitrary regions
//! of a large N-dimensional array and a producer that computes regions on
//! demand. The array is partitioned into fixed-shape blocks; each block is
//! fetched from the producer at most once and kept until invalidated or
//! evicted. Concurrent reads overlapping the same missing block attach to
//! the one in-flight fetch instead of issuing their own.
//!
//! A frozen cache (see [`ArrayCache::set_fixed`]) issues no fetches at
//! all: it serves whatever it holds, records invalidations quietly, and
//! replays them as a single dirty notification on thaw.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::array::NdBuffer;
use crate::error::{CacheError, RequestError};
use crate::memory::{Evictable, MemoryRegistry};
use crate::roi::{self, Coord, Roi};
use crate::scheduler::Scheduler;
use crate::sync::RequestLock;
use crate::task::{block_on, current_request, Request, RequestPool};
use crate::util::Arena;

mod state;

pub use state::BlockState;
use state::{merge_tiles, tile_roi, BlockGrid, CellState, FetchId};

/// Producer callback computing the contents of a region.
///
/// Called on scheduler worker threads, one call per fetch tile. The
/// returned buffer must have exactly the region's shape.
pub type FetchFn<T> =
    dyn Fn(&Roi) -> Result<NdBuffer<T>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync;

/// Dirty-notification callback, invoked with the invalidated region.
pub type DirtyListener = dyn Fn(&Roi) + Send + Sync;

/// Hit/miss counters, in blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Blocks served from the buffer without fetching.
    pub hits: u64,
    /// Blocks that required a producer fetch.
    pub misses: u64,
}

struct CacheState<T> {
    block_shape: Coord,
    grid: BlockGrid,
    /// Lazily allocated on the first read or write.
    buffer: Option<NdBuffer<T>>,
    /// In-flight fetch requests, addressed by the grid's `InProcess` ids.
    fetches: Arena<Request<()>>,
    fixed: bool,
    has_fixed_dirty: bool,
    /// Reads between their first and last lock hold. Non-zero blocks
    /// eviction.
    running: usize,
    last_access: Instant,
    /// Decayed access-gap measure; grows while the cache sits idle.
    idle_score: f64,
}

impl<T> CacheState<T> {
    fn touch(&mut self) {
        let now = Instant::now();
        let gap = now.duration_since(self.last_access).as_secs_f64();
        self.idle_score = 0.5 * self.idle_score + gap;
        self.last_access = now;
    }
}

struct CacheInner<T: Copy + Default + Send + Sync + 'static> {
    scheduler: Scheduler,
    fetch: Arc<FetchFn<T>>,
    shape: Coord,
    state: RequestLock<CacheState<T>>,
    listeners: Mutex<Vec<Box<DirtyListener>>>,
    registry: Option<Arc<MemoryRegistry>>,
    used_bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Copy + Default + Send + Sync + 'static> CacheInner<T> {
    /// Allocates the backing buffer if missing and accounts for it.
    fn ensure_buffer(&self, state: &mut CacheState<T>) {
        if state.buffer.is_none() {
            let buffer = NdBuffer::filled(&self.shape, T::default());
            let bytes = buffer.size_bytes();
            state.buffer = Some(buffer);
            self.used_bytes.fetch_add(bytes, Ordering::AcqRel);
            if let Some(registry) = &self.registry {
                registry.report_allocation(bytes);
            }
            tracing::debug!(bytes, "cache buffer allocated");
        }
    }

    fn notify_dirty(&self, region: &Roi) {
        for listener in self.listeners.lock().iter() {
            listener(region);
        }
    }

    /// Completion side of a fetch: copy the tile into the buffer and move
    /// its still-claimed cells out of `InProcess`, in one critical
    /// section so readers never observe a half-written clean block.
    async fn finish_fetch(
        &self,
        fetch_id: FetchId,
        region: &Roi,
        fetched: Result<NdBuffer<T>, Box<dyn std::error::Error + Send + Sync>>,
    ) -> Result<(), RequestError> {
        let fetched = fetched.map_err(RequestError::failed_boxed).and_then(|data| {
            if data.shape() == region.shape().as_slice() {
                Ok(data)
            } else {
                Err(RequestError::failed(CacheError::ShapeMismatch {
                    expected: region.shape().to_vec(),
                    actual: data.shape().to_vec(),
                }))
            }
        });

        let mut state = self.state.lock().await;
        let block_shape = state.block_shape.clone();
        let (lo, hi) = roi::block_range(region, &block_shape);
        let outcome = match fetched {
            Ok(data) => {
                // Publish block by block, touching only cells this fetch
                // still owns. A write or invalidation that raced ahead of
                // us keeps its contents and its state.
                for cell in roi::cells(&lo, &hi) {
                    if state.grid.get(&cell) != CellState::InProcess(fetch_id) {
                        continue;
                    }
                    let block = roi::block_roi(&cell, &block_shape, &self.shape);
                    let src_start: Coord = block
                        .start()
                        .iter()
                        .zip(region.start())
                        .map(|(&b, &r)| b - r)
                        .collect();
                    if let Some(buffer) = state.buffer.as_mut() {
                        buffer.copy_in_from(&block, &data, &src_start);
                    }
                    state.grid.set(&cell, CellState::Clean);
                }
                Ok(())
            }
            Err(error) => {
                // Leave the blocks refetchable; the error travels to every
                // waiter of this fetch.
                for cell in roi::cells(&lo, &hi) {
                    if state.grid.get(&cell) == CellState::InProcess(fetch_id) {
                        state.grid.set(&cell, CellState::Dirty);
                    }
                }
                Err(error)
            }
        };
        state.fetches.remove(fetch_id);
        outcome
    }

    /// Returns a cancelled fetch's blocks to the dirty pool.
    fn release_cancelled_fetch(&self, fetch_id: FetchId) {
        let mut state = self.state.lock_blocking();
        for cell in state
            .grid
            .cells_where(|c| c == CellState::InProcess(fetch_id))
        {
            state.grid.set(&cell, CellState::Dirty);
        }
        state.fetches.remove(fetch_id);
    }

    async fn read_region(self: &Arc<Self>, region: &Roi) -> Result<NdBuffer<T>, CacheError> {
        if !region.fits_in(&self.shape) {
            return Err(CacheError::OutOfBounds {
                roi: region.clone(),
                shape: self.shape.to_vec(),
            });
        }

        let mut waits: RequestPool<()> = RequestPool::new();
        {
            let mut state = self.state.lock().await;
            state.running += 1;
            state.touch();
            self.ensure_buffer(&mut state);

            let block_shape = state.block_shape.clone();
            let (lo, hi) = roi::block_range(region, &block_shape);
            let mut to_fetch: Vec<Coord> = Vec::new();
            let mut hits = 0u64;
            for cell in roi::cells(&lo, &hi) {
                let cell_state = match state.grid.get(&cell) {
                    // Stale claim from a retired fetch.
                    CellState::InProcess(id) if !state.fetches.contains(id) => CellState::Dirty,
                    other => other,
                };
                match cell_state {
                    CellState::Clean | CellState::FixedDirty => hits += 1,
                    CellState::InProcess(id) => {
                        if let Some(request) = state.fetches.get(id) {
                            let _ = waits.add(request.clone());
                        }
                    }
                    CellState::Dirty => {
                        if state.fixed {
                            // Frozen: remember the miss, serve what the
                            // buffer holds.
                            state.grid.set(&cell, CellState::FixedDirty);
                            state.has_fixed_dirty = true;
                        } else {
                            to_fetch.push(cell);
                        }
                    }
                }
            }
            self.hits.fetch_add(hits, Ordering::Relaxed);

            for (tile_lo, tile_hi) in merge_tiles(&to_fetch, state.grid.grid_shape()) {
                let fetch_region = tile_roi(&tile_lo, &tile_hi, &block_shape, &self.shape);
                let weak = Arc::downgrade(self);
                let cleanup = Arc::downgrade(self);
                let fetch_id = state.fetches.insert_with(|fetch_id| {
                    let request =
                        Request::new(&self.scheduler, fetch_tile(weak, fetch_region, fetch_id));
                    // A fetch cancelled before running never reaches
                    // finish_fetch; unclaim its blocks so later reads
                    // refetch them.
                    request.notify_cancelled(move || {
                        if let Some(cache) = cleanup.upgrade() {
                            cache.release_cancelled_fetch(fetch_id);
                        }
                    });
                    request
                });
                let mut claimed = 0u64;
                for cell in roi::cells(&tile_lo, &tile_hi) {
                    state.grid.set(&cell, CellState::InProcess(fetch_id));
                    claimed += 1;
                }
                self.misses.fetch_add(claimed, Ordering::Relaxed);
                if let Some(request) = state.fetches.get(fetch_id) {
                    let _ = waits.add(request.clone());
                }
            }
        }
        let running = RunningGuard { cache: self };

        // The state lock is released while waiting, so fetches for other
        // regions proceed concurrently.
        waits.join_all().await?;

        let state = self.state.lock().await;
        let result = state
            .buffer
            .as_ref()
            .expect("buffer pinned while a read is running")
            .copy_out(region);
        drop(state);
        drop(running);
        Ok(result)
    }
}

/// Decrements the running-read count even when the read future is
/// dropped mid-wait, so a cancelled read cannot pin the cache against
/// eviction.
struct RunningGuard<'a, T: Copy + Default + Send + Sync + 'static> {
    cache: &'a CacheInner<T>,
}

impl<T: Copy + Default + Send + Sync + 'static> Drop for RunningGuard<'_, T> {
    fn drop(&mut self) {
        self.cache.state.lock_blocking().running -= 1;
    }
}

/// Body of a fetch request: call the producer, then publish the tile.
async fn fetch_tile<T: Copy + Default + Send + Sync + 'static>(
    cache: Weak<CacheInner<T>>,
    region: Roi,
    fetch_id: FetchId,
) -> Result<(), RequestError> {
    let Some(cache) = cache.upgrade() else {
        return Err(RequestError::Cancelled);
    };
    tracing::trace!(%region, "fetching tile");
    let fetched = (cache.fetch)(&region);
    cache.finish_fetch(fetch_id, &region, fetched).await
}

impl<T: Copy + Default + Send + Sync + 'static> Evictable for CacheInner<T> {
    fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    fn eviction_priority(&self) -> f64 {
        let state = self.state.lock_blocking();
        let idle = state.last_access.elapsed().as_secs_f64();
        // Long access gaps push a cache toward eviction: the registry
        // frees the lowest value first.
        -(state.idle_score + idle)
    }

    fn request_eviction(&self) -> usize {
        let mut state = self.state.lock_blocking();
        if state.running > 0 || state.grid.any(|c| matches!(c, CellState::InProcess(_))) {
            tracing::debug!("eviction refused, cache busy");
            return 0;
        }
        if state.buffer.take().is_none() {
            return 0;
        }
        state.grid.reset();
        state.has_fixed_dirty = false;
        let freed = self.used_bytes.swap(0, Ordering::AcqRel);
        tracing::debug!(freed, "cache evicted");
        freed
    }
}

/// A blockwise cache over an N-dimensional array of `T`.
///
/// Handles are cheap to clone; all clones share one cache.
pub struct ArrayCache<T: Copy + Default + Send + Sync + 'static> {
    inner: Arc<CacheInner<T>>,
}

impl<T: Copy + Default + Send + Sync + 'static> Clone for ArrayCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy + Default + Send + Sync + 'static> std::fmt::Debug for ArrayCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayCache")
            .field("shape", &self.inner.shape)
            .field("used_bytes", &self.inner.used_bytes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Copy + Default + Send + Sync + 'static> ArrayCache<T> {
    /// Starts configuring a cache over an array of `shape`, fetching
    /// missing regions through `fetch`.
    pub fn builder<F>(scheduler: &Scheduler, shape: &[usize], fetch: F) -> CacheBuilder<T>
    where
        F: Fn(&Roi) -> Result<NdBuffer<T>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        CacheBuilder {
            scheduler: scheduler.clone(),
            shape: shape.iter().copied().collect(),
            block_shape: None,
            fetch: Arc::new(fetch),
            registry: None,
            fixed: false,
        }
    }

    /// Reads a region, blocking the calling foreign thread until every
    /// covered block is available.
    ///
    /// # Errors
    ///
    /// Out-of-bounds regions and failed fetches.
    ///
    /// # Panics
    ///
    /// Panics when called from within a request; await
    /// [`ArrayCache::read_async`] there.
    pub fn read(&self, region: &Roi) -> Result<NdBuffer<T>, CacheError> {
        assert!(
            current_request().is_none(),
            "ArrayCache::read() called from within a request; await read_async() instead"
        );
        block_on(self.read_async(region))
    }

    /// Reads a region from within a request, suspending while missing
    /// blocks are fetched.
    ///
    /// Blocks already in flight are awaited, never refetched; dirty
    /// blocks are merged into rectangular tiles and fetched once. On a
    /// frozen cache no fetch is issued and stale or zeroed contents are
    /// returned.
    ///
    /// # Errors
    ///
    /// Out-of-bounds regions and failed fetches.
    pub async fn read_async(&self, region: &Roi) -> Result<NdBuffer<T>, CacheError> {
        self.inner.read_region(region).await
    }

    /// Writes `data` into the cache at `region`.
    ///
    /// Blocks fully covered by the write become clean with the new
    /// contents; partially covered blocks are only invalidated, since the
    /// cache cannot reconstruct their missing part. Writes land even on a
    /// frozen cache.
    ///
    /// # Errors
    ///
    /// Out-of-bounds regions and data whose shape does not match the
    /// region.
    pub fn write(&self, region: &Roi, data: &NdBuffer<T>) -> Result<(), CacheError> {
        if !region.fits_in(&self.inner.shape) {
            return Err(CacheError::OutOfBounds {
                roi: region.clone(),
                shape: self.inner.shape.to_vec(),
            });
        }
        if data.shape() != region.shape().as_slice() {
            return Err(CacheError::ShapeMismatch {
                expected: region.shape().to_vec(),
                actual: data.shape().to_vec(),
            });
        }

        let mut state = self.inner.state.lock_blocking();
        state.touch();
        self.inner.ensure_buffer(&mut state);
        let block_shape = state.block_shape.clone();
        let (lo, hi) = roi::block_range(region, &block_shape);
        for cell in roi::cells(&lo, &hi) {
            let block = roi::block_roi(&cell, &block_shape, &self.inner.shape);
            if region.contains_roi(&block) {
                let src_start: Coord = block
                    .start()
                    .iter()
                    .zip(region.start())
                    .map(|(&b, &r)| b - r)
                    .collect();
                let buffer = state.buffer.as_mut().expect("buffer allocated above");
                buffer.copy_in_from(&block, data, &src_start);
                // A write supersedes any in-flight fetch of this block;
                // the fetch's late result only lands on cells still
                // carrying its claim.
                state.grid.set(&cell, CellState::Clean);
            } else {
                state.grid.set(&cell, CellState::Dirty);
            }
        }
        Ok(())
    }

    /// Invalidates a region: its blocks must be refetched before they are
    /// served again.
    ///
    /// On an unfrozen cache the registered dirty listeners are notified
    /// with the exact region. On a frozen cache nothing is notified; the
    /// invalidation is recorded and replayed at thaw.
    pub fn propagate_dirty(&self, region: &Roi) {
        let Some(region) = region.intersection(&Roi::from_shape(&self.inner.shape)) else {
            return;
        };
        let notify = {
            let mut state = self.inner.state.lock_blocking();
            let block_shape = state.block_shape.clone();
            let (lo, hi) = roi::block_range(&region, &block_shape);
            if state.fixed {
                for cell in roi::cells(&lo, &hi) {
                    match state.grid.get(&cell) {
                        CellState::Clean | CellState::InProcess(_) => {
                            state.grid.set(&cell, CellState::FixedDirty);
                            state.has_fixed_dirty = true;
                        }
                        CellState::Dirty | CellState::FixedDirty => {}
                    }
                }
                false
            } else {
                for cell in roi::cells(&lo, &hi) {
                    state.grid.set(&cell, CellState::Dirty);
                }
                true
            }
        };
        if notify {
            self.inner.notify_dirty(&region);
        }
    }

    /// Freezes or thaws the cache.
    ///
    /// Frozen, the cache never fetches and serves stale contents.
    /// Thawing turns every block invalidated during the freeze dirty and
    /// fires a single dirty notification covering their bounding box.
    pub fn set_fixed(&self, fixed: bool) {
        let notify = {
            let mut state = self.inner.state.lock_blocking();
            let was_fixed = state.fixed;
            state.fixed = fixed;
            if !was_fixed || fixed || !state.has_fixed_dirty {
                None
            } else {
                let block_shape = state.block_shape.clone();
                let mut union: Option<Roi> = None;
                for cell in state.grid.cells_where(|c| c == CellState::FixedDirty) {
                    state.grid.set(&cell, CellState::Dirty);
                    let block = roi::block_roi(&cell, &block_shape, &self.inner.shape);
                    union = Some(match union {
                        Some(so_far) => so_far.bounding_union(&block),
                        None => block,
                    });
                }
                state.has_fixed_dirty = false;
                union
            }
        };
        if let Some(region) = notify {
            tracing::debug!(%region, "thaw replaying deferred invalidations");
            self.inner.notify_dirty(&region);
        }
    }

    /// True while the cache is frozen.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.inner.state.lock_blocking().fixed
    }

    /// Registers a listener for dirty notifications.
    pub fn on_dirty<F>(&self, listener: F)
    where
        F: Fn(&Roi) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    /// The state of the block at grid coordinate `cell`.
    #[must_use]
    pub fn block_state(&self, cell: &[usize]) -> BlockState {
        self.inner.state.lock_blocking().grid.get(cell).into()
    }

    /// Grid coordinates of every clean block, row-major.
    #[must_use]
    pub fn clean_blocks(&self) -> Vec<Coord> {
        self.inner
            .state
            .lock_blocking()
            .grid
            .cells_where(|c| c == CellState::Clean)
    }

    /// Replaces the block partition, discarding all cached contents.
    ///
    /// # Panics
    ///
    /// Panics if the new block shape's dimensionality differs from the
    /// array's or a block axis is zero.
    pub fn set_block_shape(&self, block_shape: &[usize]) {
        assert_eq!(
            block_shape.len(),
            self.inner.shape.len(),
            "block shape dimensionality must match the array"
        );
        assert!(
            !block_shape.contains(&0),
            "block shape axes must be non-zero"
        );
        let mut state = self.inner.state.lock_blocking();
        state.block_shape = block_shape.iter().copied().collect();
        state.grid = BlockGrid::new(&self.inner.shape, block_shape);
        state.has_fixed_dirty = false;
        if state.buffer.take().is_some() {
            let freed = self.inner.used_bytes.swap(0, Ordering::AcqRel);
            if let Some(registry) = &self.inner.registry {
                registry.report_release(freed);
            }
        }
    }

    /// The full array shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    /// The current block partition shape.
    #[must_use]
    pub fn block_shape(&self) -> Coord {
        self.inner.state.lock_blocking().block_shape.clone()
    }

    /// Bytes held by the backing buffer, zero before the first access and
    /// after eviction.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.inner.used_bytes.load(Ordering::Acquire)
    }

    /// Hit/miss counters accumulated since creation, in blocks.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Weak eviction handle, as held by a [`MemoryRegistry`]. Registered
    /// automatically at build time when the builder carries a registry.
    #[must_use]
    pub fn as_evictable(&self) -> Weak<dyn Evictable> {
        let inner: Arc<dyn Evictable> = self.inner.clone();
        Arc::downgrade(&inner)
    }
}

/// Builder for [`ArrayCache`].
pub struct CacheBuilder<T: Copy + Default + Send + Sync + 'static> {
    scheduler: Scheduler,
    shape: Coord,
    block_shape: Option<Coord>,
    fetch: Arc<FetchFn<T>>,
    registry: Option<Arc<MemoryRegistry>>,
    fixed: bool,
}

impl<T: Copy + Default + Send + Sync + 'static> CacheBuilder<T> {
    /// Sets the block partition shape. Defaults to 64 per axis, clamped
    /// to the array shape.
    #[must_use]
    pub fn block_shape(mut self, block_shape: &[usize]) -> Self {
        self.block_shape = Some(block_shape.iter().copied().collect());
        self
    }

    /// Registers the cache with a memory registry at build time.
    #[must_use]
    pub fn registry(mut self, registry: Arc<MemoryRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Starts the cache frozen.
    #[must_use]
    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Builds the cache.
    ///
    /// # Errors
    ///
    /// [`CacheError::ShapeMismatch`] when the block shape's
    /// dimensionality differs from the array's, or a block axis is zero.
    pub fn build(self) -> Result<ArrayCache<T>, CacheError> {
        let block_shape = self
            .block_shape
            .unwrap_or_else(|| self.shape.iter().map(|&axis| axis.min(64)).collect());
        if block_shape.len() != self.shape.len() || block_shape.contains(&0) {
            return Err(CacheError::ShapeMismatch {
                expected: self.shape.to_vec(),
                actual: block_shape.to_vec(),
            });
        }
        let inner = Arc::new(CacheInner {
            scheduler: self.scheduler,
            fetch: self.fetch,
            shape: self.shape.clone(),
            state: RequestLock::new(CacheState {
                grid: BlockGrid::new(&self.shape, &block_shape),
                block_shape,
                buffer: None,
                fetches: Arena::new(),
                fixed: self.fixed,
                has_fixed_dirty: false,
                running: 0,
                last_access: Instant::now(),
                idle_score: 0.0,
            }),
            listeners: Mutex::new(Vec::new()),
            registry: self.registry.clone(),
            used_bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });
        if let Some(registry) = &self.registry {
            let evictable: Arc<dyn Evictable> = inner.clone();
            registry.register(Arc::downgrade(&evictable));
        }
        Ok(ArrayCache { inner })
    }
}
