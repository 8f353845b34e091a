//! Blockflow: a cooperative request scheduler and blockwise array cache.
//!
//! # Overview
//!
//! Blockflow is the lazy computation engine for pipelines over large
//! N-dimensional arrays. It has two halves:
//!
//! - A **request scheduler**: thousands of logical computations
//!   ([`Request`]s) share a small pool of OS worker threads, suspending at
//!   dependency boundaries instead of blocking their carrier thread.
//! - A **blockwise cache** ([`ArrayCache`]): partitions an array into
//!   fixed-size blocks and serves arbitrary sub-region reads by computing
//!   only the blocks that are missing, at most once per block, safely under
//!   concurrent access.
//!
//! # Core Guarantees
//!
//! - **At-most-once fetch**: concurrent reads overlapping the same dirty
//!   block trigger exactly one upstream compute call for that block.
//! - **No torn blocks**: a block is never observed clean with
//!   partially-written data; upstream failures leave it non-clean.
//! - **Cooperative cancellation**: cancellation is advisory, observed only
//!   at suspension points, and never cancels a request a foreign thread is
//!   blocked on.
//! - **Thread affinity**: once a request is claimed by a worker it resumes
//!   on that worker for its whole lifetime.
//!
//! # Module Structure
//!
//! - [`task`]: [`Request`], the cancellable, waitable unit of deferred work
//! - [`scheduler`]: the fixed-size worker pool and its queues
//! - [`sync`]: [`RequestLock`], usable from both tasks and foreign threads
//! - [`cache`]: [`ArrayCache`] and its block-state grid
//! - [`memory`]: the process-wide eviction registry caches report to
//! - [`roi`]: N-dimensional regions and block-grid arithmetic
//! - [`array`]: dense row-major N-dimensional buffers
//! - [`error`]: error taxonomy
//! - [`util`]: internal utilities (generational arena)

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod array;
pub mod cache;
pub mod error;
pub mod memory;
pub mod roi;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod util;

pub use array::NdBuffer;
pub use cache::{ArrayCache, BlockState, CacheBuilder};
pub use error::{CacheError, PoolError, RequestError};
pub use memory::{Evictable, MemoryRegistry};
pub use roi::Roi;
pub use scheduler::Scheduler;
pub use sync::RequestLock;
pub use task::{Request, RequestPool};
