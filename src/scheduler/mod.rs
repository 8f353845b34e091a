//! The worker pool that multiplexes requests over a small set of OS
//! threads.
//!
//! Each submitted request becomes an entry in a generational task table.
//! Worker threads claim tasks from their local queue or the shared
//! injection queue, poll the task's body once, and either retire it
//! (ready) or park it in the table until its waker fires (pending). A
//! task that has been polled by a worker stays pinned to that worker, so
//! a request resumes on the thread it suspended on.
//!
//! The wake protocol collapses redundant wakeups: a task is enqueued at
//! most once, and a wake arriving while the task is being polled marks it
//! for one immediate re-poll instead of queueing a duplicate.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::task::Wake;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::task::{BoxBody, RequestCore};
use crate::util::{Arena, ArenaIndex};

mod queue;
mod worker;

use queue::{GlobalQueue, LocalQueue};
use worker::{Parker, Worker};

/// Environment variable overriding the worker count.
const WORKERS_ENV: &str = "BLOCKFLOW_WORKERS";

/// Identifier for a task in the scheduler table.
///
/// Generational: a retired task's slot can be reused, but its stale id
/// never resolves to the new occupant, so late wakeups are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) ArenaIndex);

/// Where a suspended or queued task stands in the poll protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// Suspended, waiting for its waker.
    Idle,
    /// Enqueued, waiting for a worker to claim it.
    Scheduled,
    /// Currently being polled by a worker.
    Running,
    /// Woken mid-poll; the worker re-enqueues it after the poll.
    RunningNotified,
}

pub(crate) struct TaskRecord {
    pub(crate) core: Arc<RequestCore>,
    /// Present while the task is not being polled.
    pub(crate) body: Option<BoxBody>,
    /// Worker the task is pinned to, set at first claim.
    pub(crate) worker: Option<worker::WorkerId>,
    pub(crate) poll_state: PollState,
}

pub(crate) struct WorkerShared {
    pub(crate) local: LocalQueue,
    pub(crate) parker: Parker,
}

pub(crate) struct SchedulerInner {
    pub(crate) table: Mutex<Arena<TaskRecord>>,
    pub(crate) global: GlobalQueue,
    pub(crate) workers: Vec<WorkerShared>,
    pub(crate) shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerInner {
    /// Moves a task toward execution in response to its waker.
    ///
    /// Idle tasks are enqueued (on their pinned worker's queue if they
    /// have one); a task already queued is left alone; a task being
    /// polled is marked for one immediate re-poll.
    pub(crate) fn wake_task(&self, task_id: TaskId) {
        let pinned = {
            let mut table = self.table.lock();
            let Some(record) = table.get_mut(task_id.0) else {
                return;
            };
            match record.poll_state {
                PollState::Idle => {
                    record.poll_state = PollState::Scheduled;
                    match record.worker {
                        Some(worker) => {
                            self.workers[worker].local.push(task_id);
                            Some(worker)
                        }
                        None => {
                            self.global.push(task_id);
                            None
                        }
                    }
                }
                PollState::Running => {
                    record.poll_state = PollState::RunningNotified;
                    return;
                }
                PollState::Scheduled | PollState::RunningNotified => return,
            }
        };
        match pinned {
            Some(worker) => self.workers[worker].parker.unpark(),
            None => self.unpark_all(),
        }
    }

    fn unpark_all(&self) {
        for worker in &self.workers {
            worker.parker.unpark();
        }
    }
}

pub(crate) struct TaskWaker {
    pub(crate) task_id: TaskId,
    pub(crate) inner: Weak<SchedulerInner>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.wake_task(self.task_id);
        }
    }
}

/// Handle to a worker pool. Cheap to clone; all clones share one pool.
///
/// Shut the pool down explicitly with [`Scheduler::shutdown`]; dropping
/// the last handle leaves the worker threads running detached.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.inner.workers.len())
            .field(
                "shutdown",
                &self.inner.shutdown.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Scheduler {
    /// Starts configuring a scheduler.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Creates a scheduler with the default worker count.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Inserts a new task and queues it for execution.
    pub(crate) fn schedule(&self, core: Arc<RequestCore>, body: BoxBody) -> TaskId {
        let index = self.inner.table.lock().insert(TaskRecord {
            core,
            body: Some(body),
            worker: None,
            poll_state: PollState::Scheduled,
        });
        let task_id = TaskId(index);
        self.inner.global.push(task_id);
        self.inner.unpark_all();
        task_id
    }

    /// Stops the worker threads and waits for them to exit.
    ///
    /// Queued tasks that no worker claimed before observing the shutdown
    /// flag are abandoned; their requests never complete. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.unpark_all();
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("scheduler worker thread panicked");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Scheduler`].
#[derive(Debug, Default)]
pub struct SchedulerBuilder {
    num_workers: Option<usize>,
}

impl SchedulerBuilder {
    /// Sets the number of worker threads. Zero is clamped to one.
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Builds the scheduler and spawns its worker threads.
    ///
    /// The worker count comes from this builder, else the
    /// `BLOCKFLOW_WORKERS` environment variable, else the machine's
    /// available parallelism.
    #[must_use]
    pub fn build(self) -> Scheduler {
        let num_workers = self.num_workers.or_else(workers_from_env).unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });
        let num_workers = num_workers.max(1);

        let workers = (0..num_workers)
            .map(|_| WorkerShared {
                local: LocalQueue::new(),
                parker: Parker::new(),
            })
            .collect();
        let inner = Arc::new(SchedulerInner {
            table: Mutex::new(Arena::new()),
            global: GlobalQueue::new(),
            workers,
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let threads = (0..num_workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    inner: Arc::clone(&inner),
                };
                std::thread::Builder::new()
                    .name(format!("blockflow-worker-{id}"))
                    .spawn(move || worker.run_loop())
                    .expect("failed to spawn scheduler worker thread")
            })
            .collect();
        *inner.threads.lock() = threads;
        tracing::debug!(num_workers, "scheduler started");
        Scheduler { inner }
    }
}

fn workers_from_env() -> Option<usize> {
    let raw = std::env::var(WORKERS_ENV).ok()?;
    match raw.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            tracing::warn!(value = %raw, "ignoring unparseable {WORKERS_ENV}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::RequestError;
    use crate::task::Request;

    #[test]
    fn builder_clamps_zero_workers() {
        let scheduler = Scheduler::builder().num_workers(0).build();
        assert_eq!(scheduler.num_workers(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn many_tasks_on_few_workers() {
        let scheduler = Scheduler::builder().num_workers(2).build();
        let counter = Arc::new(AtomicUsize::new(0));
        let requests: Vec<_> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                Request::new(&scheduler, async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RequestError>(())
                })
            })
            .collect();
        for request in &requests {
            request.submit();
        }
        for request in &requests {
            request.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let scheduler = Scheduler::builder().num_workers(1).build();
        scheduler.shutdown();
        scheduler.shutdown();
    }
}
