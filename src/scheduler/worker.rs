//! Worker thread logic: claim a task, poll its body, reschedule or retire.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex};

use crate::scheduler::{PollState, SchedulerInner, TaskId, TaskWaker};
use crate::task::push_current;

/// Identifier for a scheduler worker.
pub(crate) type WorkerId = usize;

/// The executing side of a worker thread.
pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) inner: Arc<SchedulerInner>,
}

impl Worker {
    /// Runs the worker loop until shutdown.
    ///
    /// Claim order: own local queue first (tasks pinned here), then the
    /// global injection queue, then park. Unclaimed global tasks become
    /// pinned to whichever worker polls them first.
    pub(crate) fn run_loop(&self) {
        while !self.inner.shutdown.load(Ordering::Acquire) {
            if let Some(task) = self.inner.workers[self.id].local.pop() {
                self.execute(task);
                continue;
            }
            if let Some(task) = self.inner.global.pop() {
                self.execute(task);
                continue;
            }
            self.inner.workers[self.id].parker.park();
        }
    }

    fn execute(&self, task_id: TaskId) {
        tracing::trace!(?task_id, worker_id = self.id, "executing task");

        let (core, mut body) = {
            let mut table = self.inner.table.lock();
            let Some(record) = table.get_mut(task_id.0) else {
                // Retired between enqueue and claim.
                return;
            };
            let Some(body) = record.body.take() else {
                return;
            };
            record.poll_state = PollState::Running;
            record.worker = Some(self.id);
            (Arc::clone(&record.core), body)
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            task_id,
            inner: Arc::downgrade(&self.inner),
        }));
        let mut cx = Context::from_waker(&waker);
        let guard = push_current(core);
        let polled = body.as_mut().poll(&mut cx);
        drop(guard);

        let mut table = self.inner.table.lock();
        match polled {
            Poll::Ready(()) => {
                table.remove(task_id.0);
            }
            Poll::Pending => {
                let Some(record) = table.get_mut(task_id.0) else {
                    return;
                };
                record.body = Some(body);
                if matches!(record.poll_state, PollState::RunningNotified) {
                    // Woken while we were polling: go around again.
                    record.poll_state = PollState::Scheduled;
                    self.inner.workers[self.id].local.push(task_id);
                } else {
                    record.poll_state = PollState::Idle;
                }
            }
        }
    }
}

/// Latch-style thread parker.
#[derive(Debug, Clone, Default)]
pub(crate) struct Parker {
    inner: Arc<ParkerInner>,
}

#[derive(Debug, Default)]
struct ParkerInner {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Parks the current thread until notified. A notification delivered
    /// before the park is consumed immediately.
    pub(crate) fn park(&self) {
        let mut notified = self.inner.notified.lock();
        while !*notified {
            self.inner.cv.wait(&mut notified);
        }
        *notified = false;
    }

    pub(crate) fn unpark(&self) {
        {
            let mut notified = self.inner.notified.lock();
            *notified = true;
        }
        self.inner.cv.notify_one();
    }
}
