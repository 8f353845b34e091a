//! Task queues: a shared injection queue plus one local queue per worker.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::scheduler::TaskId;

/// The global injection queue.
///
/// Takes tasks scheduled from outside the worker pool and tasks that have
/// not yet been claimed by a worker.
#[derive(Debug, Default)]
pub(crate) struct GlobalQueue {
    inner: SegQueue<TaskId>,
}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, task: TaskId) {
        self.inner.push(task);
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        self.inner.pop()
    }
}

/// A worker's local run queue, FIFO.
///
/// Once a task has been polled by a worker it is rescheduled here, so the
/// suspension state it may have left in thread-local storage is resumed on
/// the same thread. FIFO ordering keeps wakeups fair: a task woken first
/// runs first.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalQueue {
    inner: Arc<Mutex<VecDeque<TaskId>>>,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub(crate) fn push(&self, task: TaskId) {
        self.inner.lock().push_back(task);
    }

    pub(crate) fn pop(&self) -> Option<TaskId> {
        self.inner.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ArenaIndex;

    fn task(slot: u32) -> TaskId {
        TaskId(ArenaIndex::from_parts(slot, 0))
    }

    #[test]
    fn local_queue_is_fifo() {
        let queue = LocalQueue::new();
        queue.push(task(1));
        queue.push(task(2));
        queue.push(task(3));
        assert_eq!(queue.pop(), Some(task(1)));
        assert_eq!(queue.pop(), Some(task(2)));
        assert_eq!(queue.pop(), Some(task(3)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn global_queue_drains_to_empty() {
        let queue = GlobalQueue::new();
        queue.push(task(7));
        assert_eq!(queue.pop(), Some(task(7)));
        assert_eq!(queue.pop(), None);
    }
}
