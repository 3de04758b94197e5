//! One-shot progress callbacks run from the worker's progress loop.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use smallvec::SmallVec;

use crate::error::{WorkerError, WorkerResult};

pub type OneShotTask = Box<dyn FnOnce() + Send>;

/// Bounded queue of tasks that run exactly once on the next progress call.
///
/// Registration never blocks and never takes a lock held by the progress
/// loop, so it is safe from asynchronous event context.
pub struct CallbackQueue {
    tx: Sender<OneShotTask>,
    rx: Receiver<OneShotTask>,
}

impl CallbackQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(depth);
        Self { tx, rx }
    }

    /// Queues `task` for the next [`CallbackQueue::dispatch`].
    ///
    /// A full queue is reported as [`WorkerError::NoMemory`].
    pub fn register_oneshot<F>(&self, task: F) -> WorkerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.try_send(Box::new(task)).map_err(|err| match err {
            TrySendError::Full(_) => WorkerError::NoMemory("progress queue is full"),
            TrySendError::Disconnected(_) => WorkerError::NoMemory("progress queue is closed"),
        })
    }

    /// Runs the tasks queued before this call. Tasks they register wait for
    /// the next dispatch.
    pub fn dispatch(&self) -> usize {
        let pending = self.rx.len();
        if pending == 0 {
            return 0;
        }
        let tasks: SmallVec<[OneShotTask; 8]> = self.rx.try_iter().take(pending).collect();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("pending", &self.len())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_once() {
        let queue = CallbackQueue::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            queue
                .register_oneshot(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(queue.dispatch(), 3);
        assert_eq!(queue.dispatch(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn full_queue_is_no_memory() {
        let queue = CallbackQueue::new(1);
        queue.register_oneshot(|| {}).unwrap();
        let err = queue.register_oneshot(|| {}).unwrap_err();
        assert!(matches!(err, WorkerError::NoMemory(_)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn tasks_registered_during_dispatch_wait_for_next_round() {
        let queue = Arc::new(CallbackQueue::new(4));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let queue2 = Arc::clone(&queue);
            let hits2 = Arc::clone(&hits);
            queue
                .register_oneshot(move || {
                    queue2
                        .register_oneshot(move || {
                            hits2.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                })
                .unwrap();
        }
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.dispatch(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
