//! A single heap-allocated, type-erased future plus its intrusive queue
//! slot.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::ExecutorInner;

pub type ErasedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One scheduled unit of work. `queued` makes `wake` idempotent: a wake
/// that arrives while the task is already sitting in the ready queue (or is
/// being polled, which resets `queued` to `false` first) must not push a
/// second copy.
pub struct TaskSlot {
    pub(super) future: Mutex<Option<ErasedFuture>>,
    pub(super) queued: AtomicBool,
    pub(super) executor: Arc<ExecutorInner>,
}

impl TaskSlot {
    pub(super) fn new(future: ErasedFuture, executor: Arc<ExecutorInner>) -> Arc<Self> {
        Arc::new(Self {
            future: Mutex::new(Some(future)),
            // A freshly created task is considered already "queued" until
            // the first push, so `schedule` below actually enqueues it.
            queued: AtomicBool::new(false),
            executor,
        })
    }

    /// Enqueue this task if it isn't already sitting in the ready queue.
    pub(super) fn schedule(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut queue = self.executor.queue.lock().unwrap();
        queue.push_back(self.clone());
        drop(queue);
        self.executor.condvar.notify_one();
    }
}
