//! Single-threaded cooperative task executor (§4.A).
//!
//! A dedicated event-loop thread drains a FIFO ready queue of heap-allocated
//! futures. Grounded on the teacher's lock-and-notify shape
//! (`plugin::PluginRegistry`'s `HashMap` guarded for exclusive access,
//! generalized here from a synchronous registration table to an
//! asynchronous ready queue) plus `perf::PerfMetrics`'s atomic counters for
//! the running-task count.
//!
//! This executor is hand-rolled rather than delegated to an external async
//! runtime: §2/§4.A name the task executor as a subsystem this crate owns,
//! distinct from "the worker-pool task library used by other subsystems"
//! that §1 explicitly places out of scope.

mod task;
mod waker;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::thread::JoinHandle as ThreadJoinHandle;

use task::{ErasedFuture, TaskSlot};
use waker::waker_for;

struct ExecutorInner {
    queue: Mutex<VecDeque<Arc<TaskSlot>>>,
    condvar: Condvar,
    running_tasks: AtomicUsize,
    should_quit: AtomicBool,
}

/// The process-wide cooperative scheduler. The event loop runs on a single
/// dedicated thread, owned and joined by this type's `shutdown`.
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
    loop_thread: Mutex<Option<ThreadJoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(ExecutorInner {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            running_tasks: AtomicUsize::new(0),
            should_quit: AtomicBool::new(false),
        });
        let loop_inner = inner.clone();
        let loop_thread = std::thread::Builder::new()
            .name("fulcrum-event-loop".into())
            .spawn(move || run_event_loop(loop_inner))
            .expect("failed to spawn event-loop thread");
        Arc::new(Self {
            inner,
            loop_thread: Mutex::new(Some(loop_thread)),
        })
    }

    /// Allocate a task wrapping `future`, push it onto the ready queue, and
    /// return a handle the caller can `.await` for the eventual result.
    pub fn enqueue<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = Arc::new(JoinShared {
            result: Mutex::new(None),
            waker: Mutex::new(None),
        });
        let shared_for_task = shared.clone();
        let wrapped: ErasedFuture = Box::pin(async move {
            let value = future.await;
            *shared_for_task.result.lock().unwrap() = Some(value);
            if let Some(waker) = shared_for_task.waker.lock().unwrap().take() {
                waker.wake();
            }
        });
        self.inner.running_tasks.fetch_add(1, Ordering::SeqCst);
        let slot = TaskSlot::new(wrapped, self.inner.clone());
        slot.schedule();
        JoinHandle { shared }
    }

    /// Synchronously park the calling thread until `future` completes,
    /// driving it directly rather than via the event-loop thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = Box::pin(future);
        let parker = Arc::new(Parker::default());
        let waker = waker::parker_waker(parker.clone());
        let mut cx = TaskContext::from_waker(&waker);
        loop {
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(value) => return value,
                Poll::Pending => parker.park(),
            }
        }
    }

    /// Mark the executor as quitting; the event loop exits once the ready
    /// queue drains and no task remains outstanding. Blocks the calling
    /// thread until that happens — "attempting to deinit the task
    /// subsystem while tasks remain blocks until they drain".
    pub fn shutdown(&self) {
        self.inner.should_quit.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
        if let Some(handle) = self.loop_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_event_loop(inner: Arc<ExecutorInner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if inner.should_quit.load(Ordering::SeqCst) && inner.running_tasks.load(Ordering::SeqCst) == 0 {
                    break None;
                }
                queue = inner.condvar.wait(queue).unwrap();
            }
        };
        let Some(task) = task else {
            break;
        };
        // Reset before polling: any wake that fires during this very poll
        // must still cause exactly one re-enqueue.
        task.queued.store(false, Ordering::SeqCst);
        let waker = waker_for(task.clone());
        let mut cx = TaskContext::from_waker(&waker);
        let mut slot = task.future.lock().unwrap();
        if let Some(mut fut) = slot.take() {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    inner.running_tasks.fetch_sub(1, Ordering::SeqCst);
                }
                Poll::Pending => {
                    *slot = Some(fut);
                }
            }
        }
    }
}

struct JoinShared<T> {
    result: Mutex<Option<T>>,
    waker: Mutex<Option<std::task::Waker>>,
}

/// A handle to a task's eventual result, obtained from `enqueue`. Dropping
/// this handle does not cancel the task: the task is independently owned by
/// the executor's ready queue and is driven to completion regardless.
pub struct JoinHandle<T> {
    shared: Arc<JoinShared<T>>,
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<T> {
        let mut result = self.shared.result.lock().unwrap();
        if let Some(value) = result.take() {
            return Poll::Ready(value);
        }
        *self.shared.waker.lock().unwrap() = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[derive(Default)]
pub(crate) struct Parker {
    unparked: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Parker {
    fn park(&self) {
        let guard = self.mutex.lock().unwrap();
        let _guard = self
            .condvar
            .wait_while(guard, |_| !self.unparked.swap(false, Ordering::SeqCst))
            .unwrap();
    }

    pub(crate) fn unpark(&self) {
        self.unparked.store(true, Ordering::SeqCst);
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn block_on_resolves_ready_future() {
        let executor = TaskExecutor::new();
        let value = executor.block_on(async { 1 + 1 });
        assert_eq!(value, 2);
        executor.shutdown();
    }

    #[test]
    fn enqueue_runs_on_event_loop_and_join_handle_resolves() {
        let executor = TaskExecutor::new();
        let handle = executor.enqueue(async { 21 * 2 });
        let result = executor.block_on(handle);
        assert_eq!(result, 42);
        executor.shutdown();
    }

    #[test]
    fn dropped_join_handle_does_not_stop_the_task() {
        let executor = TaskExecutor::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_for_task = counter.clone();
        {
            // JoinHandle is dropped immediately; the task must still run to
            // completion on the event loop.
            let _ = executor.enqueue(async move {
                counter_for_task.store(1, Ordering::SeqCst);
            });
        }
        for _ in 0..10_000 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        executor.shutdown();
    }

    #[test]
    fn waking_twice_before_repoll_enqueues_once() {
        use std::task::Waker;
        let executor = TaskExecutor::new();
        let polls = Arc::new(AtomicU32::new(0));
        let polls_for_task = polls.clone();
        let stored_waker: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
        let stored_for_task = stored_waker.clone();

        let handle = executor.enqueue(async move {
            std::future::poll_fn(move |cx| {
                let n = polls_for_task.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    *stored_for_task.lock().unwrap() = Some(cx.waker().clone());
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            })
            .await
        });

        let waker = loop {
            if let Some(w) = stored_waker.lock().unwrap().clone() {
                break w;
            }
            std::thread::yield_now();
        };
        waker.wake_by_ref();
        waker.wake_by_ref();
        executor.block_on(handle);
        // First poll (Pending) + exactly one re-poll triggered by the two
        // coalesced wakes.
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        executor.shutdown();
    }
}
