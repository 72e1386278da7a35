//! The waker implementation backing every task on the executor.
//!
//! A waker is a reference-counted capability with `clone`/`drop`/`wake`/
//! `wake_and_drop`. We build it directly on `std::task::{RawWaker,
//! RawWakerVTable}` over an `Arc<TaskSlot>`, the same "one allocation, many
//! owners" shape the teacher uses for `Arc<dyn Executor>` in
//! `ExecutorRegistry`.

use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use super::task::TaskSlot;
use super::Parker;

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    let slot = ManuallyDrop::new(Arc::from_raw(data as *const TaskSlot));
    std::mem::forget(Arc::clone(&slot));
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_raw(data: *const ()) {
    let slot = Arc::from_raw(data as *const TaskSlot);
    slot.schedule();
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let slot = ManuallyDrop::new(Arc::from_raw(data as *const TaskSlot));
    slot.schedule();
}

unsafe fn drop_raw(data: *const ()) {
    drop(Arc::from_raw(data as *const TaskSlot));
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

pub fn waker_for(slot: Arc<TaskSlot>) -> Waker {
    let raw = RawWaker::new(Arc::into_raw(slot) as *const (), &VTABLE);
    // Safety: the vtable above upholds the `Waker` contract (clone bumps the
    // refcount, drop releases it, wake(_by_ref) enqueues the task at most
    // once per idle->ready transition via `TaskSlot::schedule`).
    unsafe { Waker::from_raw(raw) }
}

/// Idempotence check used by tests: calling `wake` twice in a row before the
/// task is polled again must not enqueue it twice.
pub fn queued(slot: &TaskSlot) -> bool {
    slot.queued.load(Ordering::SeqCst)
}

unsafe fn parker_clone_raw(data: *const ()) -> RawWaker {
    let parker = ManuallyDrop::new(Arc::from_raw(data as *const Parker));
    std::mem::forget(Arc::clone(&parker));
    RawWaker::new(data, &PARKER_VTABLE)
}

unsafe fn parker_wake_raw(data: *const ()) {
    let parker = Arc::from_raw(data as *const Parker);
    parker.unpark();
}

unsafe fn parker_wake_by_ref_raw(data: *const ()) {
    let parker = ManuallyDrop::new(Arc::from_raw(data as *const Parker));
    parker.unpark();
}

unsafe fn parker_drop_raw(data: *const ()) {
    drop(Arc::from_raw(data as *const Parker));
}

static PARKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(parker_clone_raw, parker_wake_raw, parker_wake_by_ref_raw, parker_drop_raw);

/// A waker that unparks a `block_on` caller's thread instead of rescheduling
/// onto the event-loop queue.
pub fn parker_waker(parker: Arc<Parker>) -> Waker {
    let raw = RawWaker::new(Arc::into_raw(parker) as *const (), &PARKER_VTABLE);
    unsafe { Waker::from_raw(raw) }
}
