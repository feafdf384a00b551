//! Waker implementation with deduplication.
//!
//! Wakers record the woken task in a shared queue and unpark the thread
//! blocked in [`LocalRuntime::block_on`](super::LocalRuntime::block_on), so a
//! waker may be invoked from any thread even though tasks themselves are
//! `!Send`.
//!
//! Note: This implementation uses safe Rust only (no unsafe).

use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::thread::Thread;

/// Identifier of a task owned by a [`LocalRuntime`](super::LocalRuntime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// The future passed to `block_on`.
    pub const MAIN: Self = Self(0);

    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Shared state for the waker system.
#[derive(Debug, Default)]
pub struct WakerState {
    /// Tasks that have been woken.
    woken: Mutex<Vec<TaskId>>,
    /// Thread to unpark on wake, if one is blocked.
    parked: Mutex<Option<Thread>>,
}

impl WakerState {
    /// Creates a new waker state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a waker for a specific task.
    #[must_use]
    pub fn waker_for(self: &Arc<Self>, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            state: Arc::clone(self),
            task,
        }))
    }

    /// Drains all woken tasks in wake order.
    pub fn drain_woken(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.woken.lock())
    }

    /// Returns true if any tasks have been woken.
    #[must_use]
    pub fn has_woken(&self) -> bool {
        !self.woken.lock().is_empty()
    }

    /// Registers the thread that should be unparked by later wakes.
    pub fn set_parked_thread(&self, thread: Option<Thread>) {
        *self.parked.lock() = thread;
    }

    pub(crate) fn wake(&self, task: TaskId) {
        {
            let mut woken = self.woken.lock();
            if woken.contains(&task) {
                return;
            }
            woken.push(task);
        }
        if let Some(thread) = self.parked.lock().as_ref() {
            thread.unpark();
        }
    }
}

/// A waker for a specific task.
struct TaskWaker {
    state: Arc<WakerState>,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.state.wake(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.state.wake(self.task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_and_drain() {
        let state = Arc::new(WakerState::new());
        let waker = state.waker_for(TaskId::new(1));

        waker.wake_by_ref();

        assert!(state.has_woken());
        assert_eq!(state.drain_woken(), vec![TaskId::new(1)]);
        assert!(state.drain_woken().is_empty());
    }

    #[test]
    fn dedup_multiple_wakes() {
        let state = Arc::new(WakerState::new());
        let waker = state.waker_for(TaskId::new(1));

        waker.wake_by_ref();
        waker.wake_by_ref();
        waker.wake();

        assert_eq!(state.drain_woken().len(), 1);
    }

    #[test]
    fn preserves_wake_order() {
        let state = Arc::new(WakerState::new());
        state.waker_for(TaskId::new(3)).wake();
        state.waker_for(TaskId::MAIN).wake();
        state.waker_for(TaskId::new(2)).wake();

        assert_eq!(
            state.drain_woken(),
            vec![TaskId::new(3), TaskId::MAIN, TaskId::new(2)]
        );
    }
}
