//! Single-threaded executor for `!Send` tasks.
//!
//! Tasks live in a map owned by the runtime. A task is removed from the map
//! while it is polled, so it may spawn further tasks (or wake itself)
//! without re-entering the map borrow.

use super::waker::{TaskId, WakerState};
use super::{LocalTask, Schedule, Scheduler};
use crate::tracing_compat::trace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};

struct Tasks {
    tasks: RefCell<HashMap<TaskId, LocalTask>>,
    next_id: Cell<u64>,
    wakers: Arc<WakerState>,
}

impl Tasks {
    fn spawn(&self, task: LocalTask) -> TaskId {
        let id = TaskId::new(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.tasks.borrow_mut().insert(id, task);
        self.wakers.wake(id);
        trace!(task_id = id.as_u64(), "task spawned");
        id
    }

    fn poll_task(&self, id: TaskId) {
        let task = self.tasks.borrow_mut().remove(&id);
        let Some(mut task) = task else {
            return;
        };
        let waker = self.wakers.waker_for(id);
        let mut cx = Context::from_waker(&waker);
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                trace!(task_id = id.as_u64(), "task completed");
            }
            Poll::Pending => {
                self.tasks.borrow_mut().insert(id, task);
            }
        }
    }
}

/// [`Schedule`] implementation handed out by [`LocalRuntime::scheduler`].
///
/// Holds a weak reference; tasks spawned after the runtime is dropped are
/// discarded.
struct LocalSpawner {
    tasks: Weak<Tasks>,
}

impl Schedule for LocalSpawner {
    fn spawn_local(&self, task: LocalTask) {
        if let Some(tasks) = self.tasks.upgrade() {
            tasks.spawn(task);
        } else {
            trace!("runtime dropped, discarding task");
        }
    }
}

/// A single-threaded executor.
///
/// ```
/// use backflow::LocalRuntime;
///
/// let runtime = LocalRuntime::new();
/// runtime.spawn(async { /* background work */ });
/// runtime.run_until_stalled();
/// assert_eq!(runtime.pending_tasks(), 0);
/// let out = runtime.block_on(async { 1 + 1 });
/// assert_eq!(out, 2);
/// ```
pub struct LocalRuntime {
    tasks: Rc<Tasks>,
}

impl LocalRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Rc::new(Tasks {
                tasks: RefCell::new(HashMap::new()),
                // 0 is reserved for the `block_on` future.
                next_id: Cell::new(1),
                wakers: Arc::new(WakerState::new()),
            }),
        }
    }

    /// Returns a scheduler handle that spawns onto this runtime.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(LocalSpawner {
            tasks: Rc::downgrade(&self.tasks),
        })
    }

    /// Spawns a task; it first runs on the next `block_on` or
    /// `run_until_stalled` call.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> TaskId {
        self.tasks.spawn(Box::pin(future))
    }

    /// Returns the number of tasks that have not completed.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.tasks.tasks.borrow().len()
    }

    /// Polls woken tasks until none are left to run.
    ///
    /// Returns the number of task polls performed.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            let woken = self.tasks.wakers.drain_woken();
            if woken.is_empty() {
                return polls;
            }
            for id in woken {
                if id != TaskId::MAIN {
                    self.tasks.poll_task(id);
                    polls += 1;
                }
            }
        }
    }

    /// Runs `future` to completion, polling spawned tasks while it waits.
    ///
    /// When neither the future nor any task can make progress the thread
    /// parks until a waker fires.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);
        let wakers = &self.tasks.wakers;
        wakers.set_parked_thread(Some(std::thread::current()));
        let main_waker = wakers.waker_for(TaskId::MAIN);
        let mut main_ready = true;

        let output = loop {
            if main_ready {
                main_ready = false;
                let mut cx = Context::from_waker(&main_waker);
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    break output;
                }
            }

            let woken = wakers.drain_woken();
            if woken.is_empty() {
                std::thread::park();
                continue;
            }
            for id in woken {
                if id == TaskId::MAIN {
                    main_ready = true;
                } else {
                    self.tasks.poll_task(id);
                }
            }
        };

        wakers.set_parked_thread(None);
        output
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
