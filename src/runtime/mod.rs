//! Scheduling seam between the stream engine and its host.
//!
//! The engine never drives futures itself. Every user step (start, pull,
//! write, close, abort, cancel, transform, flush) is handed to a
//! [`Scheduler`] as a local task, and the task calls back into the stream
//! once the step settles. Hosts plug in their own executor by implementing
//! [`Schedule`]; [`LocalRuntime`] is a small single-threaded executor for
//! programs and tests that have none.
//!
//! - [`waker`]: Waker implementation with deduplication
//! - [`local`]: The single-threaded [`LocalRuntime`]
//!
//! # Example
//!
//! ```
//! use backflow::runtime::LocalRuntime;
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let runtime = LocalRuntime::new();
//! let scheduler = runtime.scheduler();
//! let ran = Rc::new(Cell::new(false));
//! let flag = Rc::clone(&ran);
//! scheduler.spawn(async move { flag.set(true) });
//! runtime.run_until_stalled();
//! assert!(ran.get());
//! assert_eq!(runtime.block_on(async { 7 }), 7);
//! ```

pub mod local;
pub mod waker;

pub use local::LocalRuntime;
pub use waker::TaskId;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// A type-erased, thread-local task.
pub type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

/// An executor that can run `!Send` tasks on the current thread.
///
/// Implementations must not poll the task from inside `spawn_local`; the
/// engine may call it while it is mid-transition.
pub trait Schedule {
    /// Queues `task` to be polled to completion.
    fn spawn_local(&self, task: LocalTask);
}

/// Cloneable handle to a [`Schedule`] implementation.
///
/// Every stream stores one; user steps are spawned through it.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<dyn Schedule>,
}

impl Scheduler {
    /// Wraps a scheduler implementation.
    #[must_use]
    pub fn new(schedule: impl Schedule + 'static) -> Self {
        Self {
            inner: Rc::new(schedule),
        }
    }

    /// Spawns a future on the underlying executor.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.inner.spawn_local(Box::pin(future));
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}
