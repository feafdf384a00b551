//! Test utilities for backflow unit tests.
//!
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A runner that drives a [`LocalRuntime`] for async tests
//! - Recording sources and sinks that log every hook invocation

use crate::error::{Error, Result};
use crate::readable::{ReadableStreamDefaultController, UnderlyingSource};
use crate::runtime::{LocalRuntime, Scheduler};
use crate::step::{self, StepFuture};
use crate::writable::{UnderlyingSink, WritableStreamDefaultController};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that mutate env vars.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Runs `f` on a fresh runtime, handing it the runtime's scheduler.
pub(crate) fn run_test<F, Fut, T>(f: F) -> T
where
    F: FnOnce(Scheduler) -> Fut,
    Fut: Future<Output = T>,
{
    init_test_logging();
    let runtime = LocalRuntime::new();
    let scheduler = runtime.scheduler();
    runtime.block_on(f(scheduler))
}

/// Yields to the executor `n` times so spawned steps can settle.
pub(crate) async fn settle(n: usize) {
    for _ in 0..n {
        futures_lite::future::yield_now().await;
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Shared log of hook invocations.
pub(crate) type CallLog = Rc<RefCell<Vec<String>>>;

/// Source that enqueues a fixed list of chunks from `start`, then closes.
pub(crate) struct ListSource<T> {
    pub(crate) chunks: Vec<T>,
    pub(crate) close: bool,
    pub(crate) log: CallLog,
}

impl<T: 'static> UnderlyingSource<T> for ListSource<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        self.log.borrow_mut().push("start".into());
        for chunk in self.chunks.drain(..) {
            if let Err(e) = controller.enqueue(chunk) {
                return step::fail(e);
            }
        }
        if self.close {
            if let Err(e) = controller.close() {
                return step::fail(e);
            }
        }
        step::done()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        self.log.borrow_mut().push("pull".into());
        step::done()
    }

    fn cancel(&mut self, reason: Error) -> StepFuture {
        self.log.borrow_mut().push(format!("cancel:{}", reason.message().unwrap_or("")));
        step::done()
    }
}

/// Sink that records `write`/`close`/`abort` calls and can fail writes.
pub(crate) struct RecordingSink {
    pub(crate) log: CallLog,
    pub(crate) fail_writes: Option<Error>,
}

impl RecordingSink {
    pub(crate) fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_writes: None,
        }
    }
}

impl<T: std::fmt::Debug + 'static> UnderlyingSink<T> for RecordingSink {
    fn write(&mut self, chunk: T, _controller: &WritableStreamDefaultController) -> StepFuture {
        self.log.borrow_mut().push(format!("write:{chunk:?}"));
        self.fail_writes.clone().map_or_else(step::done, step::fail)
    }

    fn close(&mut self) -> StepFuture {
        self.log.borrow_mut().push("close".into());
        step::done()
    }

    fn abort(&mut self, reason: Error) -> StepFuture {
        self.log.borrow_mut().push(format!("abort:{}", reason.message().unwrap_or("")));
        step::done()
    }
}

/// Unwraps a `Result` produced inside a test, logging the error first.
pub(crate) fn ok<T>(result: Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{what} failed: {e}"),
    }
}
