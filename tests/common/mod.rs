#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use backflow::step::{self, StepFuture};
use backflow::{
    Error, LocalRuntime, ReadableStreamDefaultController, Result, Scheduler, UnderlyingSink,
    UnderlyingSource, WritableStreamDefaultController,
};
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "BACKFLOW_PROPTEST_SEED";
const PROPTEST_MAX_SHRINK_ITERS_ENV: &str = "BACKFLOW_PROPTEST_MAX_SHRINK_ITERS";

/// Configuration for property tests with optional deterministic seed support.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Fixed seed for reproducibility (overrides CI default when set).
    pub seed: Option<u64>,
    /// Number of successful cases required.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl PropertyTestConfig {
    /// Build a config with defaults for property tests.
    #[must_use]
    pub fn new(cases: u32) -> Self {
        Self {
            seed: read_proptest_seed(),
            cases,
            max_shrink_iters: read_max_shrink_iters()
                .unwrap_or(ProptestConfig::default().max_shrink_iters),
        }
    }

    /// Convert into a ProptestConfig, applying deterministic seed rules.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        let mut config = ProptestConfig::with_cases(self.cases);

        // Honor existing PROPTEST_RNG_SEED, otherwise apply our own.
        if matches!(config.rng_seed, RngSeed::Random) {
            if let Some(seed) = self.seed {
                config.rng_seed = RngSeed::Fixed(seed);
            }
        }

        config.max_shrink_iters = self.max_shrink_iters;
        config
    }
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    PropertyTestConfig::new(cases).to_proptest_config()
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }

    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }

    None
}

fn read_max_shrink_iters() -> Option<u32> {
    std::env::var(PROPTEST_MAX_SHRINK_ITERS_ENV)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Run async test code on a fresh [`LocalRuntime`], handing it the scheduler.
pub fn run_test<F, Fut, T>(f: F) -> T
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
pub async fn settle(n: usize) {
    for _ in 0..n {
        futures_lite::future::yield_now().await;
    }
}

/// Unwraps a `Result`, naming the operation on failure.
pub fn ok<T>(result: Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{what} failed: {e}"),
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
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
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
pub type CallLog = Rc<RefCell<Vec<String>>>;

/// Returns the entries of `log` that start with `prefix`.
pub fn entries(log: &CallLog, prefix: &str) -> Vec<String> {
    log.borrow()
        .iter()
        .filter(|entry| entry.starts_with(prefix))
        .cloned()
        .collect()
}

/// Source that hands its controller to the test and logs every hook.
pub struct ManualSource<T: 'static> {
    /// Filled in by `start`.
    pub controller: Rc<RefCell<Option<ReadableStreamDefaultController<T>>>>,
    /// Hook invocations.
    pub log: CallLog,
}

impl<T: 'static> ManualSource<T> {
    /// A source plus the handles the test keeps.
    #[must_use]
    pub fn new() -> (
        Self,
        Rc<RefCell<Option<ReadableStreamDefaultController<T>>>>,
        CallLog,
    ) {
        let controller = Rc::new(RefCell::new(None));
        let log = CallLog::default();
        (
            Self {
                controller: Rc::clone(&controller),
                log: Rc::clone(&log),
            },
            controller,
            log,
        )
    }
}

impl<T: 'static> UnderlyingSource<T> for ManualSource<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        *self.controller.borrow_mut() = Some(controller.clone());
        step::done()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        self.log.borrow_mut().push("pull".into());
        step::done()
    }

    fn cancel(&mut self, reason: Error) -> StepFuture {
        self.log
            .borrow_mut()
            .push(format!("cancel:{}", reason.message().unwrap_or("")));
        step::done()
    }
}

/// Sink that records every hook and optionally fails each write.
pub struct LoggingSink {
    /// Hook invocations.
    pub log: CallLog,
    /// Error every write fails with.
    pub fail_writes: Option<Error>,
}

impl LoggingSink {
    /// A sink that accepts every write.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_writes: None,
        }
    }

    /// A sink whose writes all fail with `error`.
    #[must_use]
    pub fn failing(log: CallLog, error: Error) -> Self {
        Self {
            log,
            fail_writes: Some(error),
        }
    }
}

impl<T: std::fmt::Debug + 'static> UnderlyingSink<T> for LoggingSink {
    fn write(&mut self, chunk: T, _controller: &WritableStreamDefaultController) -> StepFuture {
        self.log.borrow_mut().push(format!("write:{chunk:?}"));
        self.fail_writes.clone().map_or_else(step::done, step::fail)
    }

    fn close(&mut self) -> StepFuture {
        self.log.borrow_mut().push("close".into());
        step::done()
    }

    fn abort(&mut self, reason: Error) -> StepFuture {
        self.log
            .borrow_mut()
            .push(format!("abort:{}", reason.message().unwrap_or("")));
        step::done()
    }
}

/// Enqueues `0..count` one chunk per pull, yielding before each, then closes.
pub struct CountingSource {
    next: u32,
    count: u32,
}

impl CountingSource {
    /// A source producing `0..count`.
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self { next: 0, count }
    }
}

impl UnderlyingSource<u32> for CountingSource {
    fn pull(&mut self, controller: &ReadableStreamDefaultController<u32>) -> StepFuture {
        let controller = controller.clone();
        let value = self.next;
        let last = value >= self.count;
        self.next += 1;
        step::boxed(async move {
            futures_lite::future::yield_now().await;
            if last {
                controller.close()
            } else {
                controller.enqueue(value)
            }
        })
    }
}

/// Sink that logs each write after yielding a few times.
pub struct SlowSink {
    /// Hook invocations.
    pub log: CallLog,
}

impl SlowSink {
    /// A sink logging into `log`.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

impl<T: std::fmt::Debug + 'static> UnderlyingSink<T> for SlowSink {
    fn write(&mut self, chunk: T, _controller: &WritableStreamDefaultController) -> StepFuture {
        let log = Rc::clone(&self.log);
        step::boxed(async move {
            settle(3).await;
            log.borrow_mut().push(format!("write:{chunk:?}"));
            Ok(())
        })
    }

    fn close(&mut self) -> StepFuture {
        self.log.borrow_mut().push("close".into());
        step::done()
    }
}
