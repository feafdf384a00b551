//! Pull-based readable streams.
//!
//! A [`ReadableStream`] is a state machine over
//! {[`Readable`](ReadableState::Readable), [`Closed`](ReadableState::Closed),
//! [`Errored`](ReadableState::Errored)} driven by one of three controllers:
//!
//! - [`ReadableStreamDefaultController`]: a size-accounted queue of arbitrary
//!   chunks, filled by an [`UnderlyingSource`]
//! - [`ReadableByteStreamController`]: a byte queue that can fill
//!   caller-supplied buffers ([`ReadableStreamBYOBReader`])
//! - [`DirectController`]: a lazily started byte producer whose output goes
//!   straight to the waiting reader
//!
//! ```text
//!            enqueue()            read()
//!  source ──────────────▶ queue ──────────▶ reader
//!     ▲                     │
//!     └──── pull() ◀────────┘  (demand or desired_size > 0)
//! ```
//!
//! All three funnel into the same close and error transitions, so readers
//! observe identical terminal behavior whichever controller is in use.

pub mod byte;
pub mod controller;
pub mod direct;
pub mod reader;
mod tee;
pub mod values;

pub use byte::{ByobRequest, ByteStreamOptions, ReadableByteStreamController, UnderlyingByteSource};
pub use controller::ReadableStreamDefaultController;
pub use direct::{DirectController, DirectSource};
pub use reader::{ByobReadResult, ReadableStreamBYOBReader, ReadableStreamDefaultReader};
pub use values::{ReadableStreamValues, ValuesOptions};

use crate::config::StreamConfig;
use crate::deferred::{deferred, Completion, Deferred, Signal};
use crate::error::{Error, Result};
use crate::queue::QueuingStrategy;
use crate::runtime::Scheduler;
use crate::step::{self, StepFuture};
use crate::tracing_compat::{debug, trace};
use byte::{ByteControllerState, PullIntoDescriptor};
use controller::DefaultControllerState;
use direct::DirectControllerState;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

/// Lifecycle state of a readable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    /// Chunks may still be read.
    Readable,
    /// End of stream reached. Terminal.
    Closed,
    /// The stream failed with a stored error. Terminal.
    Errored,
}

/// User hooks backing a [`ReadableStream`].
///
/// Every hook is optional. Hooks are called from scheduler tasks, never
/// while the engine is mid-transition, so they may call back into the
/// controller synchronously.
pub trait UnderlyingSource<T>: 'static {
    /// Called once at construction. Pulls wait until it settles.
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        let _ = controller;
        step::done()
    }

    /// Called when the stream wants more data. Never overlaps itself.
    fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        let _ = controller;
        step::done()
    }

    /// Called at most once when a consumer cancels the stream.
    fn cancel(&mut self, reason: Error) -> StepFuture {
        let _ = reason;
        step::done()
    }
}

pub(crate) type Shared<T> = Rc<RefCell<ReadableInner<T>>>;

/// Deferred cancel hook taken out of a controller.
pub(crate) type CancelStep = Box<dyn FnOnce(Error) -> StepFuture>;

/// Controller-specific read entry point.
pub(crate) type PullSteps<T> = fn(&mut ReadableInner<T>, Deferred<Option<T>>);

pub(crate) enum ReadRequests<T> {
    Default(VecDeque<Deferred<Option<T>>>),
    Byob(VecDeque<Deferred<ByobReadResult>>),
}

pub(crate) struct ReaderSlot<T> {
    pub(crate) id: u64,
    pub(crate) closed: Signal,
    pub(crate) requests: ReadRequests<T>,
}

pub(crate) enum ControllerState<T> {
    Default(DefaultControllerState<T>),
    Byte(ByteControllerState),
    Direct(DirectControllerState),
}

impl<T: 'static> ControllerState<T> {
    fn desired_size(&self) -> f64 {
        match self {
            Self::Default(c) => c.queue.desired_size(c.high_water_mark),
            Self::Byte(c) => c.desired_size(),
            Self::Direct(c) => c.desired_size(),
        }
    }

    /// Chunks a read can take without waiting on the source.
    pub(crate) fn queued_chunks(&self) -> usize {
        match self {
            Self::Default(c) => c.queue.len(),
            Self::Byte(c) => c.queue.len(),
            Self::Direct(c) => c.queued_chunks(),
        }
    }

    fn reset_queue(&mut self) {
        match self {
            Self::Default(c) => c.queue.reset(),
            Self::Byte(c) => c.reset_queue(),
            Self::Direct(c) => c.reset_queue(),
        }
    }

    pub(crate) fn clear_algorithms(&mut self) {
        match self {
            Self::Default(c) => c.source = None,
            Self::Byte(c) => c.source = None,
            Self::Direct(c) => c.source = None,
        }
    }

    fn take_cancel_step(&mut self) -> Option<CancelStep> {
        match self {
            Self::Default(c) => c.source.take().map(|source| -> CancelStep {
                Box::new(move |reason| {
                    let step = source.borrow_mut().cancel(reason);
                    step
                })
            }),
            Self::Byte(c) => c.source.take().map(|source| -> CancelStep {
                Box::new(move |reason| {
                    let step = source.borrow_mut().cancel(reason);
                    step
                })
            }),
            Self::Direct(c) => c.source.take().map(|source| -> CancelStep {
                Box::new(move |reason| {
                    let step = source.borrow_mut().cancel(reason);
                    step
                })
            }),
        }
    }

    fn take_pull_intos(&mut self) -> VecDeque<PullIntoDescriptor> {
        match self {
            Self::Default(_) => VecDeque::new(),
            Self::Byte(c) => std::mem::take(&mut c.pending_pull_intos),
            Self::Direct(c) => std::mem::take(&mut c.pending_pull_intos),
        }
    }

    fn release_steps(&mut self) {
        match self {
            Self::Default(_) => {}
            Self::Byte(c) => c.release_steps(),
            Self::Direct(c) => c.pending_pull_intos.clear(),
        }
    }
}

/// Shared state behind every handle of one readable stream.
pub(crate) struct ReadableInner<T> {
    pub(crate) state: ReadableState,
    pub(crate) stored_error: Option<Error>,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<ReaderSlot<T>>,
    next_reader_id: u64,
    pub(crate) controller: ControllerState<T>,
    pub(crate) pull_steps: PullSteps<T>,
    pub(crate) scheduler: Scheduler,
    pub(crate) this: Weak<RefCell<ReadableInner<T>>>,
}

impl<T: 'static> ReadableInner<T> {
    fn create(
        scheduler: &Scheduler,
        controller: ControllerState<T>,
        pull_steps: PullSteps<T>,
    ) -> Shared<T> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                state: ReadableState::Readable,
                stored_error: None,
                disturbed: false,
                reader: None,
                next_reader_id: 0,
                controller,
                pull_steps,
                scheduler: scheduler.clone(),
                this: this.clone(),
            })
        })
    }

    pub(crate) fn locked(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn stored_error(&self) -> Error {
        self.stored_error
            .clone()
            .unwrap_or_else(|| Error::internal("errored stream has no stored error"))
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReadRequests::Default(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn num_read_into_requests(&self) -> usize {
        match &self.reader {
            Some(ReaderSlot {
                requests: ReadRequests::Byob(requests),
                ..
            }) => requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn has_default_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderSlot {
                requests: ReadRequests::Default(_),
                ..
            })
        )
    }

    pub(crate) fn has_byob_reader(&self) -> bool {
        matches!(
            self.reader,
            Some(ReaderSlot {
                requests: ReadRequests::Byob(_),
                ..
            })
        )
    }

    pub(crate) fn add_read_request(&mut self, request: Deferred<Option<T>>) {
        match &mut self.reader {
            Some(ReaderSlot {
                requests: ReadRequests::Default(requests),
                ..
            }) => requests.push_back(request),
            _ => request.reject(Error::internal("read request without a default reader")),
        }
    }

    pub(crate) fn add_read_into_request(&mut self, request: Deferred<ByobReadResult>) {
        match &mut self.reader {
            Some(ReaderSlot {
                requests: ReadRequests::Byob(requests),
                ..
            }) => requests.push_back(request),
            _ => request.reject(Error::internal("read-into request without a BYOB reader")),
        }
    }

    /// Hands `chunk` to the oldest pending read. Gives it back if there is none.
    pub(crate) fn fulfill_read_request(&mut self, chunk: T) -> Option<T> {
        if let Some(ReaderSlot {
            requests: ReadRequests::Default(requests),
            ..
        }) = &mut self.reader
        {
            if let Some(request) = requests.pop_front() {
                request.resolve(Some(chunk));
                return None;
            }
        }
        Some(chunk)
    }

    /// Hands `buffer` to the oldest pending BYOB read. Gives it back if there is none.
    pub(crate) fn fulfill_read_into_request(
        &mut self,
        buffer: Vec<u8>,
        done: bool,
    ) -> Option<Vec<u8>> {
        if let Some(ReaderSlot {
            requests: ReadRequests::Byob(requests),
            ..
        }) = &mut self.reader
        {
            if let Some(request) = requests.pop_front() {
                request.resolve(ByobReadResult { buffer, done });
                return None;
            }
        }
        Some(buffer)
    }

    /// Readable → Closed. Pending reads resolve as done.
    pub(crate) fn close(&mut self) {
        if self.state != ReadableState::Readable {
            return;
        }
        self.state = ReadableState::Closed;
        debug!("readable stream closed");
        let mut pull_intos = self.controller.take_pull_intos();
        let Some(slot) = self.reader.as_mut() else {
            return;
        };
        match &mut slot.requests {
            ReadRequests::Default(requests) => {
                for request in requests.drain(..) {
                    request.resolve(None);
                }
            }
            ReadRequests::Byob(requests) => {
                for request in requests.drain(..) {
                    let buffer = pull_intos
                        .pop_front()
                        .map(PullIntoDescriptor::into_filled)
                        .unwrap_or_default();
                    request.resolve(ByobReadResult { buffer, done: true });
                }
            }
        }
        slot.closed.resolve();
    }

    /// Readable → Errored. Pending reads reject and the reader is detached.
    pub(crate) fn error(&mut self, error: Error) {
        if self.state != ReadableState::Readable {
            return;
        }
        debug!(reason = %error, "readable stream errored");
        self.state = ReadableState::Errored;
        self.stored_error = Some(error.clone());
        let Some(slot) = self.reader.take() else {
            return;
        };
        slot.closed.reject(error.clone());
        match slot.requests {
            ReadRequests::Default(requests) => {
                for request in requests {
                    request.reject(error.clone());
                }
            }
            ReadRequests::Byob(requests) => {
                for request in requests {
                    request.reject(error.clone());
                }
            }
        }
    }

    /// Errors the stream through its controller: the queue is dropped and
    /// the source hooks are released. No-op unless readable.
    pub(crate) fn error_controller(&mut self, error: Error) {
        if self.state != ReadableState::Readable {
            return;
        }
        self.controller.reset_queue();
        self.controller.clear_algorithms();
        self.error(error);
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state {
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0.0),
            ReadableState::Readable => Some(self.controller.desired_size()),
        }
    }

    pub(crate) fn attach_reader(&mut self, byob: bool) -> Result<(u64, Signal)> {
        if self.locked() {
            return Err(Error::locked("readable stream"));
        }
        let closed = match self.state {
            ReadableState::Readable => Signal::new(),
            ReadableState::Closed => Signal::resolved(),
            ReadableState::Errored => Signal::rejected(self.stored_error()),
        };
        self.next_reader_id += 1;
        let id = self.next_reader_id;
        let requests = if byob {
            ReadRequests::Byob(VecDeque::new())
        } else {
            ReadRequests::Default(VecDeque::new())
        };
        self.reader = Some(ReaderSlot {
            id,
            closed: closed.clone(),
            requests,
        });
        trace!(reader_id = id, byob, "reader attached");
        Ok((id, closed))
    }

    /// Detaches reader `id`, settling its pending reads with `Released`.
    pub(crate) fn detach_reader(&mut self, id: u64) {
        let slot = match self.reader.take() {
            Some(slot) if slot.id == id => slot,
            other => {
                self.reader = other;
                return;
            }
        };
        let released = Error::released("reader");
        match slot.requests {
            ReadRequests::Default(requests) => {
                for request in requests {
                    request.reject(released.clone());
                }
            }
            ReadRequests::Byob(requests) => {
                for request in requests {
                    request.reject(released.clone());
                }
            }
        }
        self.controller.release_steps();
        slot.closed.reject(released);
        trace!(reader_id = id, "reader released");
    }

    /// Cancels the stream: it closes immediately and the source's cancel
    /// hook runs once.
    pub(crate) fn cancel(&mut self, reason: Error) -> Completion<()> {
        self.disturbed = true;
        match self.state {
            ReadableState::Closed => return Completion::resolved(()),
            ReadableState::Errored => return Completion::rejected(self.stored_error()),
            ReadableState::Readable => {}
        }
        debug!(reason = %reason, "readable stream cancelled");
        self.close();
        self.controller.reset_queue();
        let cancel_step = self.controller.take_cancel_step();
        let (settle, completion) = deferred();
        self.scheduler.spawn(async move {
            let result = match cancel_step {
                Some(cancel_step) => cancel_step(reason).await,
                None => Ok(()),
            };
            settle.settle(result);
        });
        completion
    }
}

/// A pull-based stream of chunks.
///
/// Handles are cheap to clone and share state.
pub struct ReadableStream<T> {
    pub(crate) inner: Shared<T>,
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ReadableStream<T> {
    /// Creates a stream backed by `source`.
    ///
    /// Fails with `InvalidSize` if the strategy's high-water mark is
    /// negative or NaN.
    pub fn new(
        scheduler: &Scheduler,
        source: impl UnderlyingSource<T>,
        strategy: QueuingStrategy<T>,
    ) -> Result<Self> {
        let high_water_mark = strategy.validated_high_water_mark()?;
        let (_, size) = strategy.into_parts();
        let source: controller::SourceCell<T> = Rc::new(RefCell::new(Box::new(source)));
        let inner = ReadableInner::create(
            scheduler,
            ControllerState::Default(DefaultControllerState::new(
                high_water_mark,
                size,
                Rc::clone(&source),
            )),
            controller::pull_steps,
        );
        controller::start(&inner, source);
        Ok(Self { inner })
    }

    /// Creates a stream backed by `source` at the configured readable
    /// high-water mark.
    pub fn with_config(
        scheduler: &Scheduler,
        source: impl UnderlyingSource<T>,
        config: &StreamConfig,
    ) -> Result<Self> {
        Self::new(scheduler, source, config.readable_strategy())
    }

    /// Creates a stream that yields the items of `iter`, one per pull, then
    /// closes.
    pub fn from_iter<I>(scheduler: &Scheduler, iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        let source = IterSource {
            iter: iter.into_iter(),
        };
        let inner = ReadableInner::create(
            scheduler,
            ControllerState::Default(DefaultControllerState::new(
                0.0,
                None,
                Rc::new(RefCell::new(Box::new(source))),
            )),
            controller::pull_steps,
        );
        if let ControllerState::Default(c) = &mut inner.borrow_mut().controller {
            c.started = true;
        }
        Self { inner }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReadableState {
        self.inner.borrow().state
    }

    /// The error the stream failed with, if errored.
    #[must_use]
    pub fn stored_error(&self) -> Option<Error> {
        self.inner.borrow().stored_error.clone()
    }

    /// True while a reader holds the stream.
    #[must_use]
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked()
    }

    /// True once the stream has been read from or cancelled.
    #[must_use]
    pub fn is_disturbed(&self) -> bool {
        self.inner.borrow().disturbed
    }

    /// Acquires the exclusive default reader.
    pub fn get_reader(&self) -> Result<ReadableStreamDefaultReader<T>> {
        ReadableStreamDefaultReader::acquire(&self.inner)
    }

    /// Cancels an unlocked stream. Fails with `Locked` if a reader is active.
    pub fn cancel(&self, reason: Error) -> Completion<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.locked() {
            return Completion::rejected(Error::locked("readable stream"));
        }
        inner.cancel(reason)
    }

    /// Reads every remaining chunk into a vector.
    pub fn collect(&self) -> impl Future<Output = Result<Vec<T>>> + 'static {
        let reader = self.get_reader();
        async move {
            let reader = reader?;
            let mut chunks = Vec::new();
            while let Some(chunk) = reader.read().await? {
                chunks.push(chunk);
            }
            Ok(chunks)
        }
    }

    /// Locks the stream and iterates its chunks as a [`futures_lite::Stream`].
    ///
    /// Dropping the iterator early cancels the stream.
    pub fn values(&self) -> Result<ReadableStreamValues<T>> {
        self.values_with(ValuesOptions::default())
    }

    /// Like [`ReadableStream::values`], honoring `options.prevent_cancel`.
    pub fn values_with(&self, options: ValuesOptions) -> Result<ReadableStreamValues<T>> {
        Ok(ReadableStreamValues::new(self.get_reader()?, options))
    }

    /// Splits the stream into two branches that each see every chunk.
    ///
    /// The source is cancelled only after both branches are cancelled.
    pub fn tee(&self) -> Result<(Self, Self)>
    where
        T: Clone,
    {
        tee::tee(self)
    }
}

impl ReadableStream<Vec<u8>> {
    /// Creates a byte stream backed by `source`.
    pub fn new_bytes(
        scheduler: &Scheduler,
        source: impl UnderlyingByteSource,
        options: ByteStreamOptions,
    ) -> Result<Self> {
        byte::create(scheduler, source, options)
    }

    /// Creates a direct byte stream. `source.pull` runs once, on first read.
    ///
    /// `high_water_mark` is raised to the configured direct minimum.
    #[must_use]
    pub fn new_direct(scheduler: &Scheduler, source: impl DirectSource, high_water_mark: f64) -> Self {
        Self::new_direct_with_config(scheduler, source, high_water_mark, &StreamConfig::default())
    }

    /// Like [`ReadableStream::new_direct`], raising `high_water_mark` to
    /// `config.direct_min_high_water_mark`.
    #[must_use]
    pub fn new_direct_with_config(
        scheduler: &Scheduler,
        source: impl DirectSource,
        high_water_mark: f64,
        config: &StreamConfig,
    ) -> Self {
        direct::create(scheduler, source, high_water_mark, config.direct_min_high_water_mark)
    }

    /// Acquires the exclusive buffer-supplied reader.
    ///
    /// Fails with `InvalidState` for streams built with [`ReadableStream::new`].
    pub fn get_byob_reader(&self) -> Result<ReadableStreamBYOBReader> {
        ReadableStreamBYOBReader::acquire(&self.inner)
    }
}

impl<T> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadableStream")
            .field("state", &inner.state)
            .field("locked", &inner.reader.is_some())
            .field("disturbed", &inner.disturbed)
            .finish()
    }
}

struct IterSource<I> {
    iter: I,
}

impl<T, I> UnderlyingSource<T> for IterSource<I>
where
    T: 'static,
    I: Iterator<Item = T> + 'static,
{
    fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        let result = match self.iter.next() {
            Some(chunk) => controller.enqueue(chunk),
            None => controller.close(),
        };
        step::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, ok, run_test, settle, CallLog, ListSource};
    use crate::ErrorKind;

    fn list_stream(
        scheduler: &Scheduler,
        chunks: Vec<&'static str>,
        close: bool,
    ) -> (ReadableStream<&'static str>, CallLog) {
        let log = CallLog::default();
        let stream = ok(
            ReadableStream::new(
                scheduler,
                ListSource {
                    chunks,
                    close,
                    log: Rc::clone(&log),
                },
                QueuingStrategy::new(8.0),
            ),
            "create stream",
        );
        (stream, log)
    }

    #[test]
    fn rejects_invalid_high_water_mark() {
        init_test_logging();
        crate::test_phase!("rejects_invalid_high_water_mark");
        let runtime = crate::runtime::LocalRuntime::new();
        let err = ReadableStream::<u8>::new(
            &runtime.scheduler(),
            IterSource {
                iter: std::iter::empty(),
            },
            QueuingStrategy::new(-1.0),
        )
        .expect_err("negative hwm");
        assert_eq!(err.kind(), ErrorKind::InvalidSize);
        crate::test_complete!("rejects_invalid_high_water_mark");
    }

    #[test]
    fn second_reader_is_locked_out() {
        run_test(|scheduler| async move {
            let (stream, _) = list_stream(&scheduler, vec!["a"], true);
            let reader = ok(stream.get_reader(), "first reader");
            let err = stream.get_reader().expect_err("second reader");
            assert_eq!(err.kind(), ErrorKind::Locked);
            assert!(stream.locked());
            drop(reader);
            assert!(!stream.locked());
            let _again = ok(stream.get_reader(), "reader after release");
        });
    }

    #[test]
    fn cancel_while_locked_is_rejected() {
        run_test(|scheduler| async move {
            let (stream, log) = list_stream(&scheduler, vec![], false);
            let _reader = ok(stream.get_reader(), "reader");
            let err = stream
                .cancel(Error::reason("stop"))
                .await
                .expect_err("locked");
            assert_eq!(err.kind(), ErrorKind::Locked);
            settle(4).await;
            assert!(!log.borrow().iter().any(|entry| entry.starts_with("cancel")));
        });
    }

    #[test]
    fn cancel_twice_runs_hook_once() {
        run_test(|scheduler| async move {
            let (stream, log) = list_stream(&scheduler, vec!["a", "b"], false);
            settle(4).await;
            ok(stream.cancel(Error::reason("first")).await, "first cancel");
            ok(stream.cancel(Error::reason("second")).await, "second cancel");
            assert_eq!(stream.state(), ReadableState::Closed);
            assert!(stream.is_disturbed());
            let cancels: Vec<_> = log
                .borrow()
                .iter()
                .filter(|entry| entry.starts_with("cancel"))
                .cloned()
                .collect();
            assert_eq!(cancels, vec!["cancel:first".to_string()]);
        });
    }

    #[test]
    fn cancel_resolves_pending_reads_as_done() {
        run_test(|scheduler| async move {
            let (stream, _) = list_stream(&scheduler, vec![], false);
            let reader = ok(stream.get_reader(), "reader");
            let pending = reader.read();
            settle(4).await;
            ok(reader.cancel(Error::reason("bye")).await, "cancel");
            assert_eq!(ok(pending.await, "pending read"), None);
            assert!(reader.closed().await.is_ok());
        });
    }

    #[test]
    fn from_iter_yields_items_then_closes() {
        run_test(|scheduler| async move {
            let stream = ReadableStream::from_iter(&scheduler, vec![1, 2, 3]);
            let items = ok(stream.collect().await, "collect");
            assert_eq!(items, vec![1, 2, 3]);
            assert_eq!(stream.state(), ReadableState::Closed);
        });
    }

    #[test]
    fn debug_reports_state() {
        run_test(|scheduler| async move {
            let (stream, _) = list_stream(&scheduler, vec![], true);
            settle(4).await;
            let rendered = format!("{stream:?}");
            assert!(rendered.contains("Closed"));
        });
    }
}
