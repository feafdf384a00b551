//! Push-based writable streams.
//!
//! A [`WritableStream`] serializes chunks into an [`UnderlyingSink`]: at
//! most one `write` or `close` step is in flight, and chunks reach the sink
//! in the order they were written.
//!
//! ```text
//!            ┌──────────── abort / sink failure ───────────┐
//!            │                                             ▼
//!  Writable ─┴─▶ Erroring ── in-flight step settles ──▶ Errored
//!     │
//!     └── close() + queue drained + sink close ok ──▶ Closed
//! ```
//!
//! Failures move the stream to `Erroring` first: the in-flight step is
//! allowed to finish, then queued writes are rejected and the sink's
//! `abort` hook runs (for `abort()` only).

pub mod controller;
pub mod writer;

pub use controller::WritableStreamDefaultController;
pub use writer::WritableStreamDefaultWriter;

use crate::config::StreamConfig;
use crate::deferred::{deferred, Completion, Deferred, Signal};
use crate::error::{Error, Result};
use crate::queue::{QueuingStrategy, SizeFn, SizedQueue};
use crate::runtime::Scheduler;
use crate::step::{self, StepFuture};
use crate::tracing_compat::{debug, trace};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

/// Lifecycle state of a writable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    /// Accepting writes.
    Writable,
    /// Closed after the sink acknowledged close. Terminal.
    Closed,
    /// Failing; waiting for the in-flight step before becoming errored.
    Erroring,
    /// Failed with a stored error. Terminal.
    Errored,
}

/// User hooks behind a [`WritableStream`].
///
/// Every hook is optional. `write` and `close` never overlap.
pub trait UnderlyingSink<T>: 'static {
    /// Called once at construction. Writes wait until it settles.
    fn start(&mut self, controller: &WritableStreamDefaultController) -> StepFuture {
        let _ = controller;
        step::done()
    }

    /// Consumes one chunk.
    fn write(&mut self, chunk: T, controller: &WritableStreamDefaultController) -> StepFuture {
        let _ = (chunk, controller);
        step::done()
    }

    /// Called once after every queued chunk was written.
    fn close(&mut self) -> StepFuture {
        step::done()
    }

    /// Called once when the stream is aborted.
    fn abort(&mut self, reason: Error) -> StepFuture {
        let _ = reason;
        step::done()
    }
}

pub(crate) type Shared<T> = Rc<RefCell<WritableInner<T>>>;
pub(crate) type SinkCell<T> = Rc<RefCell<Box<dyn UnderlyingSink<T>>>>;

pub(crate) enum WriteRecord<T> {
    /// `None` once handed to the sink; the entry stays queued, and counted,
    /// until the write settles.
    Chunk(Option<T>),
    Close,
}

pub(crate) struct WriterSlot {
    pub(crate) id: u64,
    pub(crate) ready: Signal,
    pub(crate) closed: Signal,
}

pub(crate) struct PendingAbort {
    reason: Error,
    was_already_erroring: bool,
    waiters: Vec<Deferred<()>>,
}

impl PendingAbort {
    fn settle(self, result: &Result<()>) {
        for waiter in self.waiters {
            waiter.settle(result.clone());
        }
    }
}

pub(crate) struct WritableInner<T> {
    pub(crate) state: WritableState,
    pub(crate) stored_error: Option<Error>,
    pub(crate) writer: Option<WriterSlot>,
    next_writer_id: u64,
    write_requests: VecDeque<Deferred<()>>,
    in_flight_write: Option<Deferred<()>>,
    close_request: Option<Deferred<()>>,
    in_flight_close: Option<Deferred<()>>,
    pending_abort: Option<PendingAbort>,
    pub(crate) backpressure: bool,
    queue: SizedQueue<WriteRecord<T>>,
    high_water_mark: f64,
    pub(crate) size: Option<SizeFn<T>>,
    started: bool,
    /// `None` once the algorithms are cleared.
    sink: Option<SinkCell<T>>,
    scheduler: Scheduler,
    this: Weak<RefCell<WritableInner<T>>>,
}

impl<T: 'static> WritableInner<T> {
    pub(crate) fn stored_error(&self) -> Error {
        self.stored_error
            .clone()
            .unwrap_or_else(|| Error::internal("errored stream has no stored error"))
    }

    pub(crate) fn locked(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    /// Writable with nothing queued or in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == WritableState::Writable
            && self.queue.is_empty()
            && !self.has_operation_marked_in_flight()
            && !self.close_queued_or_in_flight()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn controller_desired_size(&self) -> f64 {
        self.queue.desired_size(self.high_water_mark)
    }

    /// What a writer reports: `None` while failing, `0` once closed.
    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.state {
            WritableState::Erroring | WritableState::Errored => None,
            WritableState::Closed => Some(0.0),
            WritableState::Writable => Some(self.controller_desired_size()),
        }
    }

    fn controller(&self) -> WritableStreamDefaultController {
        let target: Weak<dyn controller::ErrorTarget> = self.this.clone();
        WritableStreamDefaultController::new(target)
    }

    pub(crate) fn attach_writer(&mut self) -> Result<(u64, Signal, Signal)> {
        if self.locked() {
            return Err(Error::locked("writable stream"));
        }
        let (ready, closed) = match self.state {
            WritableState::Writable => {
                let ready = if !self.close_queued_or_in_flight() && self.backpressure {
                    Signal::new()
                } else {
                    Signal::resolved()
                };
                (ready, Signal::new())
            }
            WritableState::Erroring => (Signal::rejected(self.stored_error()), Signal::new()),
            WritableState::Closed => (Signal::resolved(), Signal::resolved()),
            WritableState::Errored => {
                let stored = self.stored_error();
                (Signal::rejected(stored.clone()), Signal::rejected(stored))
            }
        };
        self.next_writer_id += 1;
        let id = self.next_writer_id;
        self.writer = Some(WriterSlot {
            id,
            ready: ready.clone(),
            closed: closed.clone(),
        });
        trace!(writer_id = id, "writer attached");
        Ok((id, ready, closed))
    }

    /// Detaches writer `id`; its signals end up rejected with `Released`.
    pub(crate) fn detach_writer(&mut self, id: u64) -> Option<(Signal, Signal)> {
        let slot = match self.writer.take() {
            Some(slot) if slot.id == id => slot,
            other => {
                self.writer = other;
                return None;
            }
        };
        let released = Error::released("writer");
        let ready = reject_or_replace(slot.ready, &released);
        let closed = reject_or_replace(slot.closed, &released);
        trace!(writer_id = id, "writer released");
        Some((ready, closed))
    }

    pub(crate) fn abort(&mut self, reason: Error) -> Completion<()> {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return Completion::resolved(());
        }
        let (waiter, completion) = deferred();
        if let Some(pending) = &mut self.pending_abort {
            pending.waiters.push(waiter);
            return completion;
        }
        let was_already_erroring = self.state == WritableState::Erroring;
        debug!(reason = %reason, was_already_erroring, "writable stream aborted");
        self.pending_abort = Some(PendingAbort {
            reason: reason.clone(),
            was_already_erroring,
            waiters: vec![waiter],
        });
        if !was_already_erroring {
            self.start_erroring(reason);
        }
        completion
    }

    pub(crate) fn close(&mut self) -> Completion<()> {
        match self.state {
            WritableState::Closed => {
                return Completion::rejected(Error::invalid_state("stream is already closed"));
            }
            WritableState::Erroring | WritableState::Errored => {
                return Completion::rejected(self.stored_error());
            }
            WritableState::Writable => {}
        }
        if self.close_queued_or_in_flight() {
            return Completion::rejected(Error::invalid_state("stream is already closing"));
        }
        let (request, completion) = deferred();
        self.close_request = Some(request);
        if self.backpressure {
            if let Some(writer) = &self.writer {
                writer.ready.resolve();
            }
        }
        if let Err(e) = self.queue.enqueue(WriteRecord::Close, 0.0) {
            self.error_if_needed(e);
        }
        self.advance_queue_if_needed();
        completion
    }

    /// Close that resolves if a close is already underway.
    pub(crate) fn close_with_error_propagation(&mut self) -> Completion<()> {
        if self.close_queued_or_in_flight() || self.state == WritableState::Closed {
            return Completion::resolved(());
        }
        if self.state == WritableState::Errored {
            return Completion::rejected(self.stored_error());
        }
        self.close()
    }

    /// Queues `chunk`; `size` was measured by the caller outside the borrow.
    pub(crate) fn write(&mut self, chunk: T, size: Result<f64>) -> Completion<()> {
        let size = match size {
            Ok(size) => size,
            Err(e) => {
                self.error_if_needed(e);
                1.0
            }
        };
        if self.state == WritableState::Errored {
            return Completion::rejected(self.stored_error());
        }
        if self.close_queued_or_in_flight() || self.state == WritableState::Closed {
            return Completion::rejected(Error::invalid_state(
                "cannot write to a stream that is closing or closed",
            ));
        }
        if self.state == WritableState::Erroring {
            return Completion::rejected(self.stored_error());
        }
        let (request, completion) = deferred();
        self.write_requests.push_back(request);
        if let Err(e) = self.queue.enqueue(WriteRecord::Chunk(Some(chunk)), size) {
            self.error_if_needed(e);
            return completion;
        }
        if self.state == WritableState::Writable {
            let backpressure = self.controller_desired_size() <= 0.0;
            self.update_backpressure(backpressure);
        }
        self.advance_queue_if_needed();
        completion
    }

    pub(crate) fn error_if_needed(&mut self, error: Error) {
        if self.state == WritableState::Writable {
            self.sink = None;
            self.start_erroring(error);
        }
    }

    fn update_backpressure(&mut self, backpressure: bool) {
        if backpressure != self.backpressure {
            if let Some(writer) = &mut self.writer {
                if backpressure {
                    writer.ready = Signal::new();
                } else {
                    writer.ready.resolve();
                }
            }
            trace!(backpressure, "backpressure changed");
        }
        self.backpressure = backpressure;
    }

    fn start_erroring(&mut self, reason: Error) {
        debug!(reason = %reason, "writable stream erroring");
        self.stored_error = Some(reason.clone());
        self.state = WritableState::Erroring;
        if let Some(writer) = &mut self.writer {
            writer.ready = reject_or_replace(writer.ready.clone(), &reason);
        }
        if !self.has_operation_marked_in_flight() && self.started {
            self.finish_erroring();
        }
    }

    fn finish_erroring(&mut self) {
        self.state = WritableState::Errored;
        self.queue.reset();
        let stored = self.stored_error();
        for request in self.write_requests.drain(..) {
            request.reject(stored.clone());
        }
        let Some(abort) = self.pending_abort.take() else {
            self.reject_close_and_closed_if_needed();
            return;
        };
        if abort.was_already_erroring {
            abort.settle(&Err(stored));
            self.reject_close_and_closed_if_needed();
            return;
        }
        let sink = self.sink.take();
        let this = self.this.clone();
        self.scheduler.spawn(async move {
            let result = match sink {
                Some(sink) => {
                    let step = sink.borrow_mut().abort(abort.reason.clone());
                    step.await
                }
                None => Ok(()),
            };
            abort.settle(&result);
            if let Some(shared) = this.upgrade() {
                shared.borrow_mut().reject_close_and_closed_if_needed();
            }
        });
    }

    fn reject_close_and_closed_if_needed(&mut self) {
        let stored = self.stored_error();
        if let Some(request) = self.close_request.take() {
            request.reject(stored.clone());
        }
        if let Some(writer) = &self.writer {
            writer.closed.reject(stored);
        }
    }

    fn deal_with_rejection(&mut self, error: Error) {
        if self.state == WritableState::Writable {
            self.start_erroring(error);
        } else {
            self.finish_erroring();
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.has_operation_marked_in_flight() {
            return;
        }
        if self.state == WritableState::Erroring {
            self.finish_erroring();
            return;
        }
        match self.queue.peek() {
            None => {}
            Some(WriteRecord::Close) => self.process_close(),
            Some(WriteRecord::Chunk(_)) => self.process_write(),
        }
    }

    fn process_close(&mut self) {
        self.in_flight_close = self.close_request.take();
        self.queue.dequeue();
        let sink = self.sink.take();
        let this = self.this.clone();
        trace!("closing sink");
        self.scheduler.spawn(async move {
            let result = match sink {
                Some(sink) => {
                    let step = sink.borrow_mut().close();
                    step.await
                }
                None => Ok(()),
            };
            if let Some(shared) = this.upgrade() {
                shared.borrow_mut().close_settled(result);
            }
        });
    }

    fn close_settled(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Some(request) = self.in_flight_close.take() {
                    request.resolve(());
                }
                if self.state == WritableState::Erroring {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        abort.settle(&Ok(()));
                    }
                }
                self.state = WritableState::Closed;
                debug!("writable stream closed");
                if let Some(writer) = &self.writer {
                    writer.closed.resolve();
                }
            }
            Err(e) => {
                if let Some(request) = self.in_flight_close.take() {
                    request.reject(e.clone());
                }
                if let Some(abort) = self.pending_abort.take() {
                    abort.settle(&Err(e.clone()));
                }
                self.deal_with_rejection(e);
            }
        }
    }

    fn process_write(&mut self) {
        let chunk = match self.queue.peek_mut() {
            Some(WriteRecord::Chunk(chunk)) => chunk.take(),
            _ => None,
        };
        let Some(chunk) = chunk else {
            return;
        };
        self.in_flight_write = self.write_requests.pop_front();
        let sink = self.sink.clone();
        let controller = self.controller();
        let this = self.this.clone();
        self.scheduler.spawn(async move {
            let result = match sink {
                Some(sink) => {
                    let step = sink.borrow_mut().write(chunk, &controller);
                    step.await
                }
                None => Ok(()),
            };
            if let Some(shared) = this.upgrade() {
                shared.borrow_mut().write_settled(result);
            }
        });
    }

    fn write_settled(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Some(request) = self.in_flight_write.take() {
                    request.resolve(());
                }
                self.queue.dequeue();
                if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
                    let backpressure = self.controller_desired_size() <= 0.0;
                    self.update_backpressure(backpressure);
                }
                self.advance_queue_if_needed();
            }
            Err(e) => {
                debug!(error = %e, "sink write failed");
                if self.state == WritableState::Writable {
                    self.sink = None;
                }
                if let Some(request) = self.in_flight_write.take() {
                    request.reject(e.clone());
                }
                self.deal_with_rejection(e);
            }
        }
    }

    fn start_settled(&mut self, result: Result<()>) {
        self.started = true;
        match result {
            Ok(()) => self.advance_queue_if_needed(),
            Err(e) => {
                debug!(error = %e, "sink start failed");
                self.deal_with_rejection(e);
            }
        }
    }
}

/// Rejects `signal`, or hands back an already-rejected replacement if it
/// had settled.
fn reject_or_replace(signal: Signal, error: &Error) -> Signal {
    if signal.reject(error.clone()) {
        signal
    } else {
        Signal::rejected(error.clone())
    }
}

/// A push-based stream that feeds an [`UnderlyingSink`].
///
/// Handles are cheap to clone and share state.
pub struct WritableStream<T> {
    pub(crate) inner: Shared<T>,
}

impl<T> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> WritableStream<T> {
    /// Creates a stream that writes into `sink`.
    ///
    /// Fails with `InvalidSize` if the strategy's high-water mark is
    /// negative or NaN.
    pub fn new(
        scheduler: &Scheduler,
        sink: impl UnderlyingSink<T>,
        strategy: QueuingStrategy<T>,
    ) -> Result<Self> {
        let high_water_mark = strategy.validated_high_water_mark()?;
        let (_, size) = strategy.into_parts();
        let sink: SinkCell<T> = Rc::new(RefCell::new(Box::new(sink)));
        let inner = Rc::new_cyclic(|this| {
            RefCell::new(WritableInner {
                state: WritableState::Writable,
                stored_error: None,
                writer: None,
                next_writer_id: 0,
                write_requests: VecDeque::new(),
                in_flight_write: None,
                close_request: None,
                in_flight_close: None,
                pending_abort: None,
                backpressure: high_water_mark <= 0.0,
                queue: SizedQueue::new(),
                high_water_mark,
                size,
                started: false,
                sink: Some(Rc::clone(&sink)),
                scheduler: scheduler.clone(),
                this: this.clone(),
            })
        });

        let controller = inner.borrow().controller();
        let this = Rc::downgrade(&inner);
        scheduler.spawn(async move {
            let step = sink.borrow_mut().start(&controller);
            let result = step.await;
            if let Some(shared) = this.upgrade() {
                shared.borrow_mut().start_settled(result);
            }
        });
        Ok(Self { inner })
    }

    /// Creates a stream that writes into `sink` at the configured writable
    /// high-water mark.
    pub fn with_config(
        scheduler: &Scheduler,
        sink: impl UnderlyingSink<T>,
        config: &StreamConfig,
    ) -> Result<Self> {
        Self::new(scheduler, sink, config.writable_strategy())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WritableState {
        self.inner.borrow().state
    }

    /// The error the stream failed with, if erroring or errored.
    #[must_use]
    pub fn stored_error(&self) -> Option<Error> {
        self.inner.borrow().stored_error.clone()
    }

    /// True while a writer holds the stream.
    #[must_use]
    pub fn locked(&self) -> bool {
        self.inner.borrow().locked()
    }

    /// Acquires the exclusive writer.
    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter<T>> {
        WritableStreamDefaultWriter::acquire(&self.inner)
    }

    /// Aborts an unlocked stream. Queued writes are discarded.
    pub fn abort(&self, reason: Error) -> Completion<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.locked() {
            return Completion::rejected(Error::locked("writable stream"));
        }
        inner.abort(reason)
    }

    /// Closes an unlocked stream after queued writes finish.
    pub fn close(&self) -> Completion<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.locked() {
            return Completion::rejected(Error::locked("writable stream"));
        }
        inner.close()
    }
}

impl<T> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("locked", &inner.writer.is_some())
            .field("backpressure", &inner.backpressure)
            .finish()
    }
}
