//! Transform streams: a writable side feeding a readable side.
//!
//! Chunks written to [`TransformStream::writable`] pass through a
//! [`Transformer`] which enqueues zero or more outputs on
//! [`TransformStream::readable`]. The writable side stops accepting sink
//! writes while the readable side reports backpressure, so a slow consumer
//! throttles the producer.
//!
//! Backpressure starts off, so the first writes go through before anyone
//! reads. After that it tracks the readable side's demand.

use crate::config::StreamConfig;
use crate::deferred::Signal;
use crate::error::{Error, ErrorKind, Result};
use crate::queue::QueuingStrategy;
use crate::readable::{ReadableInner, ReadableStream, ReadableStreamDefaultController, UnderlyingSource};
use crate::runtime::Scheduler;
use crate::step::{self, StepFuture};
use crate::tracing_compat::{debug, trace};
use crate::writable::{
    UnderlyingSink, WritableInner, WritableState, WritableStream, WritableStreamDefaultController,
};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// User hooks behind a [`TransformStream`].
pub trait Transformer<I, O>: 'static {
    /// Called once at construction. Both sides wait for it.
    fn start(&mut self, controller: &TransformStreamDefaultController<O>) -> StepFuture {
        let _ = controller;
        step::done()
    }

    /// Turns one input chunk into outputs via `controller.enqueue`.
    fn transform(&mut self, chunk: I, controller: &TransformStreamDefaultController<O>)
        -> StepFuture;

    /// Called once after the writable side closes, before the readable side
    /// closes.
    fn flush(&mut self, controller: &TransformStreamDefaultController<O>) -> StepFuture {
        let _ = controller;
        step::done()
    }
}

/// Passes every chunk through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl<T: 'static> Transformer<T, T> for IdentityTransformer {
    fn transform(&mut self, chunk: T, controller: &TransformStreamDefaultController<T>) -> StepFuture {
        step::from_result(controller.enqueue(chunk))
    }
}

type TransformerCell<I, O> = Rc<RefCell<Box<dyn Transformer<I, O>>>>;

struct TransformState<I, O> {
    backpressure: bool,
    backpressure_change: Signal,
    /// `None` once the algorithms are cleared.
    transformer: Option<TransformerCell<I, O>>,
    readable: ReadableStreamDefaultController<O>,
    writable: Weak<RefCell<WritableInner<I>>>,
    started: Signal,
}

/// Operations the controller needs, without the input type.
trait TransformCore {
    fn error(&self, error: Error);
    fn error_writable_and_unblock(&self, error: Error);
    fn set_backpressure(&self, backpressure: bool);
    fn backpressure(&self) -> bool;
}

impl<I: 'static, O: 'static> TransformCore for RefCell<TransformState<I, O>> {
    fn error(&self, error: Error) {
        let readable = self.borrow().readable.clone();
        readable.error(error.clone());
        self.error_writable_and_unblock(error);
    }

    fn error_writable_and_unblock(&self, error: Error) {
        let writable = {
            let mut state = self.borrow_mut();
            state.transformer = None;
            state.writable.upgrade()
        };
        if let Some(writable) = writable {
            writable.borrow_mut().error_if_needed(error);
        }
        if self.backpressure() {
            self.set_backpressure(false);
        }
    }

    fn set_backpressure(&self, backpressure: bool) {
        let mut state = self.borrow_mut();
        state.backpressure_change.resolve();
        state.backpressure_change = Signal::new();
        state.backpressure = backpressure;
        trace!(backpressure, "transform backpressure changed");
    }

    fn backpressure(&self) -> bool {
        self.borrow().backpressure
    }
}

/// Handle given to a [`Transformer`].
pub struct TransformStreamDefaultController<O> {
    readable: ReadableStreamDefaultController<O>,
    core: Weak<dyn TransformCore>,
}

impl<O> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            core: self.core.clone(),
        }
    }
}

impl<O> fmt::Debug for TransformStreamDefaultController<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStreamDefaultController")
            .field("attached", &(self.core.strong_count() > 0))
            .finish()
    }
}

impl<O: 'static> TransformStreamDefaultController<O> {
    /// Desired size of the readable side.
    #[must_use]
    pub fn desired_size(&self) -> Option<f64> {
        self.readable.desired_size()
    }

    /// Emits `chunk` on the readable side.
    ///
    /// Fails with `InvalidState` once the readable side is closing or gone.
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        if !self.readable.can_close_or_enqueue() {
            return Err(Error::invalid_state(
                "readable side is not in a state that permits enqueue",
            ));
        }
        if let Err(e) = self.readable.enqueue(chunk) {
            if let Some(core) = self.core.upgrade() {
                core.error_writable_and_unblock(e.clone());
            }
            return Err(e);
        }
        let backpressure = self.readable.has_backpressure();
        if let Some(core) = self.core.upgrade() {
            if backpressure != core.backpressure() {
                core.set_backpressure(backpressure);
            }
        }
        Ok(())
    }

    /// Errors both sides.
    pub fn error(&self, error: Error) {
        if let Some(core) = self.core.upgrade() {
            core.error(error);
        }
    }

    /// Closes the readable side and errors the writable side.
    ///
    /// A readable side that is already closing or closed is left as is.
    pub fn terminate(&self) {
        #[allow(unused_variables)]
        match self.readable.close() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::InvalidState => {
                trace!("terminate: readable side already closing or closed");
            }
            Err(e) => {
                debug!(error = %e, "terminate: closing readable side failed");
            }
        }
        if let Some(core) = self.core.upgrade() {
            core.error_writable_and_unblock(
                Error::new(ErrorKind::Cancelled).with_message("transform stream terminated"),
            );
        }
    }
}

type Shared<I, O> = Rc<RefCell<TransformState<I, O>>>;

fn controller<I: 'static, O: 'static>(state: &Shared<I, O>) -> TransformStreamDefaultController<O> {
    let weak: Weak<RefCell<TransformState<I, O>>> = Rc::downgrade(state);
    let core: Weak<dyn TransformCore> = weak;
    TransformStreamDefaultController {
        readable: state.borrow().readable.clone(),
        core,
    }
}

/// The readable side's stored error, or `fallback`.
fn readable_error<I, O: 'static>(state: &Shared<I, O>, fallback: Error) -> Error {
    let readable = state.borrow().readable.clone();
    readable.stored_error().unwrap_or(fallback)
}

struct TransformSink<I, O> {
    state: Shared<I, O>,
}

impl<I: 'static, O: 'static> UnderlyingSink<I> for TransformSink<I, O> {
    fn start(&mut self, _controller: &WritableStreamDefaultController) -> StepFuture {
        step::boxed(self.state.borrow().started.wait())
    }

    fn write(&mut self, chunk: I, _controller: &WritableStreamDefaultController) -> StepFuture {
        let state = Rc::clone(&self.state);
        step::boxed(async move {
            let (blocked, change) = {
                let s = state.borrow();
                (s.backpressure, s.backpressure_change.clone())
            };
            if blocked {
                change.wait().await?;
                let writable = state.borrow().writable.upgrade();
                if let Some(writable) = writable {
                    let writable = writable.borrow();
                    if writable.state == WritableState::Erroring {
                        return Err(writable.stored_error());
                    }
                }
            }
            let Some(transformer) = state.borrow().transformer.clone() else {
                return Ok(());
            };
            let controller = controller(&state);
            let step = transformer.borrow_mut().transform(chunk, &controller);
            if let Err(e) = step.await {
                debug!(error = %e, "transform failed");
                controller.error(e.clone());
                return Err(e);
            }
            Ok(())
        })
    }

    fn close(&mut self) -> StepFuture {
        let state = Rc::clone(&self.state);
        step::boxed(async move {
            let transformer = state.borrow_mut().transformer.take();
            let controller = controller(&state);
            let flushed = match transformer {
                Some(transformer) => {
                    let step = transformer.borrow_mut().flush(&controller);
                    step.await
                }
                None => Ok(()),
            };
            match flushed {
                Ok(()) => {
                    let readable = state.borrow().readable.clone();
                    if let Some(e) = readable.stored_error() {
                        return Err(e);
                    }
                    if readable.can_close_or_enqueue() {
                        readable.close()?;
                    }
                    Ok(())
                }
                Err(e) => {
                    debug!(error = %e, "transform flush failed");
                    controller.error(e.clone());
                    Err(readable_error(&state, e))
                }
            }
        })
    }

    fn abort(&mut self, reason: Error) -> StepFuture {
        controller(&self.state).error(reason);
        step::done()
    }
}

struct TransformSource<I, O> {
    state: Shared<I, O>,
}

impl<I: 'static, O: 'static> UnderlyingSource<O> for TransformSource<I, O> {
    fn start(&mut self, _controller: &ReadableStreamDefaultController<O>) -> StepFuture {
        step::boxed(self.state.borrow().started.wait())
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<O>) -> StepFuture {
        self.state.set_backpressure(false);
        step::boxed(self.state.borrow().backpressure_change.wait())
    }

    fn cancel(&mut self, reason: Error) -> StepFuture {
        self.state.error_writable_and_unblock(reason);
        step::done()
    }
}

/// A writable/readable pair joined by a [`Transformer`].
pub struct TransformStream<I, O> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I, O> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    /// Creates a transform stream with the default strategies.
    pub fn new(scheduler: &Scheduler, transformer: impl Transformer<I, O>) -> Result<Self> {
        Self::with_config(scheduler, transformer, &StreamConfig::default())
    }

    /// Creates a transform stream with high-water marks from `config`.
    pub fn with_config(
        scheduler: &Scheduler,
        transformer: impl Transformer<I, O>,
        config: &StreamConfig,
    ) -> Result<Self> {
        Self::with_strategies(
            scheduler,
            transformer,
            QueuingStrategy::new(config.transform_writable_high_water_mark),
            QueuingStrategy::new(config.transform_readable_high_water_mark),
        )
    }

    /// Creates a transform stream with explicit strategies for each side.
    pub fn with_strategies(
        scheduler: &Scheduler,
        transformer: impl Transformer<I, O>,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self> {
        writable_strategy.validated_high_water_mark()?;
        readable_strategy.validated_high_water_mark()?;
        let transformer: TransformerCell<I, O> = Rc::new(RefCell::new(Box::new(transformer)));
        let state: Shared<I, O> = Rc::new(RefCell::new(TransformState {
            backpressure: false,
            backpressure_change: Signal::new(),
            transformer: Some(Rc::clone(&transformer)),
            readable: ReadableStreamDefaultController::new(Weak::<RefCell<ReadableInner<O>>>::new()),
            writable: Weak::new(),
            started: Signal::new(),
        }));
        let writable = WritableStream::new(
            scheduler,
            TransformSink {
                state: Rc::clone(&state),
            },
            writable_strategy,
        )?;
        let readable = ReadableStream::new(
            scheduler,
            TransformSource {
                state: Rc::clone(&state),
            },
            readable_strategy,
        )?;
        {
            let mut s = state.borrow_mut();
            s.writable = Rc::downgrade(&writable.inner);
            s.readable = ReadableStreamDefaultController::new(Rc::downgrade(&readable.inner));
        }

        let controller = controller(&state);
        let started = state.borrow().started.clone();
        scheduler.spawn(async move {
            let step = transformer.borrow_mut().start(&controller);
            let result = step.await;
            #[allow(unused_variables)]
            if let Err(e) = &result {
                debug!(error = %e, "transformer start failed");
            }
            started.settle(result);
        });
        Ok(Self { readable, writable })
    }

    /// The output side.
    #[must_use]
    pub fn readable(&self) -> ReadableStream<O> {
        self.readable.clone()
    }

    /// The input side.
    #[must_use]
    pub fn writable(&self) -> WritableStream<I> {
        self.writable.clone()
    }
}

impl<T: 'static> TransformStream<T, T> {
    /// A pass-through pair: what is written comes out unchanged.
    pub fn identity(scheduler: &Scheduler) -> Result<Self> {
        Self::new(scheduler, IdentityTransformer)
    }
}

impl<I, O> fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
