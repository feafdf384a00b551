//! Piping a readable stream into a writable stream.
//!
//! [`ReadableStream::pipe_to`] locks both ends and pumps chunks while the
//! destination is ready. Watchers on the source's and destination's `closed`
//! signals (and on an optional [`AbortSignal`]) decide how the pipe shuts
//! down. The first trigger wins; a single latch absorbs the rest.
//!
//! Before a shutdown action runs, the pipe waits for the last dispatched
//! write so no chunk that was already read gets lost.

use crate::abort::AbortSignal;
use crate::deferred::{deferred, Completion, Deferred, Signal};
use crate::error::{Error, ErrorKind, Result};
use crate::readable::{ReadableState, ReadableStream, ReadableStreamDefaultReader};
use crate::runtime::Scheduler;
use crate::tracing_compat::{debug, trace};
use crate::transform::TransformStream;
use crate::writable::{WritableState, WritableStream, WritableStreamDefaultWriter};
use futures_lite::future;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Flags controlling how a pipe propagates shutdown.
#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    /// Stops the pipe from outside.
    pub signal: Option<AbortSignal>,
}

impl PipeOptions {
    /// Options that propagate every shutdown.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`PipeOptions::prevent_close`].
    #[must_use]
    pub fn prevent_close(mut self, prevent: bool) -> Self {
        self.prevent_close = prevent;
        self
    }

    /// Sets [`PipeOptions::prevent_abort`].
    #[must_use]
    pub fn prevent_abort(mut self, prevent: bool) -> Self {
        self.prevent_abort = prevent;
        self
    }

    /// Sets [`PipeOptions::prevent_cancel`].
    #[must_use]
    pub fn prevent_cancel(mut self, prevent: bool) -> Self {
        self.prevent_cancel = prevent;
        self
    }

    /// Attaches an abort signal.
    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// What to do to each end once the latch fires.
#[derive(Debug, Default)]
struct Actions {
    close_dest: bool,
    abort_dest: Option<Error>,
    cancel_source: Option<Error>,
}

struct Pipe<T: 'static> {
    source: ReadableStream<T>,
    dest: WritableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    prevent_close: bool,
    prevent_abort: bool,
    prevent_cancel: bool,
    scheduler: Scheduler,
    shutting_down: Cell<bool>,
    /// Resolves when the most recent write settles.
    last_write: RefCell<Signal>,
    done: RefCell<Option<Deferred<()>>>,
    /// Resolves at finalization; every pipe task races against it.
    finished: Signal,
}

impl<T: 'static> Pipe<T> {
    async fn pump(self: Rc<Self>) {
        loop {
            if self.shutting_down.get() {
                return;
            }
            if !self.wait_for_capacity().await || self.shutting_down.get() {
                return;
            }

            let read = self.reader.read();
            let finished = self.finished.wait();
            let next = future::or(async { Some(read.await) }, async {
                let _ = finished.await;
                None
            })
            .await;
            // Closure and errors are handled by the watchers.
            let Some(Ok(Some(chunk))) = next else {
                return;
            };
            if self.shutting_down.get() {
                trace!("chunk read after shutdown began, dropped");
                return;
            }
            self.dispatch_write(chunk);
        }
    }

    /// Waits until the destination can take another chunk.
    ///
    /// A destination with nothing queued or in flight always gets one more
    /// chunk, even when its desired size is not positive. Otherwise a
    /// zero high-water mark would keep `ready` pending forever.
    async fn wait_for_capacity(&self) -> bool {
        loop {
            if self.shutting_down.get() {
                return false;
            }
            if self.dest.inner.borrow().is_idle() {
                return true;
            }
            let ready = self.writer.ready();
            let last_write = self.last_write.borrow().clone();
            let write_pending = !last_write.is_settled();
            let write_settled = last_write.wait();
            let finished = self.finished.wait();
            let outcome = future::or(
                async { Some(ready.await.is_ok()) },
                future::or(
                    async {
                        if write_pending {
                            let _ = write_settled.await;
                            None
                        } else {
                            future::pending().await
                        }
                    },
                    async {
                        let _ = finished.await;
                        Some(false)
                    },
                ),
            )
            .await;
            if let Some(proceed) = outcome {
                return proceed;
            }
            trace!("write settled, rechecking destination capacity");
        }
    }

    fn dispatch_write(&self, chunk: T) {
        let write = self.writer.write(chunk);
        let settled = Signal::new();
        *self.last_write.borrow_mut() = settled.clone();
        self.scheduler.spawn(async move {
            #[allow(unused_variables)]
            if let Err(e) = write.await {
                trace!(error = %e, "piped write failed");
            }
            settled.resolve();
        });
    }

    /// Applies the start-of-pipe checks in priority order.
    ///
    /// Returns `true` if one of them fired the latch.
    fn check_initial_state(self: &Rc<Self>, signal: Option<&AbortSignal>) -> bool {
        if let Some(reason) = signal.and_then(AbortSignal::reason) {
            self.on_abort_signal(reason);
            return true;
        }
        if let Some(error) = self.source.stored_error() {
            self.on_source_errored(error);
            return true;
        }
        if let Some(error) = self.dest.stored_error() {
            self.on_dest_errored(error);
            return true;
        }
        if self.source.state() == ReadableState::Closed {
            self.on_source_closed();
            return true;
        }
        let dest_closing = {
            let inner = self.dest.inner.borrow();
            inner.close_queued_or_in_flight() || inner.state == WritableState::Closed
        };
        if dest_closing {
            self.on_dest_closed();
            return true;
        }
        false
    }

    fn on_source_errored(self: &Rc<Self>, error: Error) {
        debug!(error = %error, prevent_abort = self.prevent_abort, "pipe source errored");
        let actions = Actions {
            abort_dest: (!self.prevent_abort).then(|| error.clone()),
            ..Actions::default()
        };
        self.shutdown(actions, Some(error));
    }

    fn on_dest_errored(self: &Rc<Self>, error: Error) {
        debug!(error = %error, prevent_cancel = self.prevent_cancel, "pipe destination errored");
        let actions = Actions {
            cancel_source: (!self.prevent_cancel).then(|| error.clone()),
            ..Actions::default()
        };
        self.shutdown(actions, Some(error));
    }

    fn on_source_closed(self: &Rc<Self>) {
        debug!(prevent_close = self.prevent_close, "pipe source closed");
        let actions = Actions {
            close_dest: !self.prevent_close,
            ..Actions::default()
        };
        self.shutdown(actions, None);
    }

    fn on_dest_closed(self: &Rc<Self>) {
        let error = Error::new(ErrorKind::DestinationClosed)
            .with_message("destination closed before the pipe finished");
        debug!(prevent_cancel = self.prevent_cancel, "pipe destination closed");
        let actions = Actions {
            cancel_source: (!self.prevent_cancel).then(|| error.clone()),
            ..Actions::default()
        };
        self.shutdown(actions, Some(error));
    }

    fn on_abort_signal(self: &Rc<Self>, reason: Error) {
        debug!(reason = %reason, "pipe aborted by signal");
        let actions = Actions {
            close_dest: false,
            abort_dest: (!self.prevent_abort).then(|| reason.clone()),
            cancel_source: (!self.prevent_cancel).then(|| reason.clone()),
        };
        self.shutdown(actions, Some(reason));
    }

    /// Fires the latch, then runs `actions` and finalizes with their outcome
    /// (or `original` if they all succeed).
    fn shutdown(self: &Rc<Self>, actions: Actions, original: Option<Error>) {
        if self.shutting_down.replace(true) {
            trace!("pipe already shutting down, trigger absorbed");
            return;
        }
        let pipe = Rc::clone(self);
        self.scheduler.spawn(async move {
            let wait_for_write = {
                let inner = pipe.dest.inner.borrow();
                inner.state == WritableState::Writable && !inner.close_queued_or_in_flight()
            };
            if wait_for_write {
                let last = pipe.last_write.borrow().wait();
                let _ = last.await;
            }
            let result = pipe.run(actions).await;
            pipe.finalize(result.and_then(|()| original.map_or(Ok(()), Err)));
        });
    }

    async fn run(&self, actions: Actions) -> Result<()> {
        let mut pending: Vec<Completion<()>> = Vec::new();
        if let Some(reason) = actions.abort_dest {
            if self.dest.state() == WritableState::Writable {
                pending.push(self.writer.abort(reason));
            }
        }
        if let Some(reason) = actions.cancel_source {
            if self.source.state() == ReadableState::Readable {
                pending.push(self.reader.cancel(reason));
            }
        }
        if actions.close_dest {
            pending.push(self.writer.close_with_error_propagation());
        }
        let mut outcome = Ok(());
        for completion in pending {
            if let Err(e) = completion.await {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    fn finalize(&self, result: Result<()>) {
        self.writer.release_lock();
        self.reader.release_lock();
        self.finished.resolve();
        #[allow(unused_variables)]
        match &result {
            Ok(()) => {
                debug!("pipe finished");
            }
            Err(e) => {
                debug!(error = %e, "pipe failed");
            }
        }
        if let Some(done) = self.done.borrow_mut().take() {
            done.settle(result);
        }
    }
}

fn watch_source<T: 'static>(pipe: &Rc<Pipe<T>>) {
    let closed = pipe.reader.closed();
    let finished = pipe.finished.wait();
    let pipe = Rc::clone(pipe);
    let scheduler = pipe.scheduler.clone();
    scheduler.spawn(async move {
        let outcome = future::or(async { Some(closed.await) }, async {
            let _ = finished.await;
            None
        })
        .await;
        match outcome {
            Some(Ok(())) => pipe.on_source_closed(),
            Some(Err(error)) if !error.is_released() => pipe.on_source_errored(error),
            _ => {}
        }
    });
}

fn watch_dest<T: 'static>(pipe: &Rc<Pipe<T>>) {
    let closed = pipe.writer.closed();
    let finished = pipe.finished.wait();
    let pipe = Rc::clone(pipe);
    let scheduler = pipe.scheduler.clone();
    scheduler.spawn(async move {
        let outcome = future::or(async { Some(closed.await) }, async {
            let _ = finished.await;
            None
        })
        .await;
        match outcome {
            Some(Ok(())) => pipe.on_dest_closed(),
            Some(Err(error)) if !error.is_released() => pipe.on_dest_errored(error),
            _ => {}
        }
    });
}

fn watch_signal<T: 'static>(pipe: &Rc<Pipe<T>>, signal: &AbortSignal) {
    let aborted = signal.wait();
    let finished = pipe.finished.wait();
    let pipe = Rc::clone(pipe);
    let scheduler = pipe.scheduler.clone();
    scheduler.spawn(async move {
        let reason = future::or(async { Some(aborted.await) }, async {
            let _ = finished.await;
            None
        })
        .await;
        if let Some(reason) = reason {
            pipe.on_abort_signal(reason);
        }
    });
}

impl<T: 'static> ReadableStream<T> {
    /// Pipes every chunk into `dest`, locking both for the duration.
    ///
    /// Resolves once the source closes and the destination has closed (or
    /// was left open under `prevent_close`). Rejects with whichever error
    /// ended the pipe first.
    pub fn pipe_to(&self, dest: &WritableStream<T>, options: PipeOptions) -> Completion<()> {
        if self.locked() {
            return Completion::rejected(Error::locked("readable stream"));
        }
        if dest.locked() {
            return Completion::rejected(Error::locked("writable stream"));
        }
        let reader = match self.get_reader() {
            Ok(reader) => reader,
            Err(e) => return Completion::rejected(e),
        };
        let writer = match dest.get_writer() {
            Ok(writer) => writer,
            Err(e) => return Completion::rejected(e),
        };
        let scheduler = {
            let mut inner = self.inner.borrow_mut();
            inner.disturbed = true;
            inner.scheduler.clone()
        };
        let (done, completion) = deferred();
        let pipe = Rc::new(Pipe {
            source: self.clone(),
            dest: dest.clone(),
            reader,
            writer,
            prevent_close: options.prevent_close,
            prevent_abort: options.prevent_abort,
            prevent_cancel: options.prevent_cancel,
            scheduler: scheduler.clone(),
            shutting_down: Cell::new(false),
            last_write: RefCell::new(Signal::resolved()),
            done: RefCell::new(Some(done)),
            finished: Signal::new(),
        });
        debug!(
            prevent_close = options.prevent_close,
            prevent_abort = options.prevent_abort,
            prevent_cancel = options.prevent_cancel,
            "pipe started"
        );

        if !pipe.check_initial_state(options.signal.as_ref()) {
            watch_source(&pipe);
            watch_dest(&pipe);
            if let Some(signal) = &options.signal {
                watch_signal(&pipe, signal);
            }
            scheduler.spawn(Rc::clone(&pipe).pump());
        }
        completion
    }

    /// Pipes into `transform`'s writable side and returns its readable side.
    ///
    /// The pipe's own outcome is not observable; errors surface on the
    /// returned stream.
    pub fn pipe_through<O: 'static>(
        &self,
        transform: &TransformStream<T, O>,
        options: PipeOptions,
    ) -> Result<ReadableStream<O>> {
        if self.locked() {
            return Err(Error::locked("readable stream"));
        }
        let writable = transform.writable();
        if writable.locked() {
            return Err(Error::locked("writable stream"));
        }
        let _ = self.pipe_to(&writable, options);
        Ok(transform.readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use crate::queue::QueuingStrategy;
    use crate::readable::{ReadableStreamDefaultController, UnderlyingSource};
    use crate::test_utils::{ok, run_test, settle, CallLog, ListSource, RecordingSink};
    use crate::step::{self, StepFuture};
    use crate::transform::{TransformStreamDefaultController, Transformer};

    fn recording_dest(scheduler: &Scheduler, log: &CallLog) -> WritableStream<String> {
        ok(
            WritableStream::new(
                scheduler,
                RecordingSink::new(Rc::clone(log)),
                QueuingStrategy::new(1.0),
            ),
            "dest",
        )
    }

    #[test]
    fn pipes_chunks_then_closes() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let source = ReadableStream::from_iter(
                &scheduler,
                ["A", "B", "C"].map(str::to_owned),
            );
            let dest = recording_dest(&scheduler, &log);
            ok(source.pipe_to(&dest, PipeOptions::new()).await, "pipe");
            assert_eq!(
                *log.borrow(),
                vec![
                    r#"write:"A""#.to_owned(),
                    r#"write:"B""#.to_owned(),
                    r#"write:"C""#.to_owned(),
                    "close".to_owned(),
                ]
            );
            assert!(!source.locked());
            assert!(!dest.locked());
            assert_eq!(dest.state(), WritableState::Closed);
        });
    }

    #[test]
    fn prevent_close_leaves_dest_open() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let source = ReadableStream::from_iter(&scheduler, ["x".to_owned()]);
            let dest = recording_dest(&scheduler, &log);
            ok(
                source.pipe_to(&dest, PipeOptions::new().prevent_close(true)).await,
                "pipe",
            );
            assert_eq!(dest.state(), WritableState::Writable);
            assert!(!log.borrow().iter().any(|entry| entry == "close"));
        });
    }

    type ControllerSlot = Rc<RefCell<Option<ReadableStreamDefaultController<String>>>>;

    /// A source that only produces what the test pushes through its controller.
    fn failing_source(scheduler: &Scheduler) -> (ReadableStream<String>, ControllerSlot) {
        struct Held(ControllerSlot);
        impl UnderlyingSource<String> for Held {
            fn start(&mut self, controller: &ReadableStreamDefaultController<String>) -> StepFuture {
                *self.0.borrow_mut() = Some(controller.clone());
                step::done()
            }
        }
        let slot = Rc::new(RefCell::new(None));
        let stream = ok(
            ReadableStream::new(scheduler, Held(Rc::clone(&slot)), QueuingStrategy::new(1.0)),
            "source",
        );
        (stream, slot)
    }

    #[test]
    fn source_error_aborts_dest() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let (source, slot) = failing_source(&scheduler);
            let dest = recording_dest(&scheduler, &log);
            let piped = source.pipe_to(&dest, PipeOptions::new());
            settle(4).await;
            let controller = slot.borrow().clone().expect("started");
            ok(controller.enqueue("one".into()), "enqueue");
            settle(8).await;
            controller.error(Error::reason("E"));
            let err = piped.await.expect_err("pipe rejects");
            assert_eq!(err.message(), Some("E"));
            let aborts: Vec<_> = log
                .borrow()
                .iter()
                .filter(|entry| entry.starts_with("abort"))
                .cloned()
                .collect();
            assert_eq!(aborts, vec!["abort:E".to_owned()]);
            assert_eq!(dest.state(), WritableState::Errored);
        });
    }

    #[test]
    fn prevent_abort_leaves_dest_untouched() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let (source, slot) = failing_source(&scheduler);
            let dest = recording_dest(&scheduler, &log);
            let piped = source.pipe_to(&dest, PipeOptions::new().prevent_abort(true));
            settle(4).await;
            let controller = slot.borrow().clone().expect("started");
            controller.error(Error::reason("E"));
            let err = piped.await.expect_err("pipe rejects");
            assert_eq!(err.message(), Some("E"));
            assert!(!log.borrow().iter().any(|entry| entry.starts_with("abort")));
            assert_eq!(dest.state(), WritableState::Writable);
            assert!(!dest.locked());
        });
    }

    #[test]
    fn dest_error_cancels_source() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let source = ok(
                ReadableStream::new(
                    &scheduler,
                    ListSource::<String> {
                        chunks: vec![],
                        close: false,
                        log: Rc::clone(&log),
                    },
                    QueuingStrategy::new(1.0),
                ),
                "source",
            );
            let sink_log = CallLog::default();
            let dest = recording_dest(&scheduler, &sink_log);
            let piped = source.pipe_to(&dest, PipeOptions::new());
            settle(4).await;
            let aborted = dest.inner.borrow_mut().abort(Error::reason("sink broke"));
            ok(aborted.await, "abort");
            let err = piped.await.expect_err("pipe rejects");
            assert_eq!(err.message(), Some("sink broke"));
            assert!(log.borrow().iter().any(|entry| entry == "cancel:sink broke"));
            assert_eq!(source.state(), ReadableState::Closed);
        });
    }

    #[test]
    fn closed_dest_rejects_with_destination_closed() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let dest = recording_dest(&scheduler, &log);
            ok(dest.close().await, "close dest");
            let source = ReadableStream::from_iter(&scheduler, ["late".to_owned()]);
            let err = source
                .pipe_to(&dest, PipeOptions::new())
                .await
                .expect_err("dest closed");
            assert_eq!(err.kind(), ErrorKind::DestinationClosed);
            assert_eq!(source.state(), ReadableState::Closed);
        });
    }

    #[test]
    fn abort_signal_stops_the_pipe() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let source_log = CallLog::default();
            let source = ok(
                ReadableStream::new(
                    &scheduler,
                    ListSource::<String> {
                        chunks: vec!["a".into()],
                        close: false,
                        log: Rc::clone(&source_log),
                    },
                    QueuingStrategy::new(1.0),
                ),
                "source",
            );
            let dest = recording_dest(&scheduler, &log);
            let controller = AbortController::new();
            let piped = source.pipe_to(&dest, PipeOptions::new().signal(controller.signal()));
            settle(8).await;
            controller.abort(None);
            let err = piped.await.expect_err("aborted");
            assert_eq!(err.kind(), ErrorKind::Aborted);
            assert!(log.borrow().iter().any(|entry| entry == r#"write:"a""#));
            assert!(log.borrow().iter().any(|entry| entry.starts_with("abort")));
            assert!(source_log.borrow().iter().any(|entry| entry.starts_with("cancel")));
        });
    }

    #[test]
    fn pipe_through_applies_transform() {
        struct Shout;
        impl Transformer<String, String> for Shout {
            fn transform(&mut self, chunk: String, controller: &TransformStreamDefaultController<String>) -> StepFuture {
                step::from_result(controller.enqueue(format!("{chunk}!")))
            }
        }

        run_test(|scheduler| async move {
            let source = ReadableStream::from_iter(&scheduler, ["hi".to_owned(), "yo".to_owned()]);
            let transform = ok(TransformStream::new(&scheduler, Shout), "transform");
            let out = ok(source.pipe_through(&transform, PipeOptions::new()), "pipe through");
            assert_eq!(ok(out.collect().await, "collect"), vec!["hi!", "yo!"]);
        });
    }

    #[test]
    fn locked_ends_are_rejected() {
        run_test(|scheduler| async move {
            let log = CallLog::default();
            let source = ReadableStream::from_iter(&scheduler, ["x".to_owned()]);
            let dest = recording_dest(&scheduler, &log);
            let _reader = ok(source.get_reader(), "reader");
            let err = source
                .pipe_to(&dest, PipeOptions::new())
                .await
                .expect_err("locked");
            assert_eq!(err.kind(), ErrorKind::Locked);
            assert!(!dest.locked());
        });
    }
}
