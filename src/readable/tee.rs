//! Splitting one readable into two branches.

use super::{ReadableStream, ReadableStreamDefaultController, ReadableStreamDefaultReader, UnderlyingSource};
use crate::deferred::Signal;
use crate::error::{Error, ErrorKind, Result};
use crate::queue::QueuingStrategy;
use crate::step::{self, StepFuture};
use crate::tracing_compat::{debug, trace};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct TeeState<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    reading: Cell<bool>,
    /// A branch pulled while a read was in flight.
    read_again: Cell<bool>,
    finished: Cell<bool>,
    canceled: [Cell<bool>; 2],
    reasons: RefCell<[Option<Error>; 2]>,
    branches: RefCell<[Option<ReadableStreamDefaultController<T>>; 2]>,
    /// Settles with the source's cancel outcome once both branches cancel.
    cancel_done: Signal,
}

impl<T: Clone + 'static> TeeState<T> {
    fn branch(&self, index: usize) -> Option<ReadableStreamDefaultController<T>> {
        self.branches.borrow()[index].clone()
    }

    fn for_each_open_branch(&self, mut f: impl FnMut(&ReadableStreamDefaultController<T>)) {
        for index in 0..2 {
            if self.canceled[index].get() {
                continue;
            }
            if let Some(branch) = self.branch(index) {
                f(&branch);
            }
        }
    }

    async fn pull(self: Rc<Self>) -> Result<()> {
        if self.reading.replace(true) {
            self.read_again.set(true);
            return Ok(());
        }
        loop {
            let next = self.reader.read().await;
            match next {
                Ok(Some(chunk)) => {
                    self.for_each_open_branch(|branch| {
                        let _ = branch.enqueue(chunk.clone());
                    });
                }
                Ok(None) => {
                    self.finished.set(true);
                    self.for_each_open_branch(|branch| {
                        let _ = branch.close();
                    });
                    self.cancel_done.resolve();
                    break;
                }
                // The closed watcher errors both branches.
                Err(_) => break,
            }
            if !self.read_again.replace(false) {
                break;
            }
            trace!("tee branch pulled during read, reading again");
        }
        self.read_again.set(false);
        self.reading.set(false);
        Ok(())
    }

    fn cancel(&self, index: usize, reason: Error) -> StepFuture {
        self.canceled[index].set(true);
        self.reasons.borrow_mut()[index] = Some(reason);
        let other = 1 - index;
        if self.canceled[other].get() && !self.finished.get() {
            let composite = {
                let reasons = self.reasons.borrow();
                let describe = |reason: &Option<Error>| {
                    reason
                        .as_ref()
                        .map_or_else(String::new, ToString::to_string)
                };
                Error::new(ErrorKind::Cancelled).with_message(format!(
                    "both tee branches cancelled: [{}, {}]",
                    describe(&reasons[0]),
                    describe(&reasons[1])
                ))
            };
            debug!(reason = %composite, "cancelling tee source");
            let cancelled = self.reader.cancel(composite);
            let done = self.cancel_done.clone();
            return step::boxed(async move {
                let result = cancelled.await;
                done.settle(result.clone());
                result
            });
        }
        step::boxed(self.cancel_done.wait())
    }
}

struct TeeBranch<T: 'static> {
    state: Rc<TeeState<T>>,
    index: usize,
}

impl<T: Clone + 'static> UnderlyingSource<T> for TeeBranch<T> {
    fn start(&mut self, controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        self.state.branches.borrow_mut()[self.index] = Some(controller.clone());
        step::done()
    }

    fn pull(&mut self, _controller: &ReadableStreamDefaultController<T>) -> StepFuture {
        step::boxed(Rc::clone(&self.state).pull())
    }

    fn cancel(&mut self, reason: Error) -> StepFuture {
        self.state.cancel(self.index, reason)
    }
}

pub(crate) fn tee<T: Clone + 'static>(
    stream: &ReadableStream<T>,
) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
    let reader = stream.get_reader()?;
    let closed = reader.closed();
    let scheduler = stream.inner.borrow().scheduler.clone();
    let state = Rc::new(TeeState {
        reader,
        reading: Cell::new(false),
        read_again: Cell::new(false),
        finished: Cell::new(false),
        canceled: [Cell::new(false), Cell::new(false)],
        reasons: RefCell::new([None, None]),
        branches: RefCell::new([None, None]),
        cancel_done: Signal::new(),
    });
    let first = ReadableStream::new(
        &scheduler,
        TeeBranch {
            state: Rc::clone(&state),
            index: 0,
        },
        QueuingStrategy::new(0.0),
    )?;
    let second = ReadableStream::new(
        &scheduler,
        TeeBranch {
            state: Rc::clone(&state),
            index: 1,
        },
        QueuingStrategy::new(0.0),
    )?;

    let watched = Rc::downgrade(&state);
    scheduler.spawn(async move {
        let Err(error) = closed.await else {
            return;
        };
        let Some(state) = watched.upgrade() else {
            return;
        };
        if error.is_released() {
            return;
        }
        state.finished.set(true);
        for index in 0..2 {
            if let Some(branch) = state.branch(index) {
                branch.error(error.clone());
            }
        }
        state.cancel_done.resolve();
    });
    Ok((first, second))
}
