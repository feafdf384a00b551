//! Exclusive readers.
//!
//! A reader locks its stream until released or dropped. Releasing settles
//! every pending read with `Released`. Erroring the stream detaches the
//! reader implicitly; the handle then keeps reporting the stored error.

use super::{byte, direct, ControllerState, ReadableInner, ReadableState, Shared};
use crate::deferred::{deferred, Completion, Signal, SignalWait};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::Scheduler;
use crate::tracing_compat::trace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Outcome of a BYOB read.
///
/// `buffer` is the caller's buffer, truncated to the bytes that were filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByobReadResult {
    /// The filled bytes.
    pub buffer: Vec<u8>,
    /// True once the stream has ended.
    pub done: bool,
}

/// Bookkeeping shared by both reader kinds.
struct Lock<T> {
    stream: Shared<T>,
    scheduler: Scheduler,
    id: u64,
    closed: RefCell<Signal>,
    released: Cell<bool>,
}

impl<T: 'static> Lock<T> {
    fn acquire(stream: &Shared<T>, byob: bool) -> Result<Self> {
        let mut inner = stream.borrow_mut();
        let (id, closed) = inner.attach_reader(byob)?;
        let scheduler = inner.scheduler.clone();
        drop(inner);
        Ok(Self {
            stream: stream.clone(),
            scheduler,
            id,
            closed: RefCell::new(closed),
            released: Cell::new(false),
        })
    }

    fn check(&self, what: &str) -> Result<()> {
        if self.released.get() {
            return Err(Error::released(what));
        }
        Ok(())
    }

    fn closed(&self) -> SignalWait {
        self.closed.borrow().wait()
    }

    fn cancel(&self, what: &str, reason: Error) -> Completion<()> {
        if let Err(e) = self.check(what) {
            return Completion::rejected(e);
        }
        self.stream.borrow_mut().cancel(reason)
    }

    fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        // A reader dropped from inside its own stream's hooks cannot borrow;
        // the detach then runs as a task once the stream is free.
        if let Ok(mut inner) = self.stream.try_borrow_mut() {
            inner.detach_reader(self.id);
        } else {
            trace!(reader_id = self.id, "stream busy, release deferred");
            let stream = Rc::clone(&self.stream);
            let id = self.id;
            self.scheduler.spawn(async move {
                stream.borrow_mut().detach_reader(id);
            });
        }
        let released = Error::released("reader");
        let mut closed = self.closed.borrow_mut();
        if !closed.reject(released.clone()) {
            *closed = Signal::rejected(released);
        }
    }
}

/// Reads chunks one at a time from a locked [`ReadableStream`](super::ReadableStream).
pub struct ReadableStreamDefaultReader<T: 'static> {
    lock: Lock<T>,
}

impl<T: 'static> ReadableStreamDefaultReader<T> {
    pub(crate) fn acquire(stream: &Shared<T>) -> Result<Self> {
        Ok(Self {
            lock: Lock::acquire(stream, false)?,
        })
    }

    /// Reads the next chunk. Resolves `None` at end of stream.
    pub fn read(&self) -> Completion<Option<T>> {
        if let Err(e) = self.lock.check("reader") {
            return Completion::rejected(e);
        }
        let mut guard = self.lock.stream.borrow_mut();
        let inner = &mut *guard;
        inner.disturbed = true;
        match inner.state {
            ReadableState::Closed => Completion::resolved(None),
            ReadableState::Errored => Completion::rejected(inner.stored_error()),
            ReadableState::Readable => {
                if inner.reader.as_ref().map(|slot| slot.id) != Some(self.lock.id) {
                    return Completion::rejected(Error::released("reader"));
                }
                let (request, completion) = deferred();
                let pull_steps = inner.pull_steps;
                pull_steps(inner, request);
                completion
            }
        }
    }

    /// Waits for one chunk, then also takes every chunk already queued.
    ///
    /// Resolves `None` at end of stream. Never waits on the source for
    /// anything past the first chunk.
    pub async fn read_many(&self) -> Result<Option<Vec<T>>> {
        let Some(first) = self.read().await? else {
            return Ok(None);
        };
        let mut chunks = vec![first];
        while self.lock.stream.borrow().controller.queued_chunks() > 0 {
            let mut next = self.read();
            match next.try_take() {
                Some(Ok(Some(chunk))) => chunks.push(chunk),
                Some(Err(e)) => return Err(e),
                Some(Ok(None)) | None => break,
            }
        }
        trace!(reader_id = self.lock.id, count = chunks.len(), "read many");
        Ok(Some(chunks))
    }

    /// Resolves when the stream closes; rejects if it errors or the reader
    /// is released first.
    pub fn closed(&self) -> SignalWait {
        self.lock.closed()
    }

    /// Cancels the underlying stream.
    pub fn cancel(&self, reason: Error) -> Completion<()> {
        self.lock.cancel("reader", reason)
    }

    /// Unlocks the stream. Pending reads reject with `Released`.
    pub fn release_lock(&self) {
        self.lock.release();
    }

    /// True once this reader no longer holds the stream.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.lock.released.get()
    }
}

impl<T: 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<T: 'static> fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader")
            .field("id", &self.lock.id)
            .field("released", &self.lock.released.get())
            .finish()
    }
}

/// Reads bytes into caller-supplied buffers.
pub struct ReadableStreamBYOBReader {
    lock: Lock<Vec<u8>>,
}

impl ReadableStreamBYOBReader {
    pub(crate) fn acquire(stream: &Shared<Vec<u8>>) -> Result<Self> {
        if matches!(stream.borrow().controller, ControllerState::Default(_)) {
            return Err(Error::invalid_state(
                "BYOB readers require a byte or direct stream",
            ));
        }
        Ok(Self {
            lock: Lock::acquire(stream, true)?,
        })
    }

    /// Fills `buffer` with at least one byte.
    ///
    /// The buffer comes back truncated to the bytes written. At end of
    /// stream it comes back empty with `done` set.
    pub fn read(&self, buffer: Vec<u8>) -> Completion<ByobReadResult> {
        if let Err(e) = self.lock.check("BYOB reader") {
            return Completion::rejected(e);
        }
        if buffer.is_empty() {
            return Completion::rejected(
                Error::new(ErrorKind::InvalidBuffer).with_message("read buffer must not be empty"),
            );
        }
        let mut guard = self.lock.stream.borrow_mut();
        let inner: &mut ReadableInner<Vec<u8>> = &mut guard;
        inner.disturbed = true;
        match inner.state {
            ReadableState::Errored => return Completion::rejected(inner.stored_error()),
            ReadableState::Closed => {
                let mut buffer = buffer;
                buffer.clear();
                return Completion::resolved(ByobReadResult { buffer, done: true });
            }
            ReadableState::Readable => {}
        }
        if inner.reader.as_ref().map(|slot| slot.id) != Some(self.lock.id) {
            return Completion::rejected(Error::released("BYOB reader"));
        }
        let (request, completion) = deferred();
        if matches!(inner.controller, ControllerState::Byte(_)) {
            byte::pull_into(inner, buffer, request);
        } else {
            direct::pull_into(inner, buffer, request);
        }
        completion
    }

    /// Resolves when the stream closes; rejects if it errors or the reader
    /// is released first.
    pub fn closed(&self) -> SignalWait {
        self.lock.closed()
    }

    /// Cancels the underlying stream.
    pub fn cancel(&self, reason: Error) -> Completion<()> {
        self.lock.cancel("BYOB reader", reason)
    }

    /// Unlocks the stream. Pending reads reject with `Released`.
    pub fn release_lock(&self) {
        self.lock.release();
    }
}

impl Drop for ReadableStreamBYOBReader {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl fmt::Debug for ReadableStreamBYOBReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamBYOBReader")
            .field("id", &self.lock.id)
            .field("released", &self.lock.released.get())
            .finish()
    }
}
