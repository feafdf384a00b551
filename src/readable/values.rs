//! Async iteration over a readable stream.
//!
//! [`ReadableStreamValues`] is a [`Stream`] view over a default reader. It
//! ends after the last chunk or the first error and unlocks the stream
//! either way.

use super::ReadableStreamDefaultReader;
use crate::deferred::Completion;
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::trace;
use futures_lite::stream::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Options for [`ReadableStream::values_with`](super::ReadableStream::values_with).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValuesOptions {
    /// Leave the stream uncancelled when iteration stops early.
    pub prevent_cancel: bool,
}

impl ValuesOptions {
    /// Sets `prevent_cancel`.
    #[must_use]
    pub const fn prevent_cancel(mut self, value: bool) -> Self {
        self.prevent_cancel = value;
        self
    }
}

/// Yields the chunks of a locked readable stream.
///
/// Dropping it before the end cancels the stream unless `prevent_cancel`
/// was set, then releases the lock.
pub struct ReadableStreamValues<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    pending: Option<Completion<Option<T>>>,
    prevent_cancel: bool,
    done: bool,
}

impl<T: 'static> ReadableStreamValues<T> {
    pub(crate) fn new(reader: ReadableStreamDefaultReader<T>, options: ValuesOptions) -> Self {
        trace!(prevent_cancel = options.prevent_cancel, "values iterator created");
        Self {
            reader,
            pending: None,
            prevent_cancel: options.prevent_cancel,
            done: false,
        }
    }

    /// Returns a reference to the reader holding the lock.
    #[must_use]
    pub fn get_ref(&self) -> &ReadableStreamDefaultReader<T> {
        &self.reader
    }

    /// Stops iterating with `reason`.
    ///
    /// Cancels the stream unless `prevent_cancel` was set, then releases
    /// the lock. Resolves at once if iteration already ended.
    pub fn stop(&mut self, reason: Error) -> Completion<()> {
        if self.done {
            return Completion::resolved(());
        }
        self.done = true;
        self.pending = None;
        let cancelled = if self.prevent_cancel {
            Completion::resolved(())
        } else {
            self.reader.cancel(reason)
        };
        self.reader.release_lock();
        cancelled
    }

    fn finish(&mut self) {
        self.done = true;
        self.reader.release_lock();
    }
}

impl<T: 'static> Stream for ReadableStreamValues<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.pending.is_none() {
            this.pending = Some(this.reader.read());
        }
        let Some(read) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = match Pin::new(read).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        this.pending = None;
        match outcome {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Ok(None) => {
                trace!("values iterator reached end of stream");
                this.finish();
                Poll::Ready(None)
            }
            Err(e) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl<T: 'static> Drop for ReadableStreamValues<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        trace!("values iterator dropped early");
        // Nothing can observe the outcome once the iterator is gone.
        drop(self.stop(Error::new(ErrorKind::Cancelled).with_message("iteration stopped early")));
    }
}

impl<T: 'static> fmt::Debug for ReadableStreamValues<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamValues")
            .field("reader", &self.reader)
            .field("prevent_cancel", &self.prevent_cancel)
            .field("done", &self.done)
            .finish()
    }
}
