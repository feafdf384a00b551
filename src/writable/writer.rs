//! The exclusive writer.

use super::{Shared, WritableInner, WritableState};
use crate::deferred::{Completion, Signal, SignalWait};
use crate::error::{Error, Result};
use crate::queue::measure;
use crate::runtime::Scheduler;
use crate::tracing_compat::trace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Writes chunks into a locked [`WritableStream`](super::WritableStream).
///
/// Dropping the writer releases the lock.
pub struct WritableStreamDefaultWriter<T: 'static> {
    stream: Shared<T>,
    scheduler: Scheduler,
    id: u64,
    /// Signals kept after release; while attached the stream's are used.
    detached: RefCell<(Signal, Signal)>,
    released: Cell<bool>,
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    pub(crate) fn acquire(stream: &Shared<T>) -> Result<Self> {
        let mut inner = stream.borrow_mut();
        let (id, ready, closed) = inner.attach_writer()?;
        let scheduler = inner.scheduler.clone();
        drop(inner);
        Ok(Self {
            stream: stream.clone(),
            scheduler,
            id,
            detached: RefCell::new((ready, closed)),
            released: Cell::new(false),
        })
    }

    fn attached<'a>(&self, inner: &'a WritableInner<T>) -> Option<&'a super::WriterSlot> {
        if self.released.get() {
            return None;
        }
        inner.writer.as_ref().filter(|slot| slot.id == self.id)
    }

    fn check(&self) -> Result<()> {
        if self.released.get() {
            return Err(Error::released("writer"));
        }
        Ok(())
    }

    /// Resolves when the stream wants more data; rejects once it fails.
    ///
    /// Replaced each time backpressure turns on, so call it again per wait.
    pub fn ready(&self) -> SignalWait {
        let inner = self.stream.borrow();
        self.attached(&inner)
            .map_or_else(|| self.detached.borrow().0.wait(), |slot| slot.ready.wait())
    }

    /// Resolves when the stream closes; rejects if it errors.
    pub fn closed(&self) -> SignalWait {
        let inner = self.stream.borrow();
        self.attached(&inner)
            .map_or_else(|| self.detached.borrow().1.wait(), |slot| slot.closed.wait())
    }

    /// `high_water_mark - queued size`. `None` while erroring or errored,
    /// `0` once closed. Fails with `Released` after release.
    pub fn desired_size(&self) -> Result<Option<f64>> {
        self.check()?;
        Ok(self.stream.borrow().desired_size())
    }

    /// Queues `chunk`. Resolves once the sink has consumed it.
    pub fn write(&self, chunk: T) -> Completion<()> {
        if let Err(e) = self.check() {
            return Completion::rejected(e);
        }
        let size = self.stream.borrow().size.clone();
        // The size function is user code: measure outside the borrow.
        let measured = measure(size.as_ref(), &chunk);
        self.stream.borrow_mut().write(chunk, measured)
    }

    /// Closes once queued writes finish.
    pub fn close(&self) -> Completion<()> {
        if let Err(e) = self.check() {
            return Completion::rejected(e);
        }
        self.stream.borrow_mut().close()
    }

    /// Aborts the stream, discarding queued writes.
    pub fn abort(&self, reason: Error) -> Completion<()> {
        if let Err(e) = self.check() {
            return Completion::rejected(e);
        }
        self.stream.borrow_mut().abort(reason)
    }

    /// Closes, treating an already-closing stream as success.
    pub(crate) fn close_with_error_propagation(&self) -> Completion<()> {
        if let Err(e) = self.check() {
            return Completion::rejected(e);
        }
        self.stream.borrow_mut().close_with_error_propagation()
    }

    /// Current state of the locked stream.
    #[must_use]
    pub fn state(&self) -> WritableState {
        self.stream.borrow().state
    }

    /// Releases the lock. `ready` and `closed` reject with `Released`.
    pub fn release_lock(&self) {
        if self.released.replace(true) {
            return;
        }
        if let Ok(mut inner) = self.stream.try_borrow_mut() {
            if let Some(signals) = inner.detach_writer(self.id) {
                *self.detached.borrow_mut() = signals;
            }
            return;
        }
        // Released from inside the stream's own hooks: detach once it is free.
        trace!(writer_id = self.id, "stream busy, release deferred");
        let released = Error::released("writer");
        *self.detached.borrow_mut() = (
            Signal::rejected(released.clone()),
            Signal::rejected(released),
        );
        let stream = Rc::clone(&self.stream);
        let id = self.id;
        self.scheduler.spawn(async move {
            stream.borrow_mut().detach_writer(id);
        });
    }
}

impl<T: 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.release_lock();
    }
}

impl<T: 'static> fmt::Debug for WritableStreamDefaultWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultWriter")
            .field("id", &self.id)
            .field("released", &self.released.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::deferred::Signal;
    use crate::queue::QueuingStrategy;
    use crate::step::{self, StepFuture};
    use crate::test_utils::{ok, run_test, settle};
    use crate::writable::{UnderlyingSink, WritableState, WritableStream, WritableStreamDefaultController};
    use crate::{Error, ErrorKind};
    use std::rc::Rc;

    /// Sink whose writes complete only when the test says so.
    struct Gated {
        gate: Rc<std::cell::RefCell<Vec<Signal>>>,
        fail_with: Option<Error>,
    }

    impl UnderlyingSink<&'static str> for Gated {
        fn write(
            &mut self,
            _chunk: &'static str,
            _controller: &WritableStreamDefaultController,
        ) -> StepFuture {
            let signal = Signal::new();
            self.gate.borrow_mut().push(signal.clone());
            let fail_with = self.fail_with.clone();
            step::boxed(async move {
                signal.wait().await?;
                fail_with.map_or(Ok(()), Err)
            })
        }
    }

    fn open_gate(gate: &Rc<std::cell::RefCell<Vec<Signal>>>) {
        let signals: Vec<_> = gate.borrow_mut().drain(..).collect();
        for signal in signals {
            signal.resolve();
        }
    }

    #[test]
    fn ready_tracks_desired_size() {
        run_test(|scheduler| async move {
            let gate = Rc::default();
            let stream = ok(
                WritableStream::new(
                    &scheduler,
                    Gated {
                        gate: Rc::clone(&gate),
                        fail_with: None,
                    },
                    QueuingStrategy::new(2.0),
                ),
                "create",
            );
            let writer = ok(stream.get_writer(), "writer");
            settle(2).await;
            assert!(writer.ready().await.is_ok());
            assert_eq!(ok(writer.desired_size(), "size"), Some(2.0));
            let first = writer.write("a");
            let second = writer.write("b");
            assert_eq!(ok(writer.desired_size(), "size"), Some(0.0));
            let ready = writer.ready();
            settle(2).await;
            assert!(futures_lite::future::poll_once(writer.ready()).await.is_none());
            open_gate(&gate);
            ok(first.await, "first");
            ok(ready.await, "ready after drain");
            assert!(ok(writer.desired_size(), "size").expect("writable") > 0.0);
            settle(2).await;
            open_gate(&gate);
            ok(second.await, "second");
        });
    }

    #[test]
    fn failed_write_rejects_later_writes_and_close() {
        run_test(|scheduler| async move {
            let gate = Rc::default();
            let stream = ok(
                WritableStream::new(
                    &scheduler,
                    Gated {
                        gate: Rc::clone(&gate),
                        fail_with: Some(Error::reason("boom")),
                    },
                    QueuingStrategy::new(1.0),
                ),
                "create",
            );
            let writer = ok(stream.get_writer(), "writer");
            let first = writer.write("x");
            settle(4).await;
            open_gate(&gate);
            assert_eq!(first.await.expect_err("boom").message(), Some("boom"));
            settle(2).await;
            assert_eq!(stream.state(), WritableState::Errored);
            assert_eq!(
                writer.write("y").await.expect_err("errored").message(),
                Some("boom")
            );
            assert_eq!(
                writer.close().await.expect_err("errored").message(),
                Some("boom")
            );
            assert_eq!(ok(writer.desired_size(), "size"), None);
            assert_eq!(
                writer.closed().await.expect_err("closed").message(),
                Some("boom")
            );
        });
    }

    #[test]
    fn released_writer_rejects_everything() {
        run_test(|scheduler| async move {
            let gate = Rc::default();
            let stream = ok(
                WritableStream::new(
                    &scheduler,
                    Gated {
                        gate,
                        fail_with: None,
                    },
                    QueuingStrategy::new(1.0),
                ),
                "create",
            );
            let writer = ok(stream.get_writer(), "writer");
            writer.release_lock();
            assert!(!stream.locked());
            assert_eq!(
                writer.write("z").await.expect_err("released").kind(),
                ErrorKind::Released
            );
            assert!(writer.ready().await.expect_err("ready").is_released());
            assert!(writer.closed().await.expect_err("closed").is_released());
            assert!(writer.desired_size().is_err());
            let _next = ok(stream.get_writer(), "new writer");
        });
    }

    #[test]
    fn release_while_stream_busy_is_deferred_not_lost() {
        run_test(|scheduler| async move {
            let stream = ok(
                WritableStream::new(
                    &scheduler,
                    Gated {
                        gate: Rc::default(),
                        fail_with: None,
                    },
                    QueuingStrategy::new(1.0),
                ),
                "create",
            );
            let writer = ok(stream.get_writer(), "writer");
            let busy = stream.inner.borrow();
            writer.release_lock();
            drop(busy);
            assert!(writer.ready().await.expect_err("ready").is_released());
            settle(2).await;
            assert!(!stream.locked());
            let _next = ok(stream.get_writer(), "new writer");
        });
    }
}
