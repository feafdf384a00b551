//! Direct byte streams.
//!
//! A direct source has no start hook and is pulled exactly once, on the
//! first read. It then pushes bytes through a [`DirectController`] for as
//! long as it likes: writes accumulate in a pending buffer that is flushed
//! when it reaches the high-water mark, on [`DirectController::flush`], or
//! when a reader finds the queue empty.
//!
//! `close()` called while the pull step is still running takes effect once
//! the step returns.

use super::byte::{fill_from_queue, PullIntoDescriptor, PullIntoKind};
use super::{ControllerState, ReadableInner, ReadableState, ReadableStream};
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::readable::reader::ByobReadResult;
use crate::runtime::Scheduler;
use crate::step::{self, StepFuture};
use crate::tracing_compat::{debug, trace};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

/// A producer that drives a direct stream.
pub trait DirectSource: 'static {
    /// Called once, on the first read. The controller stays usable after
    /// the returned step settles.
    fn pull(&mut self, controller: DirectController) -> StepFuture;

    /// Called at most once when a consumer cancels the stream.
    fn cancel(&mut self, reason: Error) -> StepFuture {
        let _ = reason;
        step::done()
    }
}

type DirectSourceCell = Rc<RefCell<Box<dyn DirectSource>>>;

pub(crate) struct DirectControllerState {
    pending: Vec<u8>,
    queue: VecDeque<Vec<u8>>,
    queue_total: usize,
    high_water_mark: f64,
    pull_started: bool,
    in_pull: bool,
    defer_close: bool,
    close_requested: bool,
    pub(crate) pending_pull_intos: VecDeque<PullIntoDescriptor>,
    pub(crate) source: Option<DirectSourceCell>,
}

impl DirectControllerState {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn desired_size(&self) -> f64 {
        self.high_water_mark - (self.pending.len() + self.queue_total) as f64
    }

    pub(crate) fn queued_chunks(&self) -> usize {
        self.queue.len() + usize::from(!self.pending.is_empty())
    }

    pub(crate) fn reset_queue(&mut self) {
        self.pending.clear();
        self.queue.clear();
        self.queue_total = 0;
        self.pending_pull_intos.clear();
    }
}

pub(crate) fn create(
    scheduler: &Scheduler,
    source: impl DirectSource,
    high_water_mark: f64,
    floor: f64,
) -> ReadableStream<Vec<u8>> {
    let high_water_mark = if high_water_mark.is_nan() {
        floor
    } else {
        high_water_mark.max(floor)
    };
    let inner = ReadableInner::create(
        scheduler,
        ControllerState::Direct(DirectControllerState {
            pending: Vec::new(),
            queue: VecDeque::new(),
            queue_total: 0,
            high_water_mark,
            pull_started: false,
            in_pull: false,
            defer_close: false,
            close_requested: false,
            pending_pull_intos: VecDeque::new(),
            source: Some(Rc::new(RefCell::new(Box::new(source)))),
        }),
        pull_steps,
    );
    ReadableStream { inner }
}

fn start_pull_if_needed(inner: &mut ReadableInner<Vec<u8>>) {
    let ControllerState::Direct(c) = &mut inner.controller else {
        return;
    };
    if c.pull_started {
        return;
    }
    c.pull_started = true;
    let Some(source) = c.source.clone() else {
        return;
    };
    c.in_pull = true;
    trace!("starting direct pull");
    let stream = inner.this.clone();
    inner.scheduler.spawn(async move {
        let controller = DirectController {
            stream: stream.clone(),
        };
        let step = source.borrow_mut().pull(controller);
        let result = step.await;
        let Some(shared) = stream.upgrade() else {
            return;
        };
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        let ControllerState::Direct(c) = &mut inner.controller else {
            return;
        };
        c.in_pull = false;
        match result {
            Err(e) => {
                debug!(error = %e, "direct pull failed");
                inner.error_controller(e);
            }
            Ok(()) => {
                if std::mem::take(&mut c.defer_close) {
                    finish_close(inner);
                }
            }
        }
    });
}

/// Hands `bytes` to waiting reads, queueing what they cannot take.
fn deliver(inner: &mut ReadableInner<Vec<u8>>, mut bytes: Vec<u8>) {
    if inner.num_read_requests() > 0 {
        inner.fulfill_read_request(bytes);
        return;
    }
    while !bytes.is_empty() && inner.num_read_into_requests() > 0 {
        let ControllerState::Direct(c) = &mut inner.controller else {
            return;
        };
        let Some(mut desc) = c.pending_pull_intos.pop_front() else {
            break;
        };
        let n = desc.remaining().min(bytes.len());
        let start = desc.bytes_filled;
        desc.buffer[start..start + n].copy_from_slice(&bytes[..n]);
        desc.bytes_filled += n;
        bytes.drain(..n);
        inner.fulfill_read_into_request(desc.into_filled(), false);
    }
    if bytes.is_empty() {
        return;
    }
    if let ControllerState::Direct(c) = &mut inner.controller {
        c.queue_total += bytes.len();
        c.queue.push_back(bytes);
    }
}

fn flush_pending(inner: &mut ReadableInner<Vec<u8>>) -> usize {
    let ControllerState::Direct(c) = &mut inner.controller else {
        return 0;
    };
    let bytes = std::mem::take(&mut c.pending);
    let n = bytes.len();
    if n > 0 {
        trace!(bytes = n, "flushing direct buffer");
        deliver(inner, bytes);
    }
    n
}

fn finish_close(inner: &mut ReadableInner<Vec<u8>>) {
    if inner.state != ReadableState::Readable {
        return;
    }
    flush_pending(inner);
    let ControllerState::Direct(c) = &mut inner.controller else {
        return;
    };
    c.close_requested = true;
    if c.queue.is_empty() {
        c.source = None;
        inner.close();
    }
}

/// After a dequeue: close once a requested close has drained the queue.
fn after_dequeue(inner: &mut ReadableInner<Vec<u8>>) {
    let ControllerState::Direct(c) = &mut inner.controller else {
        return;
    };
    if c.close_requested && c.queue.is_empty() {
        c.source = None;
        inner.close();
    }
}

/// Default-reader read on a direct stream.
pub(crate) fn pull_steps(inner: &mut ReadableInner<Vec<u8>>, request: Deferred<Option<Vec<u8>>>) {
    start_pull_if_needed(inner);
    let ControllerState::Direct(c) = &mut inner.controller else {
        request.reject(Error::internal("direct pull steps on a non-direct stream"));
        return;
    };
    if let Some(chunk) = c.queue.pop_front() {
        c.queue_total -= chunk.len();
        after_dequeue(inner);
        request.resolve(Some(chunk));
        return;
    }
    if !c.pending.is_empty() {
        request.resolve(Some(std::mem::take(&mut c.pending)));
        return;
    }
    inner.add_read_request(request);
}

/// BYOB read on a direct stream.
pub(crate) fn pull_into(
    inner: &mut ReadableInner<Vec<u8>>,
    buffer: Vec<u8>,
    request: Deferred<ByobReadResult>,
) {
    start_pull_if_needed(inner);
    let ControllerState::Direct(c) = &mut inner.controller else {
        request.reject(Error::internal("direct pull-into on a non-direct stream"));
        return;
    };
    let mut desc = PullIntoDescriptor::new(buffer, PullIntoKind::Byob, 0);
    if c.queue_total > 0 {
        fill_from_queue(&mut c.queue, &mut c.queue_total, &mut desc);
        after_dequeue(inner);
        request.resolve(ByobReadResult {
            buffer: desc.into_filled(),
            done: false,
        });
        return;
    }
    if !c.pending.is_empty() {
        let n = desc.remaining().min(c.pending.len());
        desc.buffer[..n].copy_from_slice(&c.pending[..n]);
        desc.bytes_filled = n;
        c.pending.drain(..n);
        request.resolve(ByobReadResult {
            buffer: desc.into_filled(),
            done: false,
        });
        return;
    }
    c.pending_pull_intos.push_back(desc);
    inner.add_read_into_request(request);
}

/// Write handle given to a [`DirectSource`].
#[derive(Clone)]
pub struct DirectController {
    stream: Weak<RefCell<ReadableInner<Vec<u8>>>>,
}

impl fmt::Debug for DirectController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectController")
            .field("attached", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl DirectController {
    fn upgrade(&self) -> Result<Rc<RefCell<ReadableInner<Vec<u8>>>>> {
        self.stream
            .upgrade()
            .ok_or_else(|| Error::invalid_state("direct stream was dropped"))
    }

    fn writable(inner: &ReadableInner<Vec<u8>>) -> Result<()> {
        match &inner.controller {
            ControllerState::Direct(c)
                if inner.state == ReadableState::Readable && !c.close_requested =>
            {
                Ok(())
            }
            _ => Err(Error::invalid_state("direct stream is closed")),
        }
    }

    /// Buffers `bytes`, flushing once the buffer reaches the high-water mark.
    #[allow(clippy::cast_precision_loss)]
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let shared = self.upgrade()?;
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        Self::writable(inner)?;
        let ControllerState::Direct(c) = &mut inner.controller else {
            return Err(Error::internal("direct controller on a non-direct stream"));
        };
        c.pending.extend_from_slice(bytes);
        if c.pending.len() as f64 >= c.high_water_mark {
            flush_pending(inner);
        }
        Ok(bytes.len())
    }

    /// Delivers buffered bytes now. Returns how many were flushed.
    pub fn flush(&self) -> Result<usize> {
        let shared = self.upgrade()?;
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        Self::writable(inner)?;
        Ok(flush_pending(inner))
    }

    /// Flushes and closes. Deferred while the pull step is running.
    pub fn close(&self) -> Result<()> {
        let shared = self.upgrade()?;
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        Self::writable(inner)?;
        let ControllerState::Direct(c) = &mut inner.controller else {
            return Err(Error::internal("direct controller on a non-direct stream"));
        };
        if c.defer_close {
            return Err(Error::invalid_state("direct stream is already closing"));
        }
        if c.in_pull {
            c.defer_close = true;
            return Ok(());
        }
        finish_close(inner);
        Ok(())
    }

    /// Errors the stream, discarding buffered bytes.
    pub fn error(&self, error: Error) {
        if let Some(stream) = self.stream.upgrade() {
            stream.borrow_mut().error_controller(error);
        }
    }

    /// `high_water_mark - buffered bytes`; `None` once errored.
    #[must_use]
    pub fn desired_size(&self) -> Option<f64> {
        self.stream
            .upgrade()
            .and_then(|stream| stream.borrow().desired_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::deferred::Signal;
    use crate::test_utils::{ok, run_test, settle};
    use crate::ErrorKind;
    use std::cell::Cell;

    type Slot = Rc<RefCell<Option<DirectController>>>;

    /// Stores the controller and keeps the pull step open until `release`
    /// settles.
    struct HeldSource {
        slot: Slot,
        pulls: Rc<Cell<usize>>,
        release: Signal,
    }

    impl DirectSource for HeldSource {
        fn pull(&mut self, controller: DirectController) -> StepFuture {
            self.pulls.set(self.pulls.get() + 1);
            *self.slot.borrow_mut() = Some(controller);
            let release = self.release.wait();
            step::boxed(release)
        }
    }

    fn held(
        scheduler: &Scheduler,
        high_water_mark: f64,
    ) -> (ReadableStream<Vec<u8>>, Slot, Rc<Cell<usize>>, Signal) {
        let slot = Slot::default();
        let pulls = Rc::new(Cell::new(0));
        let release = Signal::new();
        let stream = ReadableStream::new_direct(
            scheduler,
            HeldSource {
                slot: Rc::clone(&slot),
                pulls: Rc::clone(&pulls),
                release: release.clone(),
            },
            high_water_mark,
        );
        (stream, slot, pulls, release)
    }

    #[test]
    fn pull_runs_once_on_first_read() {
        run_test(|scheduler| async move {
            let (stream, slot, pulls, _release) = held(&scheduler, 0.0);
            settle(4).await;
            assert_eq!(pulls.get(), 0);
            let reader = ok(stream.get_reader(), "reader");
            let first = reader.read();
            settle(4).await;
            assert_eq!(pulls.get(), 1);
            let controller = slot.borrow().clone().expect("pulled");
            ok(controller.write(b"abc"), "write");
            ok(controller.flush(), "flush");
            assert_eq!(ok(first.await, "first"), Some(b"abc".to_vec()));
            let second = reader.read();
            settle(4).await;
            assert_eq!(pulls.get(), 1);
            ok(controller.write(b"de"), "write");
            ok(controller.flush(), "flush");
            assert_eq!(ok(second.await, "second"), Some(b"de".to_vec()));
        });
    }

    #[test]
    fn high_water_mark_is_clamped_and_triggers_flush() {
        run_test(|scheduler| async move {
            let (stream, slot, _, _release) = held(&scheduler, 1.0);
            let reader = ok(stream.get_reader(), "reader");
            let pending = reader.read();
            settle(4).await;
            let controller = slot.borrow().clone().expect("pulled");
            assert_eq!(controller.desired_size(), Some(64.0));
            ok(controller.write(&[1; 63]), "write below hwm");
            settle(2).await;
            assert!(!pending.is_settled());
            ok(controller.write(&[2]), "write reaching hwm");
            let chunk = ok(pending.await, "read").expect("chunk");
            assert_eq!(chunk.len(), 64);
        });
    }

    #[test]
    fn configured_floor_replaces_default_minimum() {
        run_test(|scheduler| async move {
            let slot = Slot::default();
            let config = StreamConfig {
                direct_min_high_water_mark: 16.0,
                ..StreamConfig::default()
            };
            let stream = ReadableStream::new_direct_with_config(
                &scheduler,
                HeldSource {
                    slot: Rc::clone(&slot),
                    pulls: Rc::default(),
                    release: Signal::new(),
                },
                1.0,
                &config,
            );
            let reader = ok(stream.get_reader(), "reader");
            let _pending = reader.read();
            settle(4).await;
            let controller = slot.borrow().clone().expect("pulled");
            assert_eq!(controller.desired_size(), Some(16.0));
        });
    }

    #[test]
    fn close_inside_pull_is_deferred() {
        run_test(|scheduler| async move {
            let (stream, slot, _, release) = held(&scheduler, 0.0);
            let reader = ok(stream.get_reader(), "reader");
            let first = reader.read();
            settle(4).await;
            let controller = slot.borrow().clone().expect("pulled");
            ok(controller.write(b"hi"), "write");
            ok(controller.close(), "close");
            assert_eq!(stream.state(), ReadableState::Readable);
            let err = controller.close().expect_err("second close");
            assert_eq!(err.kind(), ErrorKind::InvalidState);
            release.resolve();
            settle(4).await;
            assert_eq!(stream.state(), ReadableState::Closed);
            assert_eq!(ok(first.await, "read"), Some(b"hi".to_vec()));
            assert_eq!(ok(reader.read().await, "end"), None);
            assert!(controller.write(b"late").is_err());
        });
    }

    #[test]
    fn pull_failure_errors_stream() {
        run_test(|scheduler| async move {
            let (stream, _slot, _, release) = held(&scheduler, 0.0);
            let reader = ok(stream.get_reader(), "reader");
            let pending = reader.read();
            settle(4).await;
            release.reject(Error::reason("producer crashed"));
            let err = pending.await.expect_err("errored");
            assert_eq!(err.message(), Some("producer crashed"));
            assert_eq!(stream.state(), ReadableState::Errored);
        });
    }

    #[test]
    fn byob_read_takes_what_fits() {
        run_test(|scheduler| async move {
            let (stream, slot, _, _release) = held(&scheduler, 0.0);
            let reader = ok(stream.get_byob_reader(), "byob reader");
            let first = reader.read(vec![0; 3]);
            settle(4).await;
            let controller = slot.borrow().clone().expect("pulled");
            ok(controller.write(b"hello"), "write");
            ok(controller.flush(), "flush");
            assert_eq!(ok(first.await, "first").buffer, b"hel".to_vec());
            let second = ok(reader.read(vec![0; 8]).await, "second");
            assert_eq!(second.buffer, b"lo".to_vec());
        });
    }
}
