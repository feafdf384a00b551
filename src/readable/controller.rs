//! The default readable controller: a size-accounted chunk queue.

use super::{ControllerState, ReadableInner, ReadableState, Shared, UnderlyingSource};
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::queue::{measure, SizeFn, SizedQueue};
use crate::tracing_compat::{debug, trace};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

pub(crate) type SourceCell<T> = Rc<RefCell<Box<dyn UnderlyingSource<T>>>>;

pub(crate) struct DefaultControllerState<T> {
    pub(crate) queue: SizedQueue<T>,
    pub(crate) high_water_mark: f64,
    pub(crate) size: Option<SizeFn<T>>,
    pub(crate) started: bool,
    pub(crate) close_requested: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_again: bool,
    /// `None` once the algorithms are cleared.
    pub(crate) source: Option<SourceCell<T>>,
}

impl<T> DefaultControllerState<T> {
    pub(crate) fn new(high_water_mark: f64, size: Option<SizeFn<T>>, source: SourceCell<T>) -> Self {
        Self {
            queue: SizedQueue::new(),
            high_water_mark,
            size,
            started: false,
            close_requested: false,
            pulling: false,
            pull_again: false,
            source: Some(source),
        }
    }
}

/// Handle given to an [`UnderlyingSource`] to feed its stream.
///
/// Holds the stream weakly: once every stream handle is gone, operations
/// fail with `InvalidState`.
pub struct ReadableStreamDefaultController<T> {
    stream: Weak<RefCell<ReadableInner<T>>>,
}

impl<T> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T> fmt::Debug for ReadableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamDefaultController")
            .field("attached", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(stream: Weak<RefCell<ReadableInner<T>>>) -> Self {
        Self { stream }
    }

    fn upgrade(&self) -> Result<Shared<T>> {
        self.stream
            .upgrade()
            .ok_or_else(|| Error::invalid_state("readable stream was dropped"))
    }

    /// `high_water_mark - queue_total`; `None` once errored, `0` once closed.
    #[must_use]
    pub fn desired_size(&self) -> Option<f64> {
        self.stream
            .upgrade()
            .and_then(|stream| stream.borrow().desired_size())
    }

    /// Number of chunks currently queued.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.stream.upgrade().map_or(0, |stream| {
            match &stream.borrow().controller {
                ControllerState::Default(c) => c.queue.len(),
                _ => 0,
            }
        })
    }

    /// Delivers `chunk` to a waiting read, or queues it.
    ///
    /// Fails with `InvalidState` after `close()` or once the stream is no
    /// longer readable. If the size function fails, the stream is errored
    /// and that error is returned.
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        let shared = self.upgrade()?;
        let size = {
            let mut guard = shared.borrow_mut();
            let inner = &mut *guard;
            if !can_close_or_enqueue(inner) {
                return Err(Error::invalid_state(
                    "cannot enqueue on a stream that is closing or not readable",
                ));
            }
            if inner.locked() && inner.num_read_requests() > 0 {
                inner.fulfill_read_request(chunk);
                call_pull_if_needed(inner);
                return Ok(());
            }
            match &inner.controller {
                ControllerState::Default(c) => c.size.clone(),
                _ => None,
            }
        };

        // The size function is user code: measure outside the borrow.
        let measured = measure(size.as_ref(), &chunk);

        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        if !can_close_or_enqueue(inner) {
            return Err(Error::invalid_state(
                "stream stopped accepting chunks while measuring",
            ));
        }
        let queued = measured.and_then(|size| match &mut inner.controller {
            ControllerState::Default(c) => c.queue.enqueue(chunk, size),
            _ => Err(Error::internal("default controller on a non-default stream")),
        });
        if let Err(e) = queued {
            inner.error_controller(e.clone());
            return Err(e);
        }
        call_pull_if_needed(inner);
        Ok(())
    }

    /// Requests close. Queued chunks are still delivered first.
    pub fn close(&self) -> Result<()> {
        let shared = self.upgrade()?;
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        if !can_close_or_enqueue(inner) {
            return Err(Error::invalid_state(
                "cannot close a stream that is closing or not readable",
            ));
        }
        let ControllerState::Default(c) = &mut inner.controller else {
            return Err(Error::internal("default controller on a non-default stream"));
        };
        c.close_requested = true;
        if c.queue.is_empty() {
            c.source = None;
            inner.close();
        } else {
            trace!(queued = c.queue.len(), "close deferred until queue drains");
        }
        Ok(())
    }

    /// Errors the stream. No-op unless it is readable.
    pub fn error(&self, error: Error) {
        if let Some(stream) = self.stream.upgrade() {
            stream.borrow_mut().error_controller(error);
        }
    }

    /// The stream's error, if it has errored.
    pub(crate) fn stored_error(&self) -> Option<Error> {
        let stream = self.stream.upgrade()?;
        let inner = stream.borrow();
        (inner.state == ReadableState::Errored).then(|| inner.stored_error())
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        self.stream
            .upgrade()
            .is_some_and(|stream| can_close_or_enqueue(&stream.borrow()))
    }

    /// True when the stream would not pull right now.
    pub(crate) fn has_backpressure(&self) -> bool {
        self.stream
            .upgrade()
            .map_or(true, |stream| !should_call_pull(&stream.borrow()))
    }
}

fn can_close_or_enqueue<T>(inner: &ReadableInner<T>) -> bool {
    match &inner.controller {
        ControllerState::Default(c) => inner.state == ReadableState::Readable && !c.close_requested,
        _ => false,
    }
}

fn should_call_pull<T: 'static>(inner: &ReadableInner<T>) -> bool {
    let ControllerState::Default(c) = &inner.controller else {
        return false;
    };
    if inner.state != ReadableState::Readable || c.close_requested || !c.started {
        return false;
    }
    if inner.locked() && inner.num_read_requests() > 0 {
        return true;
    }
    c.queue.desired_size(c.high_water_mark) > 0.0
}

pub(crate) fn call_pull_if_needed<T: 'static>(inner: &mut ReadableInner<T>) {
    if !should_call_pull(inner) {
        return;
    }
    let ControllerState::Default(c) = &mut inner.controller else {
        return;
    };
    if c.pulling {
        c.pull_again = true;
        return;
    }
    let Some(source) = c.source.clone() else {
        return;
    };
    c.pulling = true;
    trace!(queued = c.queue.len(), "pulling from source");
    let stream = inner.this.clone();
    let controller = ReadableStreamDefaultController::new(stream.clone());
    inner.scheduler.spawn(async move {
        let step = source.borrow_mut().pull(&controller);
        let result = step.await;
        if let Some(shared) = stream.upgrade() {
            pull_settled(&mut shared.borrow_mut(), result);
        }
    });
}

fn pull_settled<T: 'static>(inner: &mut ReadableInner<T>, result: Result<()>) {
    match result {
        Ok(()) => {
            let ControllerState::Default(c) = &mut inner.controller else {
                return;
            };
            c.pulling = false;
            if std::mem::take(&mut c.pull_again) {
                call_pull_if_needed(inner);
            }
        }
        Err(e) => {
            debug!(error = %e, "pull failed");
            inner.error_controller(e);
        }
    }
}

/// Spawns the source's start hook.
pub(crate) fn start<T: 'static>(shared: &Shared<T>, source: SourceCell<T>) {
    let stream = Rc::downgrade(shared);
    let controller = ReadableStreamDefaultController::new(stream.clone());
    shared.borrow().scheduler.spawn(async move {
        let step = source.borrow_mut().start(&controller);
        let result = step.await;
        let Some(shared) = stream.upgrade() else {
            return;
        };
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        match result {
            Ok(()) => {
                if let ControllerState::Default(c) = &mut inner.controller {
                    c.started = true;
                }
                call_pull_if_needed(inner);
            }
            Err(e) => {
                debug!(error = %e, "source start failed");
                inner.error_controller(e);
            }
        }
    });
}

/// Read entry point for default-controlled streams.
pub(crate) fn pull_steps<T: 'static>(inner: &mut ReadableInner<T>, request: Deferred<Option<T>>) {
    let ControllerState::Default(c) = &mut inner.controller else {
        request.reject(Error::internal("default pull steps on a non-default stream"));
        return;
    };
    if let Some(chunk) = c.queue.dequeue() {
        if c.close_requested && c.queue.is_empty() {
            c.source = None;
            inner.close();
        } else {
            call_pull_if_needed(inner);
        }
        request.resolve(Some(chunk));
        return;
    }
    inner.add_read_request(request);
    call_pull_if_needed(inner);
}
