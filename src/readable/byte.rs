//! Readable byte streams.
//!
//! Bytes are queued as owned chunks. Readers may supply their own buffers
//! (BYOB); each such read becomes a pull-into descriptor that is filled
//! from the queue, or by the source through a [`ByobRequest`].
//!
//! Descriptors are committed as soon as they hold at least one byte.

use super::{ControllerState, ReadableInner, ReadableState, ReadableStream};
use crate::config::StreamConfig;
use crate::deferred::Deferred;
use crate::error::{Error, ErrorKind, Result};
use crate::readable::reader::ByobReadResult;
use crate::runtime::Scheduler;
use crate::step::{self, StepFuture};
use crate::tracing_compat::{debug, trace};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

/// User hooks backing a byte stream.
pub trait UnderlyingByteSource: 'static {
    /// Called once at construction. Pulls wait until it settles.
    fn start(&mut self, controller: &ReadableByteStreamController) -> StepFuture {
        let _ = controller;
        step::done()
    }

    /// Called when the stream wants more bytes. Never overlaps itself.
    ///
    /// If a BYOB read is waiting, [`ReadableByteStreamController::byob_request`]
    /// exposes its buffer.
    fn pull(&mut self, controller: &ReadableByteStreamController) -> StepFuture {
        let _ = controller;
        step::done()
    }

    /// Called at most once when a consumer cancels the stream.
    fn cancel(&mut self, reason: Error) -> StepFuture {
        let _ = reason;
        step::done()
    }
}

/// Construction options for byte streams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteStreamOptions {
    /// Queue limit in bytes.
    pub high_water_mark: f64,
    /// When set, default reads on an empty queue allocate a buffer of this
    /// size and expose it to the source as a [`ByobRequest`].
    pub auto_allocate_chunk_size: Option<usize>,
}

impl ByteStreamOptions {
    /// Options taken from `config`.
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            high_water_mark: config.byte_high_water_mark,
            auto_allocate_chunk_size: config.auto_allocate_chunk_size,
        }
    }
}

impl Default for ByteStreamOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullIntoKind {
    /// Auto-allocated on behalf of a default reader.
    Default,
    /// Supplied by a BYOB reader.
    Byob,
    /// Its reader was released; filled bytes go back to the queue.
    Detached,
}

pub(crate) struct PullIntoDescriptor {
    pub(crate) buffer: Vec<u8>,
    pub(crate) bytes_filled: usize,
    pub(crate) kind: PullIntoKind,
    pub(crate) generation: u64,
}

impl PullIntoDescriptor {
    pub(crate) fn new(buffer: Vec<u8>, kind: PullIntoKind, generation: u64) -> Self {
        Self {
            buffer,
            bytes_filled: 0,
            kind,
            generation,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buffer.len() - self.bytes_filled
    }

    pub(crate) fn into_filled(mut self) -> Vec<u8> {
        self.buffer.truncate(self.bytes_filled);
        self.buffer
    }
}

/// Copies queued bytes into `desc` until either runs out. Returns the count.
pub(crate) fn fill_from_queue(
    queue: &mut VecDeque<Vec<u8>>,
    queue_total: &mut usize,
    desc: &mut PullIntoDescriptor,
) -> usize {
    let mut copied = 0;
    while desc.remaining() > 0 {
        let Some(front) = queue.front_mut() else {
            break;
        };
        let n = front.len().min(desc.remaining());
        let start = desc.bytes_filled;
        desc.buffer[start..start + n].copy_from_slice(&front[..n]);
        desc.bytes_filled += n;
        *queue_total -= n;
        copied += n;
        if n == front.len() {
            queue.pop_front();
        } else {
            front.drain(..n);
        }
    }
    copied
}

type ByteSourceCell = Rc<RefCell<Box<dyn UnderlyingByteSource>>>;

pub(crate) struct ByteControllerState {
    pub(crate) queue: VecDeque<Vec<u8>>,
    pub(crate) queue_total: usize,
    pub(crate) high_water_mark: f64,
    pub(crate) auto_allocate_chunk_size: Option<usize>,
    pub(crate) pending_pull_intos: VecDeque<PullIntoDescriptor>,
    next_generation: u64,
    pub(crate) started: bool,
    pub(crate) close_requested: bool,
    pub(crate) pulling: bool,
    pub(crate) pull_again: bool,
    pub(crate) source: Option<ByteSourceCell>,
}

impl ByteControllerState {
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn desired_size(&self) -> f64 {
        self.high_water_mark - self.queue_total as f64
    }

    pub(crate) fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total = 0;
        self.pending_pull_intos.clear();
    }

    /// Keeps only the head descriptor and detaches it from its reader.
    pub(crate) fn release_steps(&mut self) {
        if let Some(mut first) = self.pending_pull_intos.pop_front() {
            first.kind = PullIntoKind::Detached;
            self.pending_pull_intos.clear();
            self.pending_pull_intos.push_back(first);
        }
    }

    fn push_descriptor(&mut self, buffer: Vec<u8>, kind: PullIntoKind) {
        self.next_generation += 1;
        self.pending_pull_intos
            .push_back(PullIntoDescriptor::new(buffer, kind, self.next_generation));
    }

    fn enqueue_chunk(&mut self, bytes: Vec<u8>) {
        self.queue_total += bytes.len();
        self.queue.push_back(bytes);
    }
}

pub(crate) fn create(
    scheduler: &Scheduler,
    source: impl UnderlyingByteSource,
    options: ByteStreamOptions,
) -> Result<ReadableStream<Vec<u8>>> {
    if options.high_water_mark.is_nan() || options.high_water_mark < 0.0 {
        return Err(Error::invalid_size(options.high_water_mark));
    }
    if options.auto_allocate_chunk_size == Some(0) {
        return Err(Error::new(ErrorKind::InvalidBuffer)
            .with_message("auto allocate chunk size must be greater than 0"));
    }
    let source: ByteSourceCell = Rc::new(RefCell::new(Box::new(source)));
    let inner = ReadableInner::create(
        scheduler,
        ControllerState::Byte(ByteControllerState {
            queue: VecDeque::new(),
            queue_total: 0,
            high_water_mark: options.high_water_mark,
            auto_allocate_chunk_size: options.auto_allocate_chunk_size,
            pending_pull_intos: VecDeque::new(),
            next_generation: 0,
            started: false,
            close_requested: false,
            pulling: false,
            pull_again: false,
            source: Some(Rc::clone(&source)),
        }),
        pull_steps,
    );

    let stream = Rc::downgrade(&inner);
    let controller = ReadableByteStreamController {
        stream: stream.clone(),
    };
    scheduler.spawn(async move {
        let step = source.borrow_mut().start(&controller);
        let result = step.await;
        let Some(shared) = stream.upgrade() else {
            return;
        };
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        match result {
            Ok(()) => {
                if let ControllerState::Byte(c) = &mut inner.controller {
                    c.started = true;
                }
                call_pull_if_needed(inner);
            }
            Err(e) => {
                debug!(error = %e, "byte source start failed");
                inner.error_controller(e);
            }
        }
    });
    Ok(ReadableStream { inner })
}

fn should_call_pull(inner: &ReadableInner<Vec<u8>>) -> bool {
    let ControllerState::Byte(c) = &inner.controller else {
        return false;
    };
    if inner.state != ReadableState::Readable || c.close_requested || !c.started {
        return false;
    }
    if inner.num_read_requests() > 0 || inner.num_read_into_requests() > 0 {
        return true;
    }
    c.desired_size() > 0.0
}

fn call_pull_if_needed(inner: &mut ReadableInner<Vec<u8>>) {
    if !should_call_pull(inner) {
        return;
    }
    let ControllerState::Byte(c) = &mut inner.controller else {
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
    trace!(queued_bytes = c.queue_total, "pulling from byte source");
    let stream = inner.this.clone();
    let controller = ReadableByteStreamController {
        stream: stream.clone(),
    };
    inner.scheduler.spawn(async move {
        let step = source.borrow_mut().pull(&controller);
        let result = step.await;
        let Some(shared) = stream.upgrade() else {
            return;
        };
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        match result {
            Ok(()) => {
                let ControllerState::Byte(c) = &mut inner.controller else {
                    return;
                };
                c.pulling = false;
                if std::mem::take(&mut c.pull_again) {
                    call_pull_if_needed(inner);
                }
            }
            Err(e) => {
                debug!(error = %e, "byte pull failed");
                inner.error_controller(e);
            }
        }
    });
}

/// After the queue shrank: finish a pending close or pull for more.
fn after_dequeue(inner: &mut ReadableInner<Vec<u8>>) {
    let ControllerState::Byte(c) = &mut inner.controller else {
        return;
    };
    if c.queue_total == 0 && c.close_requested {
        c.source = None;
        inner.close();
    } else {
        call_pull_if_needed(inner);
    }
}

/// Routes a completed descriptor to its reader, or back to the queue.
fn commit(inner: &mut ReadableInner<Vec<u8>>, desc: PullIntoDescriptor, done: bool) {
    let kind = desc.kind;
    let filled = desc.into_filled();
    let leftover = match kind {
        PullIntoKind::Byob => inner.fulfill_read_into_request(filled, done),
        PullIntoKind::Default => inner.fulfill_read_request(filled),
        PullIntoKind::Detached => Some(filled),
    };
    if let Some(bytes) = leftover.filter(|bytes| !bytes.is_empty()) {
        if let ControllerState::Byte(c) = &mut inner.controller {
            c.enqueue_chunk(bytes);
        }
    }
}

fn process_pull_intos_using_queue(inner: &mut ReadableInner<Vec<u8>>) {
    loop {
        let ControllerState::Byte(c) = &mut inner.controller else {
            return;
        };
        if c.queue_total == 0 {
            return;
        }
        let Some(desc) = c.pending_pull_intos.front_mut() else {
            return;
        };
        if fill_from_queue(&mut c.queue, &mut c.queue_total, desc) == 0 {
            return;
        }
        let Some(desc) = c.pending_pull_intos.pop_front() else {
            return;
        };
        commit(inner, desc, false);
    }
}

/// Hands queued bytes to whichever reader is waiting.
fn drain_queue_to_readers(inner: &mut ReadableInner<Vec<u8>>) {
    if inner.has_byob_reader() {
        process_pull_intos_using_queue(inner);
        return;
    }
    while inner.num_read_requests() > 0 {
        let ControllerState::Byte(c) = &mut inner.controller else {
            return;
        };
        let Some(chunk) = c.queue.pop_front() else {
            return;
        };
        c.queue_total -= chunk.len();
        if c
            .pending_pull_intos
            .front()
            .is_some_and(|desc| desc.kind == PullIntoKind::Default)
        {
            c.pending_pull_intos.pop_front();
        }
        inner.fulfill_read_request(chunk);
    }
}

/// Default-reader read on a byte stream.
pub(crate) fn pull_steps(inner: &mut ReadableInner<Vec<u8>>, request: Deferred<Option<Vec<u8>>>) {
    let ControllerState::Byte(c) = &mut inner.controller else {
        request.reject(Error::internal("byte pull steps on a non-byte stream"));
        return;
    };
    if let Some(chunk) = c.queue.pop_front() {
        c.queue_total -= chunk.len();
        after_dequeue(inner);
        request.resolve(Some(chunk));
        return;
    }
    if let Some(size) = c.auto_allocate_chunk_size {
        c.push_descriptor(vec![0; size], PullIntoKind::Default);
    }
    inner.add_read_request(request);
    call_pull_if_needed(inner);
}

/// BYOB read on a byte stream.
pub(crate) fn pull_into(
    inner: &mut ReadableInner<Vec<u8>>,
    buffer: Vec<u8>,
    request: Deferred<ByobReadResult>,
) {
    let ControllerState::Byte(c) = &mut inner.controller else {
        request.reject(Error::internal("byte pull-into on a non-byte stream"));
        return;
    };
    if !c.pending_pull_intos.is_empty() {
        c.push_descriptor(buffer, PullIntoKind::Byob);
        inner.add_read_into_request(request);
        return;
    }
    if c.queue_total > 0 {
        let mut desc = PullIntoDescriptor::new(buffer, PullIntoKind::Byob, 0);
        fill_from_queue(&mut c.queue, &mut c.queue_total, &mut desc);
        after_dequeue(inner);
        request.resolve(ByobReadResult {
            buffer: desc.into_filled(),
            done: false,
        });
        return;
    }
    c.push_descriptor(buffer, PullIntoKind::Byob);
    inner.add_read_into_request(request);
    call_pull_if_needed(inner);
}

/// Handle given to an [`UnderlyingByteSource`].
#[derive(Clone)]
pub struct ReadableByteStreamController {
    stream: Weak<RefCell<ReadableInner<Vec<u8>>>>,
}

impl fmt::Debug for ReadableByteStreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableByteStreamController")
            .field("attached", &(self.stream.strong_count() > 0))
            .finish()
    }
}

impl ReadableByteStreamController {
    fn upgrade(&self) -> Result<Rc<RefCell<ReadableInner<Vec<u8>>>>> {
        self.stream
            .upgrade()
            .ok_or_else(|| Error::invalid_state("byte stream was dropped"))
    }

    /// `high_water_mark - queued bytes`; `None` once errored, `0` once closed.
    #[must_use]
    pub fn desired_size(&self) -> Option<f64> {
        self.stream
            .upgrade()
            .and_then(|stream| stream.borrow().desired_size())
    }

    /// The oldest waiting buffer-supplied read, if any.
    #[must_use]
    pub fn byob_request(&self) -> Option<ByobRequest> {
        let stream = self.stream.upgrade()?;
        let inner = stream.borrow();
        if inner.state != ReadableState::Readable {
            return None;
        }
        let ControllerState::Byte(c) = &inner.controller else {
            return None;
        };
        c.pending_pull_intos.front().map(|desc| ByobRequest {
            stream: self.stream.clone(),
            generation: desc.generation,
        })
    }

    /// Queues `chunk`, handing it to waiting readers first.
    ///
    /// Empty chunks fail with `InvalidBuffer`.
    pub fn enqueue(&self, chunk: Vec<u8>) -> Result<()> {
        if chunk.is_empty() {
            return Err(Error::new(ErrorKind::InvalidBuffer).with_message("chunk must not be empty"));
        }
        let shared = self.upgrade()?;
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        let readable = inner.state == ReadableState::Readable;
        let ControllerState::Byte(c) = &mut inner.controller else {
            return Err(Error::internal("byte controller on a non-byte stream"));
        };
        if c.close_requested || !readable {
            return Err(Error::invalid_state(
                "cannot enqueue on a byte stream that is closing or not readable",
            ));
        }
        while c
            .pending_pull_intos
            .front()
            .is_some_and(|desc| desc.kind == PullIntoKind::Detached)
        {
            if let Some(desc) = c.pending_pull_intos.pop_front() {
                let filled = desc.into_filled();
                if !filled.is_empty() {
                    c.enqueue_chunk(filled);
                }
            }
        }
        c.enqueue_chunk(chunk);
        drain_queue_to_readers(inner);
        call_pull_if_needed(inner);
        Ok(())
    }

    /// Requests close. Queued bytes are still delivered first; waiting BYOB
    /// reads resolve as done.
    pub fn close(&self) -> Result<()> {
        let shared = self.upgrade()?;
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        let readable = inner.state == ReadableState::Readable;
        let ControllerState::Byte(c) = &mut inner.controller else {
            return Err(Error::internal("byte controller on a non-byte stream"));
        };
        if c.close_requested || !readable {
            return Err(Error::invalid_state(
                "cannot close a byte stream that is closing or not readable",
            ));
        }
        c.close_requested = true;
        if c.queue_total > 0 {
            trace!(queued_bytes = c.queue_total, "byte close deferred until queue drains");
            return Ok(());
        }
        c.source = None;
        inner.close();
        Ok(())
    }

    /// Errors the stream. No-op unless it is readable.
    pub fn error(&self, error: Error) {
        if let Some(stream) = self.stream.upgrade() {
            stream.borrow_mut().error_controller(error);
        }
    }
}

/// A waiting buffer-supplied read, exposed to the source.
///
/// Valid until it is responded to or the read goes away.
pub struct ByobRequest {
    stream: Weak<RefCell<ReadableInner<Vec<u8>>>>,
    generation: u64,
}

impl fmt::Debug for ByobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByobRequest")
            .field("generation", &self.generation)
            .field("view_len", &self.view_len())
            .finish()
    }
}

impl ByobRequest {
    fn stale() -> Error {
        Error::invalid_state("BYOB request is no longer valid")
    }

    /// Bytes still writable in the request's buffer. `0` if stale.
    #[must_use]
    pub fn view_len(&self) -> usize {
        let Some(stream) = self.stream.upgrade() else {
            return 0;
        };
        let inner = stream.borrow();
        match &inner.controller {
            ControllerState::Byte(c) => c
                .pending_pull_intos
                .front()
                .filter(|desc| desc.generation == self.generation)
                .map_or(0, PullIntoDescriptor::remaining),
            _ => 0,
        }
    }

    /// Runs `f` over the writable part of the request's buffer.
    ///
    /// `f` must not touch the stream. Call [`respond`](Self::respond)
    /// afterwards with the number of bytes written.
    pub fn write_into<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let stream = self.stream.upgrade().ok_or_else(Self::stale)?;
        let mut inner = stream.borrow_mut();
        let ControllerState::Byte(c) = &mut inner.controller else {
            return Err(Self::stale());
        };
        let desc = c
            .pending_pull_intos
            .front_mut()
            .filter(|desc| desc.generation == self.generation)
            .ok_or_else(Self::stale)?;
        let start = desc.bytes_filled;
        Ok(f(&mut desc.buffer[start..]))
    }

    /// Commits `bytes_written` bytes to the waiting read.
    ///
    /// While readable, `bytes_written` must be in `1..=view_len()`. After
    /// close only `0` is accepted.
    pub fn respond(&self, bytes_written: usize) -> Result<()> {
        let stream = self.stream.upgrade().ok_or_else(Self::stale)?;
        let mut guard = stream.borrow_mut();
        let inner = &mut *guard;
        match inner.state {
            ReadableState::Closed if bytes_written == 0 => return Ok(()),
            ReadableState::Closed => {
                return Err(Error::new(ErrorKind::InvalidBuffer)
                    .with_message("bytes written must be 0 once the stream is closed"));
            }
            ReadableState::Errored => return Err(Self::stale()),
            ReadableState::Readable => {}
        }
        if bytes_written == 0 {
            return Err(Error::new(ErrorKind::InvalidBuffer)
                .with_message("bytes written must be greater than 0 while readable"));
        }
        let ControllerState::Byte(c) = &mut inner.controller else {
            return Err(Self::stale());
        };
        let desc = c
            .pending_pull_intos
            .front_mut()
            .filter(|desc| desc.generation == self.generation)
            .ok_or_else(Self::stale)?;
        if bytes_written > desc.remaining() {
            return Err(Error::new(ErrorKind::InvalidBuffer).with_message(format!(
                "bytes written ({bytes_written}) exceed the view ({})",
                desc.remaining()
            )));
        }
        desc.bytes_filled += bytes_written;
        let Some(desc) = c.pending_pull_intos.pop_front() else {
            return Err(Self::stale());
        };
        commit(inner, desc, false);
        process_pull_intos_using_queue(inner);
        call_pull_if_needed(inner);
        Ok(())
    }

    /// Copies as much of `data` as fits and responds. Returns the count.
    pub fn fill(&self, data: &[u8]) -> Result<usize> {
        let n = self.write_into(|view| {
            let n = view.len().min(data.len());
            view[..n].copy_from_slice(&data[..n]);
            n
        })?;
        self.respond(n)?;
        Ok(n)
    }
}
