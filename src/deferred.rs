//! Settle-once completion primitives.
//!
//! Two flavours cover every asynchronous handle the engine hands out:
//!
//! - [`Deferred`] / [`Completion`]: a single-consumer pair. The engine keeps
//!   the [`Deferred`] (for example in a stream's queue of pending reads) and
//!   the caller awaits the [`Completion`]. Settling consumes the `Deferred`,
//!   so a handle can never be settled twice.
//! - [`Signal`]: a shared, cloneable `Result<(), Error>` that any number of
//!   waiters can observe. Used for `ready` and `closed` notifications.
//!
//! ```text
//!   engine                               caller
//!   ┌──────────────┐   settle(result)    ┌──────────────┐
//!   │ Deferred<T>  │ ──────────────────▶ │ Completion<T>│ .await -> Result<T>
//!   └──────────────┘                     └──────────────┘
//! ```
//!
//! # Drop Semantics
//!
//! Dropping a [`Deferred`] without settling it rejects the paired
//! [`Completion`] with an [`ErrorKind::Internal`](crate::ErrorKind::Internal)
//! error, so a caller is never left waiting forever on a handle the engine
//! lost.

use crate::error::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Slot<T> {
    outcome: Option<Result<T>>,
    waker: Option<Waker>,
}

/// Creates a connected [`Deferred`] / [`Completion`] pair.
#[must_use]
pub fn deferred<T>() -> (Deferred<T>, Completion<T>) {
    let slot = Rc::new(RefCell::new(Slot {
        outcome: None,
        waker: None,
    }));
    (
        Deferred {
            slot: Some(Rc::clone(&slot)),
        },
        Completion { slot },
    )
}

/// The settling half of a completion.
pub struct Deferred<T> {
    slot: Option<Rc<RefCell<Slot<T>>>>,
}

impl<T> Deferred<T> {
    /// Fulfills the completion with `value`.
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Rejects the completion with `error`.
    pub fn reject(self, error: Error) {
        self.settle(Err(error));
    }

    /// Settles the completion with `result`.
    pub fn settle(mut self, result: Result<T>) {
        if let Some(slot) = self.slot.take() {
            Self::store(&slot, result);
        }
    }

    fn store(slot: &Rc<RefCell<Slot<T>>>, result: Result<T>) {
        let waker = {
            let mut slot = slot.borrow_mut();
            slot.outcome = Some(result);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Deferred<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            Self::store(&slot, Err(Error::internal("completion dropped before settling")));
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

/// The awaiting half of a completion.
///
/// Resolves to the settled `Result<T>` exactly once.
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Completion<T> {
    /// Returns an already-settled completion.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot {
                outcome: Some(result),
                waker: None,
            })),
        }
    }

    /// Returns a completion already fulfilled with `value`.
    pub fn resolved(value: T) -> Self {
        Self::ready(Ok(value))
    }

    /// Returns a completion already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        Self::ready(Err(error))
    }

    /// Returns true once the paired [`Deferred`] has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    /// Takes the outcome without waiting, if it is available.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        self.slot.borrow_mut().outcome.take()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(outcome) = slot.outcome.take() {
            return Poll::Ready(outcome);
        }
        match &slot.waker {
            Some(existing) if existing.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}

struct SignalInner {
    outcome: Option<Result<()>>,
    waiters: Vec<Waker>,
}

/// A settle-once notification observable by many waiters.
///
/// Clones share state. Settling an already-settled signal is ignored and
/// reported by the `false` return value.
#[derive(Clone)]
pub struct Signal {
    inner: Rc<RefCell<SignalInner>>,
}

impl Signal {
    /// Creates an unsettled signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SignalInner {
                outcome: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Creates a signal that is already resolved.
    #[must_use]
    pub fn resolved() -> Self {
        let signal = Self::new();
        signal.resolve();
        signal
    }

    /// Creates a signal that is already rejected with `error`.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        let signal = Self::new();
        signal.reject(error);
        signal
    }

    /// Resolves the signal. Returns false if it was already settled.
    pub fn resolve(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Rejects the signal. Returns false if it was already settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    /// Settles the signal. Returns false if it was already settled.
    pub fn settle(&self, result: Result<()>) -> bool {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(result);
            std::mem::take(&mut inner.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
        true
    }

    /// Returns true once the signal has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// Returns a copy of the outcome, if settled.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<()>> {
        self.inner.borrow().outcome.clone()
    }

    /// Returns a future that resolves with the outcome.
    pub fn wait(&self) -> SignalWait {
        SignalWait {
            signal: self.clone(),
        }
    }

    /// Returns true if both handles refer to the same signal.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("outcome", &self.inner.borrow().outcome)
            .finish()
    }
}

/// Future returned by [`Signal::wait`].
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct SignalWait {
    signal: Signal,
}

impl Future for SignalWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.signal.inner.borrow_mut();
        if let Some(outcome) = &inner.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            inner.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future;

    #[test]
    fn deferred_resolves_completion() {
        let (settle, completion) = deferred::<u8>();
        assert!(!completion.is_settled());
        settle.resolve(3);
        assert!(completion.is_settled());
        assert_eq!(future::block_on(completion).expect("resolved"), 3);
    }

    #[test]
    fn deferred_rejects_completion() {
        let (settle, completion) = deferred::<u8>();
        settle.reject(Error::reason("boom"));
        let err = future::block_on(completion).expect_err("rejected");
        assert_eq!(err.message(), Some("boom"));
    }

    #[test]
    fn dropped_deferred_rejects_as_internal() {
        let (settle, completion) = deferred::<()>();
        drop(settle);
        let err = future::block_on(completion).expect_err("rejected");
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }

    #[test]
    fn completion_pending_until_settled() {
        let (settle, mut completion) = deferred::<&str>();
        assert!(future::block_on(future::poll_once(&mut completion)).is_none());
        settle.resolve("done");
        assert_eq!(future::block_on(completion).expect("resolved"), "done");
    }

    #[test]
    fn signal_settles_once() {
        let signal = Signal::new();
        assert!(signal.resolve());
        assert!(!signal.reject(Error::reason("late")));
        assert!(signal.outcome().expect("settled").is_ok());
    }

    #[test]
    fn signal_wakes_every_waiter() {
        let signal = Signal::new();
        let mut first = signal.wait();
        let mut second = signal.clone().wait();
        assert!(future::block_on(future::poll_once(&mut first)).is_none());
        assert!(future::block_on(future::poll_once(&mut second)).is_none());

        signal.reject(Error::reason("closed"));
        let a = future::block_on(first).expect_err("rejected");
        let b = future::block_on(second).expect_err("rejected");
        assert!(a.same_as(&b));
    }

    #[test]
    fn ready_constructors() {
        assert!(Signal::resolved().is_settled());
        assert!(Signal::rejected(Error::reason("x")).outcome().expect("settled").is_err());
        assert!(Completion::resolved(1).is_settled());
        let mut rejected = Completion::<()>::rejected(Error::reason("y"));
        assert!(rejected.try_take().expect("settled").is_err());
    }
}
