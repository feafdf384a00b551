//! Futures returned by user-supplied stream hooks.
//!
//! Every optional hook on [`UnderlyingSource`](crate::UnderlyingSource),
//! [`UnderlyingSink`](crate::UnderlyingSink) and
//! [`Transformer`](crate::Transformer) returns a [`StepFuture`]. The future
//! must be `'static`: the engine spawns it and only borrows the hook's
//! receiver for the synchronous call that builds the future.

use crate::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;

/// A boxed, thread-local future produced by a user hook.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// A step that completes immediately and successfully.
#[must_use]
pub fn done() -> StepFuture {
    Box::pin(std::future::ready(Ok(())))
}

/// A step that completes immediately with `error`.
#[must_use]
pub fn fail(error: Error) -> StepFuture {
    Box::pin(std::future::ready(Err(error)))
}

/// A step that completes immediately with `result`.
#[must_use]
pub fn from_result(result: Result<()>) -> StepFuture {
    Box::pin(std::future::ready(result))
}

/// Boxes an arbitrary future as a step.
pub fn boxed(future: impl Future<Output = Result<()>> + 'static) -> StepFuture {
    Box::pin(future)
}
