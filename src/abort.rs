//! Abort signals for cancelling a pipe from outside.
//!
//! An [`AbortController`] owns the right to abort; any number of
//! [`AbortSignal`] clones observe it. Aborting is one-shot: the first reason
//! wins and later calls return `false`.

use crate::deferred::Signal;
use crate::error::{Error, ErrorKind};
use std::fmt;

/// Default reason used by [`AbortController::abort`] when none is given.
fn default_reason() -> Error {
    Error::new(ErrorKind::Aborted).with_message("the operation was aborted")
}

/// Triggers an [`AbortSignal`].
#[derive(Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// Creates a controller with a fresh, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle observers can hold.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Triggers the signal. Returns `false` if it was already aborted.
    pub fn abort(&self, reason: Option<Error>) -> bool {
        self.signal.inner.reject(reason.unwrap_or_else(default_reason))
    }
}

/// Observes an [`AbortController`].
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Signal,
}

impl AbortSignal {
    /// A signal that is already aborted with `reason`.
    #[must_use]
    pub fn aborted_with(reason: Error) -> Self {
        Self {
            inner: Signal::rejected(reason),
        }
    }

    /// True once the controller has aborted.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.inner.is_settled()
    }

    /// The abort reason, once aborted.
    #[must_use]
    pub fn reason(&self) -> Option<Error> {
        self.inner.outcome().and_then(Result::err)
    }

    /// Resolves with the reason when the signal fires.
    pub fn wait(&self) -> impl std::future::Future<Output = Error> + 'static {
        let wait = self.inner.wait();
        async move {
            match wait.await {
                Err(reason) => reason,
                Ok(()) => default_reason(),
            }
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .finish()
    }
}
