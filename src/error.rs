//! Error types and error handling strategy for backflow.
//!
//! Every stream operation reports failures through a single [`Error`] type.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed: the [`ErrorKind`] says what went wrong,
//!   the optional message carries the caller-supplied reason
//! - Errors are cheap to clone, so one stored error can settle every pending
//!   read, write, ready and closed handle of a stream
//! - Algorithm failures are never retried; the owning stream goes straight
//!   to its terminal errored state
//!
//! # Error Categories
//!
//! - **Stream**: terminal stream errors carrying a reason (explicit `error()`,
//!   `abort()`, a failing user step)
//! - **Protocol**: caller misuse, reported synchronously to the violating call
//! - **Lifecycle**: a reader or writer was released, a pipe was aborted or
//!   its destination closed early
//! - **Internal**: engine bugs and dropped completions

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Stream ===
    /// A caller-supplied reason passed to `error()`, `abort()` or `cancel()`,
    /// or the failure of a user step.
    User,
    /// The user size algorithm failed to measure a chunk.
    SizeAlgorithm,

    // === Protocol violations ===
    /// The stream already has an active reader or writer.
    Locked,
    /// The operation is not legal in the stream's current state.
    InvalidState,
    /// A size or high-water-mark was negative, NaN or infinite.
    InvalidSize,
    /// A caller-supplied buffer or `respond` length was unusable.
    InvalidBuffer,

    // === Lifecycle ===
    /// The reader or writer handle was released from its stream.
    Released,
    /// The operation was cancelled.
    Cancelled,
    /// An abort signal fired.
    Aborted,
    /// A pipe destination closed while the source was still readable.
    DestinationClosed,

    // === Internal ===
    /// Internal engine error (should not happen).
    Internal,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::User | Self::SizeAlgorithm => ErrorCategory::Stream,
            Self::Locked | Self::InvalidState | Self::InvalidSize | Self::InvalidBuffer => {
                ErrorCategory::Protocol
            }
            Self::Released | Self::Cancelled | Self::Aborted | Self::DestinationClosed => {
                ErrorCategory::Lifecycle
            }
            Self::Internal => ErrorCategory::Internal,
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Terminal stream errors.
    Stream,
    /// Caller misuse.
    Protocol,
    /// Handle and pipe lifecycle conditions.
    Lifecycle,
    /// Engine bugs.
    Internal,
}

/// The main error type for stream operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Creates a user error carrying `reason` as its message.
    ///
    /// This is the usual way to build the argument of `error()`, `abort()`
    /// and `cancel()`.
    #[must_use]
    pub fn reason(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(reason)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error reports caller misuse.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self.kind.category(), ErrorCategory::Protocol)
    }

    /// Returns true if this error came from releasing a reader or writer.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        matches!(self.kind, ErrorKind::Released)
    }

    /// Returns true if `other` has the same kind and message.
    ///
    /// Sources are not compared.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }

    pub(crate) fn locked(what: &str) -> Self {
        Self::new(ErrorKind::Locked).with_message(format!("{what} is locked"))
    }

    pub(crate) fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_message(detail)
    }

    pub(crate) fn invalid_size(size: f64) -> Self {
        Self::new(ErrorKind::InvalidSize)
            .with_message(format!("size must be a finite, non-negative number, got {size}"))
    }

    pub(crate) fn released(what: &str) -> Self {
        Self::new(ErrorKind::Released).with_message(format!("{what} was released"))
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
#[allow(clippy::result_large_err)]
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for stream operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_reason() {
        let err = Error::reason("boom");
        assert_eq!(err.to_string(), "User: boom");
        assert_eq!(err.message(), Some("boom"));
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::reason("outer").with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn clones_share_source() {
        let err = Error::reason("outer").with_source(Underlying);
        let copy = err.clone();
        assert!(copy.same_as(&err));
        assert!(copy.source().is_some());
    }

    #[test]
    fn categories_match_taxonomy() {
        assert_eq!(ErrorKind::User.category(), ErrorCategory::Stream);
        assert_eq!(ErrorKind::SizeAlgorithm.category(), ErrorCategory::Stream);
        assert!(Error::locked("stream").is_protocol_violation());
        assert!(Error::invalid_size(-1.0).is_protocol_violation());
        assert!(Error::released("reader").is_released());
        assert!(!Error::reason("x").is_protocol_violation());
    }

    #[test]
    fn result_ext_adds_message() {
        let res: Result<()> = Err(Error::new(ErrorKind::InvalidState));
        let err = res.context("enqueue failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "InvalidState: enqueue failed");
    }
}
