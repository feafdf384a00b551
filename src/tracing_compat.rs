//! Logging facade for stream transitions.
//!
//! With the `tracing-integration` feature enabled this re-exports the
//! `tracing` macros. Without it, the same macro names expand to nothing, so
//! engine code can log unconditionally:
//!
//! ```
//! use backflow::tracing_compat::{debug, trace};
//!
//! let err = backflow::Error::reason("boom");
//! trace!(queue_len = 3, "chunk enqueued");
//! debug!(reason = %err, "stream errored");
//! ```
//!
//! ```toml
//! backflow = { version = "0.1", features = ["tracing-integration"] }
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! Macros that discard their arguments.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;
