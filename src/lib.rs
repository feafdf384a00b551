//! Backflow: backpressure-aware streams for single-threaded async Rust.
//!
//! # Overview
//!
//! Backflow models data flow as three kinds of stream: a [`ReadableStream`]
//! pulls chunks from an underlying source into a size-accounted queue, a
//! [`WritableStream`] pushes chunks through a queue into an underlying sink
//! one at a time, and a [`TransformStream`] joins the two through a user
//! transform. [`ReadableStream::pipe_to`] connects a readable to a writable
//! and propagates closure, errors and cancellation between them.
//!
//! # Core Guarantees
//!
//! - **Backpressure**: every stream reports `desired_size` against its
//!   high-water mark; sources are only pulled and producers only released
//!   when there is room
//! - **One step at a time**: at most one pull and at most one
//!   write/close/abort is outstanding per stream
//! - **Settle once**: every read, write, ready and closed handle settles
//!   exactly once, with the stored error if the stream fails
//! - **Exclusive access**: readers and writers lock their stream; dropping
//!   the handle releases the lock
//!
//! # Module Structure
//!
//! - [`readable`]: Readable streams, readers, default/byte/direct controllers
//! - [`writable`]: Writable streams, the writer, the sink controller
//! - [`transform`]: Transform streams
//! - [`pipe`]: `pipe_to`/`pipe_through` and their options
//! - [`abort`]: Abort signals for stopping a pipe
//! - [`queue`]: Queuing strategies and the size-accounted queue
//! - [`deferred`]: Settle-once completions and signals
//! - [`step`]: The future type user hooks return
//! - [`runtime`]: The scheduling seam and a local executor
//! - [`config`]: Stream defaults from code, environment or TOML
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```
//! use backflow::{LocalRuntime, PipeOptions, ReadableStream, TransformStream};
//!
//! # fn main() -> backflow::Result<()> {
//! let runtime = LocalRuntime::new();
//! let scheduler = runtime.scheduler();
//! let source = ReadableStream::from_iter(&scheduler, vec![1, 2, 3]);
//! let identity = TransformStream::identity(&scheduler)?;
//! let piped = source.pipe_through(&identity, PipeOptions::new())?;
//! let chunks = runtime.block_on(piped.collect())?;
//! assert_eq!(chunks, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

pub mod abort;
pub mod config;
pub mod deferred;
pub mod error;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod runtime;
pub mod step;
pub mod tracing_compat;
pub mod transform;
pub mod writable;

#[cfg(test)]
mod test_utils;

// Re-exports for convenient access to core types
pub use abort::{AbortController, AbortSignal};
pub use config::{ConfigError, StreamConfig};
pub use deferred::{Completion, Signal};
pub use error::{Error, ErrorCategory, ErrorKind, Result, ResultExt};
pub use pipe::PipeOptions;
pub use queue::{ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy};
pub use readable::{
    ByobReadResult, ByobRequest, ByteStreamOptions, DirectController, DirectSource,
    ReadableByteStreamController, ReadableState, ReadableStream, ReadableStreamBYOBReader,
    ReadableStreamDefaultController, ReadableStreamDefaultReader, ReadableStreamValues,
    UnderlyingByteSource, UnderlyingSource, ValuesOptions,
};
pub use runtime::{LocalRuntime, Schedule, Scheduler};
pub use step::StepFuture;
pub use transform::{
    IdentityTransformer, TransformStream, TransformStreamDefaultController, Transformer,
};
pub use writable::{
    UnderlyingSink, WritableState, WritableStream, WritableStreamDefaultController,
    WritableStreamDefaultWriter,
};
