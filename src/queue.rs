//! Size-accounted queues and queuing strategies.
//!
//! A [`SizedQueue`] keeps its chunks in FIFO order together with the sum of
//! their sizes. Controllers compare that sum against a high-water mark to
//! derive `desired_size` and backpressure:
//!
//! ```text
//! desired_size = high_water_mark - total_size
//! backpressure = desired_size <= 0
//! ```
//!
//! Sizes come from a [`QueuingStrategy`]. The size function is a plain
//! synchronous `Fn`, so it cannot suspend; it may fail, in which case the
//! caller errors the owning stream and the queue is left untouched.

use crate::config::StreamConfig;
use crate::error::{Error, ErrorKind, Result};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A chunk size function.
pub type SizeFn<T> = Rc<dyn Fn(&T) -> Result<f64>>;

/// High-water mark plus an optional size function.
///
/// Without a size function every chunk counts as `1`.
pub struct QueuingStrategy<T> {
    high_water_mark: f64,
    size: Option<SizeFn<T>>,
}

impl<T> QueuingStrategy<T> {
    /// Counts chunks against `high_water_mark`.
    #[must_use]
    pub fn new(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: None,
        }
    }

    /// Measures chunks with `size` instead of counting them.
    #[must_use]
    pub fn with_size(mut self, size: impl Fn(&T) -> Result<f64> + 'static) -> Self {
        self.size = Some(Rc::new(size));
        self
    }

    /// Returns the configured high-water mark.
    #[must_use]
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    /// Returns true if a custom size function is set.
    #[must_use]
    pub fn has_size_fn(&self) -> bool {
        self.size.is_some()
    }

    pub(crate) fn validated_high_water_mark(&self) -> Result<f64> {
        if self.high_water_mark.is_nan() || self.high_water_mark < 0.0 {
            return Err(Error::new(ErrorKind::InvalidSize).with_message(format!(
                "high water mark must be a non-negative number, got {}",
                self.high_water_mark
            )));
        }
        Ok(self.high_water_mark)
    }

    pub(crate) fn into_parts(self) -> (f64, Option<SizeFn<T>>) {
        (self.high_water_mark, self.size)
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self::new(StreamConfig::default().readable_high_water_mark)
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("size", &self.size.as_ref().map(|_| "fn"))
            .finish()
    }
}

/// Strategy that counts every chunk as one unit.
#[derive(Debug, Clone, Copy)]
pub struct CountQueuingStrategy;

impl CountQueuingStrategy {
    /// Builds a counting strategy.
    #[must_use]
    pub fn new<T>(high_water_mark: f64) -> QueuingStrategy<T> {
        QueuingStrategy::new(high_water_mark)
    }
}

/// Strategy that measures chunks by their byte length.
#[derive(Debug, Clone, Copy)]
pub struct ByteLengthQueuingStrategy;

impl ByteLengthQueuingStrategy {
    /// Builds a byte-length strategy.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new<T: AsRef<[u8]>>(high_water_mark: f64) -> QueuingStrategy<T> {
        QueuingStrategy::new(high_water_mark).with_size(|chunk: &T| Ok(chunk.as_ref().len() as f64))
    }
}

/// Measures `chunk`, wrapping a user failure as a size-algorithm error.
pub(crate) fn measure<T>(size: Option<&SizeFn<T>>, chunk: &T) -> Result<f64> {
    let Some(size) = size else {
        return Ok(1.0);
    };
    size(chunk).map_err(|e| {
        if e.kind() == ErrorKind::SizeAlgorithm {
            return e;
        }
        let message = e.message().unwrap_or("size algorithm failed").to_owned();
        Error::new(ErrorKind::SizeAlgorithm)
            .with_message(message)
            .with_source(e)
    })
}

/// A queued value and the size it was accounted with.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry<T> {
    /// The queued chunk.
    pub value: T,
    /// Its size; always finite and non-negative.
    pub size: f64,
}

/// FIFO queue with a running total of entry sizes.
#[derive(Debug, Clone)]
pub struct SizedQueue<T> {
    entries: VecDeque<QueueEntry<T>>,
    total_size: f64,
}

impl<T> SizedQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Appends `value` with `size`.
    ///
    /// Fails with [`ErrorKind::InvalidSize`] and leaves the queue unchanged
    /// if `size` is NaN, infinite or negative.
    pub fn enqueue(&mut self, value: T, size: f64) -> Result<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(Error::invalid_size(size));
        }
        self.entries.push_back(QueueEntry { value, size });
        self.total_size += size;
        Ok(())
    }

    /// Removes the front entry and returns its value.
    pub fn dequeue(&mut self) -> Option<T> {
        let entry = self.entries.pop_front()?;
        self.total_size -= entry.size;
        // Absorb floating point drift.
        if self.total_size < 0.0 || self.entries.is_empty() {
            self.total_size = 0.0;
        }
        Some(entry.value)
    }

    /// Returns the front value.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.entries.front().map(|entry| &entry.value)
    }

    /// Returns the front value mutably.
    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.entries.front_mut().map(|entry| &mut entry.value)
    }

    /// Removes every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the sizes of all queued entries.
    #[must_use]
    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    /// `high_water_mark - total_size`.
    #[must_use]
    pub fn desired_size(&self, high_water_mark: f64) -> f64 {
        high_water_mark - self.total_size
    }

    /// Iterates over queued entries front to back.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<T>> {
        self.entries.iter()
    }
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
