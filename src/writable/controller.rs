//! The handle a sink uses to fail its stream.

use super::{WritableInner, WritableState};
use crate::error::Error;
use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

/// Type-erased view of a writable stream, so the controller does not carry
/// the chunk type.
pub(crate) trait ErrorTarget {
    fn error_if_writable(&self, error: Error);
    fn is_writable(&self) -> bool;
}

impl<T: 'static> ErrorTarget for RefCell<WritableInner<T>> {
    fn error_if_writable(&self, error: Error) {
        self.borrow_mut().error_if_needed(error);
    }

    fn is_writable(&self) -> bool {
        self.borrow().state == WritableState::Writable
    }
}

/// Handle given to an [`UnderlyingSink`](super::UnderlyingSink).
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    stream: Weak<dyn ErrorTarget>,
}

impl WritableStreamDefaultController {
    pub(crate) fn new(stream: Weak<dyn ErrorTarget>) -> Self {
        Self { stream }
    }

    /// Errors the stream. No-op unless it is still writable.
    pub fn error(&self, error: Error) {
        if let Some(stream) = self.stream.upgrade() {
            stream.error_if_writable(error);
        }
    }

    /// True while the stream accepts writes.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.stream.upgrade().is_some_and(|stream| stream.is_writable())
    }
}

impl fmt::Debug for WritableStreamDefaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStreamDefaultController")
            .field("writable", &self.is_writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::queue::QueuingStrategy;
    use crate::step::{self, StepFuture};
    use crate::test_utils::{ok, run_test, settle};
    use crate::writable::{UnderlyingSink, WritableState, WritableStream, WritableStreamDefaultController};
    use crate::Error;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Keeper(Rc<RefCell<Option<WritableStreamDefaultController>>>);

    impl UnderlyingSink<u8> for Keeper {
        fn start(&mut self, controller: &WritableStreamDefaultController) -> StepFuture {
            *self.0.borrow_mut() = Some(controller.clone());
            step::done()
        }
    }

    #[test]
    fn controller_error_fails_pending_writes() {
        run_test(|scheduler| async move {
            let slot = Rc::new(RefCell::new(None));
            let stream = ok(
                WritableStream::new(&scheduler, Keeper(Rc::clone(&slot)), QueuingStrategy::new(1.0)),
                "create",
            );
            settle(2).await;
            let controller = slot.borrow().clone().expect("started");
            assert!(controller.is_writable());
            controller.error(Error::reason("sink gone"));
            assert_eq!(stream.state(), WritableState::Errored);
            let writer = ok(stream.get_writer(), "writer");
            let err = writer.write(1).await.expect_err("errored");
            assert_eq!(err.message(), Some("sink gone"));
            assert!(!controller.is_writable());
        });
    }

    #[test]
    fn controller_outliving_stream_is_inert() {
        run_test(|scheduler| async move {
            let slot = Rc::new(RefCell::new(None));
            let stream = ok(
                WritableStream::new(&scheduler, Keeper(Rc::clone(&slot)), QueuingStrategy::new(1.0)),
                "create",
            );
            settle(2).await;
            let controller = slot.borrow().clone().expect("started");
            drop(stream);
            controller.error(Error::reason("ignored"));
            assert!(!controller.is_writable());
        });
    }
}
