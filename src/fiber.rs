//! The cooperative task runtime.
//!
//! Everything in this crate runs on one OS thread: a `current_thread` tokio
//! runtime combined with a [`LocalSet`][tokio::task::LocalSet], so tasks may
//! hold `Rc` and `RefCell` state across suspension points. A *fiber* is one
//! such task. All stream operations are suspension points; code between them
//! runs atomically with respect to other fibers.
//!
//! Cancellation is delivered through [`Fiber::cancel`]: the target task stops
//! at its next suspension point and unwinds, running every scoped guard on
//! the way out. Errors that escape a fiber's future are logged with the
//! fiber's id and the fiber terminates normally.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

thread_local! {
    static NEXT_FIBER_ID: Cell<u64> = Cell::new(1);
}

/// Runs a future to completion on a freshly built single-threaded runtime.
///
/// This is the crate's entry point; [`spawn`] may only be called from code
/// running under it.
pub fn run<F: Future>(fut: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build single-threaded runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, fut)
}

/// Launches a detached fiber running `fut`.
///
/// The future need not be `Send`. If it resolves to an error, the error is
/// logged together with the fiber's id; the fiber then terminates normally.
/// Must be called from within [`run`] (or another `LocalSet` context), and
/// panics otherwise.
pub fn spawn<F>(fut: F) -> Fiber
where
    F: Future<Output = crate::Result<()>> + 'static,
{
    let id = NEXT_FIBER_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    });
    let handle = tokio::task::spawn_local(async move {
        if let Err(err) = fut.await {
            tracing::error!(fiber = id, "fiber error: {}", err);
        }
        tracing::trace!(fiber = id, "fiber terminated");
    });
    Fiber { id, handle }
}

/// Suspends the current fiber, letting every other runnable fiber proceed
/// before it is resumed.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// A handle to a spawned fiber.
///
/// Dropping the handle detaches the fiber; it keeps running. Awaiting it
/// joins the fiber. The handle is also how cancellation is raised into a
/// running fiber.
pub struct Fiber {
    id: u64,
    handle: JoinHandle<()>,
}

impl Fiber {
    /// An identifier unique within the runtime thread, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raises cancellation into the fiber.
    ///
    /// The fiber observes it at its next suspension point and unwinds;
    /// resources held in scoped guards (pending reads, pipe links, timers)
    /// are released on the way out. Cancelling an already-terminated fiber
    /// is a no-op.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the fiber has terminated.
    pub fn is_terminated(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for Fiber {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            Poll::Ready(Err(err)) => {
                if err.is_panic() {
                    tracing::error!(fiber = self.id, "fiber panicked");
                }
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn spawned_fibers_share_thread_state() {
        run(async {
            let log = Rc::new(RefCell::new(Vec::new()));
            let mut fibers = Vec::new();
            for i in 0..3 {
                let log = log.clone();
                fibers.push(spawn(async move {
                    log.borrow_mut().push(i);
                    Ok(())
                }));
            }
            for f in fibers {
                f.await;
            }
            assert_eq!(*log.borrow(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn cancel_stops_at_next_suspension_point() {
        run(async {
            let progressed = Rc::new(Cell::new(false));
            let flag = progressed.clone();
            let f = spawn(async move {
                futures_util::future::pending::<()>().await;
                flag.set(true);
                Ok(())
            });
            yield_now().await;
            f.cancel();
            f.await;
            assert!(!progressed.get());
        });
    }

    #[test]
    fn fiber_error_terminates_quietly() {
        run(async {
            let f = spawn(async { Err(crate::Error::new_incomplete()) });
            f.await;
        });
    }

    #[test]
    fn fiber_ids_are_unique() {
        run(async {
            let a = spawn(async { Ok(()) });
            let b = spawn(async { Ok(()) });
            assert_ne!(a.id(), b.id());
            a.await;
            b.await;
        });
    }
}
