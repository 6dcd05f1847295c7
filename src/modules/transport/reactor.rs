//! Deferred task scheduling on the tokio reactor.

use std::panic::{self, AssertUnwindSafe};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, trace, warn};

use super::error::{TransportError, TransportResult};

type Task = Box<dyn FnOnce() + Send>;

/// Handle to the reactor that drives sockets and servers.
///
/// [`Reactor::defer`] is the "next turn" primitive. Deferred tasks go into
/// one FIFO queue drained by a single task on the runtime, so they run one
/// at a time in the order they were deferred and never inside the calling
/// frame. This holds on the multi-thread runtime too. Clones share the
/// queue; separately created reactors are ordered independently.
#[derive(Debug, Clone)]
pub struct Reactor {
    handle: Handle,
    queue: UnboundedSender<Task>,
}

impl Reactor {
    /// The reactor of the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn current() -> TransportResult<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| TransportError::NoReactor(e.to_string()))
    }

    /// Wrap an existing runtime handle and start its turn queue.
    #[must_use]
    pub fn from_handle(handle: Handle) -> Self {
        let (queue, mut tasks) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = tasks.recv().await {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Deferred task panicked");
                }
            }
        });
        Self { handle, queue }
    }

    /// The underlying runtime handle.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queue `task` for a later reactor turn, behind everything already
    /// deferred on this reactor.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("Deferring task to next reactor turn");
        if self.queue.send(Box::new(task)).is_err() {
            warn!("Reactor stopped, deferred task dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_current_outside_runtime() {
        assert!(matches!(
            Reactor::current(),
            Err(TransportError::NoReactor(_))
        ));
    }

    #[tokio::test]
    async fn test_defer_never_runs_inline() {
        let reactor = Reactor::current().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let flag = Arc::clone(&ran);
        reactor.defer(move || {
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        });

        assert!(!ran.load(Ordering::SeqCst));
        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_defer_keeps_order_on_multi_thread_runtime() {
        let reactor = Reactor::current().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        for i in 0..64 {
            let order = Arc::clone(&order);
            reactor.defer(move || order.lock().unwrap().push(i));
        }
        reactor.defer(move || {
            let _ = tx.send(());
        });

        rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), (0..64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_task_deferred_from_task_runs_after_queue() {
        let reactor = Reactor::current().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let inner = reactor.clone();
        let first = Arc::clone(&order);
        reactor.defer(move || {
            first.lock().unwrap().push("outer");
            let nested = Arc::clone(&first);
            inner.defer(move || {
                nested.lock().unwrap().push("nested");
                let _ = tx.send(());
            });
        });
        let second = Arc::clone(&order);
        reactor.defer(move || second.lock().unwrap().push("queued"));

        rx.await.unwrap();
        assert_eq!(*order.lock().unwrap(), ["outer", "queued", "nested"]);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_queue() {
        let reactor = Reactor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        reactor.defer(|| panic!("deferred failure"));
        reactor.defer(move || {
            let _ = tx.send(());
        });

        rx.await.unwrap();
    }
}
