//! Pending-write accounting and the future type returned by every admitted
//! operation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Result, StoreError};

/// Per-table count of writes admitted but not yet resolved. A non-zero
/// count at query admission time routes the scan through the store's write
/// queue so it observes those writes.
#[derive(Clone, Default)]
pub(crate) struct PendingWrites(Arc<AtomicUsize>);

impl PendingWrites {
    pub(crate) fn acquire(&self) -> WriteGuard {
        self.acquire_many(1)
    }

    pub(crate) fn acquire_many(&self, count: usize) -> WriteGuard {
        self.0.fetch_add(count, Ordering::SeqCst);
        WriteGuard {
            counter: Arc::clone(&self.0),
            held: count,
        }
    }

    pub(crate) fn active(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// Holds a slice of the pending-write count and releases it exactly once,
/// whether the operation resolved, failed, or was abandoned.
pub(crate) struct WriteGuard {
    counter: Arc<AtomicUsize>,
    held: usize,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.held, Ordering::SeqCst);
    }
}

/// An admitted operation. The work is already queued (or already done, for
/// read-only scans); awaiting only collects the outcome. Dropping a
/// `Pending` abandons the result but never the write itself, and releases
/// any held guards.
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
    guards: Vec<WriteGuard>,
}

impl<T> Pending<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>, guards: Vec<WriteGuard>) -> Self {
        Pending { rx, guards }
    }

    /// An already-resolved operation.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Pending {
            rx,
            guards: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("guards", &self.guards.len())
            .finish_non_exhaustive()
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(outcome) => {
                this.guards.clear();
                Poll::Ready(outcome.unwrap_or_else(|_| Err(StoreError::Disconnected.into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_release_on_drop() {
        let pending = PendingWrites::default();
        assert!(!pending.active());
        let a = pending.acquire();
        let b = pending.acquire_many(3);
        assert!(pending.active());
        drop(a);
        assert!(pending.active());
        drop(b);
        assert!(!pending.active());
    }

    #[tokio::test]
    async fn ready_resolves_immediately() {
        let done: Pending<u32> = Pending::ready(Ok(7));
        assert_eq!(done.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn guards_release_when_a_failure_is_collected() {
        let writes = PendingWrites::default();
        let (tx, rx) = oneshot::channel();
        let op: Pending<u32> = Pending::new(rx, vec![writes.acquire()]);
        assert!(writes.active());
        let _ = tx.send(Err(StoreError::Disconnected.into()));
        assert!(op.await.is_err());
        assert!(!writes.active());
    }

    #[tokio::test]
    async fn dropped_sender_surfaces_disconnection() {
        let (tx, rx) = oneshot::channel::<Result<u32>>();
        drop(tx);
        let pending = Pending::new(rx, Vec::new());
        assert!(pending.await.is_err());
    }
}
