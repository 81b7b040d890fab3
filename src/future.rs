//! One-shot request/response futures handed back by every public
//! `Raft` operation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::RaftError;

/// A one-shot future carrying either a successful result of type `T` or a
/// [`RaftError`]. Returned by `Raft::apply`, `Raft::barrier`,
/// `Raft::verify_leader`, `Raft::add_peer`, `Raft::remove_peer`,
/// `Raft::set_peers`, `Raft::snapshot`, and `Raft::shutdown`.
pub struct RaftFuture<T> {
    rx: oneshot::Receiver<Result<T, RaftError>>,
}

impl<T> RaftFuture<T> {
    pub(crate) fn new_pair() -> (RaftFutureSender<T>, RaftFuture<T>) {
        let (tx, rx) = oneshot::channel();
        (RaftFutureSender { tx: Some(tx) }, RaftFuture { rx })
    }
}

impl<T> Future for RaftFuture<T> {
    type Output = Result<T, RaftError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without responding (e.g. a panic mid-flight,
            // or the node tore down before this future was resolved):
            // surface as shutdown rather than leaving the caller hanging.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RaftError::RaftShutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The resolving half of a [`RaftFuture`]. Held by the inflight tracker /
/// FSM worker / role loop until the operation it represents either
/// succeeds or fails.
pub struct RaftFutureSender<T = Vec<u8>> {
    tx: Option<oneshot::Sender<Result<T, RaftError>>>,
}

impl<T> RaftFutureSender<T> {
    #[cfg(test)]
    pub(crate) fn new(tx: oneshot::Sender<Result<T, RaftError>>) -> Self {
        RaftFutureSender { tx: Some(tx) }
    }

    /// Resolves the future successfully. A no-op if already resolved.
    pub fn respond(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
    }

    /// Resolves the future with a failure. A no-op if already resolved.
    pub fn fail(mut self, err: RaftError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}
