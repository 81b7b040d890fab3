//! The `Fsm` collaborator trait: the user-supplied deterministic state
//! machine that is the authoritative application of the committed log.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::RaftError;

/// A point-in-time snapshot handle produced by [`Fsm::snapshot`]. Its body
/// is streamed into a [`SnapshotSink`](crate::SnapshotSink) by the snapshot
/// worker, off the hot path — `persist` must not block on FSM internals
/// beyond what it takes to serialize already-captured state.
#[async_trait]
pub trait FsmSnapshot: Send + Sync {
    /// Streams the snapshot body to `writer`.
    async fn persist(
        &self,
        writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    ) -> Result<(), RaftError>;
}

/// The user state machine. All calls are made from the single FSM worker
/// task; the role loop never invokes these directly, so an implementation
/// may assume single-threaded, commit-ordered access.
#[async_trait]
pub trait Fsm: Send + Sync {
    /// Applies one committed `Command` entry's opaque payload, returning an
    /// opaque result forwarded to the caller's `Apply` future.
    async fn apply(&mut self, data: &[u8]) -> Result<Vec<u8>, RaftError>;

    /// Captures a consistent point-in-time snapshot handle of the current
    /// state. The handle is then streamed out by the caller at its own
    /// pace; mutating state through `apply` afterward must not affect an
    /// already-captured handle (copy-on-write or equivalent is the
    /// implementation's responsibility).
    async fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, RaftError>;

    /// Replaces the FSM's entire state with what `reader` streams, used
    /// both at startup (restoring the newest local snapshot) and after
    /// `InstallSnapshot` from a leader.
    async fn restore(
        &mut self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RaftError>;
}
