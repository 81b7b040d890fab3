//! `SnapshotStore` collaborator trait and the snapshot metadata type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RaftError;
use crate::{LogIndex, NodeId, Term};

/// Metadata describing a persisted snapshot: the last log entry it covers
/// and the peer set as of that point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub index: LogIndex,
    pub term: Term,
    pub peers: Vec<NodeId>,
}

/// A write handle for a snapshot being created. `AsyncWrite` carries the
/// FSM-opaque snapshot body; `close`/`cancel` finalize or discard it.
#[async_trait]
pub trait SnapshotSink: AsyncWrite + Send + Sync + Unpin {
    /// Identifier the sink will be persisted under; stable once the sink
    /// is created, independent of whether `close` or `cancel` follows.
    fn id(&self) -> &str;

    /// Narrows a boxed sink down to a plain `AsyncWrite` so `FsmSnapshot::persist`
    /// can write into it without depending on `SnapshotSink` itself. A
    /// default provided method rather than a cast, since a trait object
    /// can't be reborrowed as one of its supertraits' objects directly.
    fn as_async_write(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        self
    }

    /// Finalizes the snapshot, making it visible to future `list`/`open`
    /// calls.
    async fn close(self: Box<Self>) -> Result<(), RaftError>;

    /// Discards the snapshot, e.g. because the source stream ended short.
    async fn cancel(self: Box<Self>) -> Result<(), RaftError>;
}

/// Create/list/open persistent snapshots.
///
/// Implementations own durability and retention policy entirely; the core
/// only ever asks for the newest snapshots (to attempt FSM restore at
/// startup, trying progressively older ones on failure) and creates new
/// ones through `create`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Lists all persisted snapshots, newest first.
    async fn list(&self) -> Result<Vec<SnapshotMeta>, RaftError>;

    /// Begins creating a new snapshot at `(index, term)` with the given
    /// peer set. The returned sink's body is written by the FSM worker and
    /// finalized with `close`.
    async fn create(
        &self,
        index: LogIndex,
        term: Term,
        peers: Vec<NodeId>,
    ) -> Result<Box<dyn SnapshotSink>, RaftError>;

    /// Opens an existing snapshot's body for reading, along with its
    /// metadata. The reader is boxed as a plain `AsyncRead` (rather than a
    /// dedicated marker trait) so callers can hand it directly to
    /// `Fsm::restore` or an `InstallSnapshot` body without a trait-object
    /// conversion.
    async fn open(
        &self,
        id: &str,
    ) -> Result<(SnapshotMeta, Box<dyn AsyncRead + Send + Unpin>), RaftError>;
}
