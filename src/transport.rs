//! `Transport` and `PeerStore` collaborator traits, and the RPC message
//! types exchanged between nodes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};

use crate::error::RaftError;
use crate::log_entry::Log;
use crate::{LogIndex, NodeId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Log>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub last_log_index: LogIndex,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub peers: Vec<NodeId>,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// One inbound RPC, paired with the one-shot reply channel the role loop
/// (or, for `AppendEntries`, the heartbeat fast path) completes once it has
/// produced a response.
pub enum Rpc {
    AppendEntries(
        AppendEntriesRequest,
        oneshot::Sender<AppendEntriesResponse>,
    ),
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    InstallSnapshot(
        InstallSnapshotRequest,
        Box<dyn AsyncRead + Send + Unpin>,
        oneshot::Sender<InstallSnapshotResponse>,
    ),
}

/// The three shared RPC handlers, implemented by [`Raft`](crate::Raft)'s
/// internal handle and registered with the [`Transport`] so it can invoke
/// `append_entries` directly on its heartbeat fast path without routing
/// through the consumer queue. Safe to call concurrently with the role
/// loop's own dispatch — see §5's reentrancy note.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse;

    async fn request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse;

    async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> InstallSnapshotResponse;
}

/// Unreliable point-to-point RPC and peer address encoding.
///
/// The core treats every call as fallible and retries at the call site
/// (the replication worker) rather than expecting the transport to retry
/// internally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's own id, as seen by peers.
    fn local_id(&self) -> NodeId;

    /// Hands back the channel incoming RPCs not taken by the heartbeat
    /// fast path arrive on. Exactly one consumer per node; the role loop
    /// is the sole reader.
    fn consumer(&self) -> mpsc::UnboundedReceiver<Rpc>;

    /// Registers the handler the transport should invoke directly for
    /// `AppendEntries`, bypassing the consumer queue, to avoid
    /// head-of-line blocking on heartbeats. Implementations that don't
    /// offer a fast path may simply route those RPCs through `consumer()`
    /// like everything else and ignore this call.
    fn set_heartbeat_handler(&self, handler: std::sync::Arc<dyn RpcHandler>);

    async fn request_vote(
        &self,
        target: NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError>;

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError>;

    /// `body` streams exactly `req.size` bytes of the snapshot; the
    /// implementation is responsible for framing that over the wire.
    async fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<InstallSnapshotResponse, RaftError>;

    /// Encodes a peer id into the opaque bytes stored in membership log
    /// entries, so a restored log/snapshot doesn't depend on the
    /// transport's in-memory address book.
    fn encode_peer(&self, id: NodeId) -> Vec<u8>;

    fn decode_peer(&self, bytes: &[u8]) -> Result<NodeId, RaftError>;
}

/// Durable peer list, independent of `Transport`'s in-memory address book.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn peers(&self) -> Result<Vec<NodeId>, RaftError>;

    async fn set_peers(&self, peers: &[NodeId]) -> Result<(), RaftError>;
}
