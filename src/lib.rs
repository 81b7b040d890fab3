//! `raft` — the consensus core of a Raft-based replicated state machine
//! library.
//!
//! This crate implements the node-local consensus engine only: the
//! Follower / Candidate / Leader role loop, leader election, log
//! replication, commitment, leader lease, membership change, and log
//! compaction / snapshot install. Durable storage, RPC transport, and the
//! user state machine are all external collaborators, expressed here as
//! traits ([`LogStore`](storage::LogStore), [`StableStore`](storage::StableStore),
//! [`SnapshotStore`](snapshot::SnapshotStore), [`Transport`](transport::Transport),
//! [`PeerStore`](transport::PeerStore), [`Fsm`](fsm::Fsm)) so that a real
//! deployment can back them with whatever database and network stack it
//! already trusts.
//!
//! See `raft-memstore` for reference (non-durable) implementations of every
//! collaborator trait, used by this crate's own integration tests.

#[macro_use]
mod macros;

mod config;
mod core;
mod error;
mod fsm;
mod fsm_worker;
mod future;
mod inflight;
mod log_entry;
mod membership;
mod node;
mod replication;
mod snapshot;
mod snapshot_worker;
mod state;
mod storage;
mod transport;

pub use config::RaftConfig;
pub use error::RaftError;
pub use fsm::{Fsm, FsmSnapshot};
pub use future::RaftFuture;
pub use log_entry::{Log, LogType};
pub use node::{Raft, Stats};
pub use snapshot::{SnapshotMeta, SnapshotSink, SnapshotStore};
pub use state::RaftState;
pub use storage::{LogStore, StableStore};
pub use transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, PeerStore, RequestVoteRequest,
    RequestVoteResponse, Rpc, RpcHandler, Transport,
};

/// 1-based, monotonically increasing log index.
pub type LogIndex = u64;

/// Monotonically increasing election epoch.
pub type Term = u64;

/// Opaque node identity, as handed back and forth by [`Transport`] and
/// [`PeerStore`]. The core never interprets this beyond equality.
pub type NodeId = u64;
