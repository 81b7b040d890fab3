//! The shared core: state and logic reachable from more than one task.
//!
//! Both the role loop (draining `Transport::consumer()`) and the
//! transport's heartbeat fast path (invoking `RpcHandler::append_entries`
//! directly, bypassing that queue) call into the same handler methods
//! here, concurrently. Per §5, that's by design — the fast path exists to
//! avoid head-of-line blocking a heartbeat behind unrelated RPC traffic —
//! so every method on `SharedCore` takes only the locks it needs and never
//! assumes it has the role loop's exclusive attention.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, RwLock};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::fsm_worker::FsmWorkerMsg;
use crate::log_entry::{Log, LogType};
use crate::membership;
use crate::snapshot::SnapshotStore;
use crate::state::{RaftState, Volatile};
use crate::storage::{DurableState, LogStore};
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, PeerStore, RequestVoteRequest,
    RequestVoteResponse, RpcHandler, Transport,
};
use crate::{LogIndex, NodeId, Term};

/// Everything the RPC handlers need, owned jointly by the role loop and
/// (via an `Arc`) the transport's fast path. Membership/log/commit state
/// lives here rather than in `node::RoleLoop` precisely so the fast path
/// can reach it without a message round trip to the role loop task.
pub(crate) struct SharedCore {
    pub id: NodeId,
    pub config: Arc<RaftConfig>,
    pub durable: Arc<DurableState>,
    pub volatile: Arc<Volatile>,
    pub log_store: Arc<dyn LogStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub transport: Arc<dyn Transport>,
    pub peer_store: Arc<dyn PeerStore>,
    /// Current peer set, excluding `id`. Guarded by an `RwLock` rather than
    /// owned solely by the role loop because `append_entries` and
    /// `install_snapshot` both update it synchronously on membership
    /// commits and snapshot installs respectively. `Arc`-shared with the
    /// FSM worker, which reads it (never writes) to stamp snapshot
    /// metadata with the peer set as of the snapshotted index.
    pub peers: Arc<RwLock<Vec<NodeId>>>,
    pub fsm_tx: mpsc::UnboundedSender<FsmWorkerMsg>,
    /// Whether `config.enable_single_node` is still honored. Starts `true`;
    /// the leader sub-loop clears it after the first successful election
    /// when `config.disable_bootstrap_after_elect` is set, so a partitioned
    /// minority that later loses its only peer can't re-bootstrap a second,
    /// conflicting single-node cluster.
    pub single_node_allowed: AtomicBool,
}

impl SharedCore {
    pub fn quorum(&self, peer_count: usize) -> usize {
        (peer_count + 1) / 2 + 1
    }

    /// Whether a node with no known peers may still elect itself leader
    /// right now (`config.enable_single_node`, gated by
    /// `single_node_allowed`).
    pub fn allow_single_node(&self) -> bool {
        self.config.enable_single_node && self.single_node_allowed.load(Ordering::Relaxed)
    }

    pub fn disable_single_node(&self) {
        self.single_node_allowed.store(false, Ordering::Relaxed);
    }

    /// Unconditionally moves to `Follower` and records the observed leader,
    /// clearing it to `None` when the caller doesn't supply a replacement
    /// (e.g. a leader stepping down with no newer leader known yet) so
    /// `Volatile::leader` never lags `role` into pointing at a node that no
    /// longer believes itself to be leader. Any sub-loop subscribed to
    /// `Volatile::subscribe_role` notices promptly — the role change itself
    /// is the wakeup, so a heartbeat-fast-path call forcing this while the
    /// role loop is deep in a candidate or leader sub-loop still gets
    /// noticed without a separate signal.
    pub async fn become_follower(&self, leader: Option<NodeId>) {
        self.volatile.set_role(RaftState::Follower).await;
        self.volatile.set_leader(leader).await;
    }

    /// If `term` is newer than ours, persists it and steps down to
    /// `Follower`. Returns whether an adoption happened. Shared by every
    /// call site that observes a peer's term (RPC responses in the
    /// candidate sub-loop and the replication workers; RPC requests here).
    pub async fn observe_higher_term(
        &self,
        term: Term,
    ) -> Result<bool, RaftError> {
        if term > self.durable.current_term() {
            self.durable.set_current_term(term).await?;
            self.become_follower(None).await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Forwards every log entry up to (and including) `commit_index` that
    /// hasn't yet been forwarded to the FSM worker, in ascending order.
    /// Membership entries (`Noop`/`AddPeer`/`RemovePeer`) are applied to
    /// the local peer view synchronously, right here, so a newly added
    /// peer starts receiving replication without waiting on the FSM
    /// worker's queue; every entry, membership or not, is still handed to
    /// the FSM worker so that it — and only it — advances `lastApplied`
    /// (§3's invariant).
    ///
    /// `futures` carries the client future for each index that has one —
    /// on the follower path this is always empty; on the leader path it's
    /// whatever `InflightTracker::drain_committed` just handed back, which
    /// may attach a future to any index in the range, not only the last.
    pub async fn process_logs(
        &self,
        commit_index: LogIndex,
        mut futures: std::collections::BTreeMap<LogIndex, crate::future::RaftFutureSender>,
    ) -> Result<(), RaftError> {
        let last_applied = self.durable.last_applied();
        if commit_index <= last_applied {
            return Ok(());
        }
        for index in (last_applied + 1)..=commit_index {
            let log = match self.log_store.get_log(index).await? {
                Some(log) => log,
                None => {
                    // A committed index must be present; a hole here means
                    // either the log was compacted past a point we still
                    // needed, or storage is corrupt. Either way it's the
                    // one condition §7 calls out as fatal.
                    pf_error!(
                        self,
                        "missing committed log entry at index {}",
                        index
                    );
                    panic!(
                        "raft: missing committed log entry at index {}",
                        index
                    );
                }
            };

            if log.is_membership() {
                let decoded = membership::decode_peer_set(&log.data)?;
                let mut peers = self.peers.write().await;
                *peers = decoded.into_iter().filter(|&p| p != self.id).collect();
                let snapshot = peers.clone();
                drop(peers);
                self.peer_store.set_peers(&snapshot).await?;
            }

            let future = futures.remove(&index);
            if self.fsm_tx.send(FsmWorkerMsg::Commit(log, future)).is_err() {
                pf_warn!(self, "fsm worker channel closed, dropping commit");
            }
        }
        Ok(())
    }

    /// Current peer set excluding self.
    pub async fn peers_snapshot(&self) -> Vec<NodeId> {
        self.peers.read().await.clone()
    }

    async fn log_term_at(
        &self,
        index: LogIndex,
    ) -> Result<Option<Term>, RaftError> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.durable.last_log_index() {
            return Ok(Some(self.durable.last_log_term()));
        }
        Ok(self.log_store.get_log(index).await?.map(|l| l.term))
    }

    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let current_term = self.durable.current_term();
        if req.term < current_term {
            return AppendEntriesResponse {
                term: current_term,
                last_log_index: self.durable.last_log_index(),
                success: false,
            };
        }

        let not_follower = self.volatile.role().await != RaftState::Follower;
        if req.term > current_term {
            if let Err(e) = self.durable.set_current_term(req.term).await {
                pf_error!(self, "failed persisting adopted term: {}", e);
                panic!("raft: failed to persist currentTerm: {}", e);
            }
        }
        if req.term > current_term || not_follower {
            self.become_follower(Some(req.leader)).await;
        } else {
            self.volatile.set_leader(Some(req.leader)).await;
        }

        if req.prev_log_index > 0 {
            match self.log_term_at(req.prev_log_index).await {
                Ok(Some(t)) if t == req.prev_log_term => {}
                _ => {
                    self.volatile.touch_contact().await;
                    return AppendEntriesResponse {
                        term: req.term,
                        last_log_index: self.durable.last_log_index(),
                        success: false,
                    };
                }
            }
        }

        if !req.entries.is_empty() {
            let last_index = self.durable.last_log_index();
            if req.entries[0].index <= last_index {
                if let Err(e) = self
                    .log_store
                    .delete_range(req.entries[0].index, last_index)
                    .await
                {
                    pf_warn!(self, "truncate failed: {}", e);
                    return AppendEntriesResponse {
                        term: req.term,
                        last_log_index: self.durable.last_log_index(),
                        success: false,
                    };
                }
            }
            if let Err(e) = self.log_store.store_logs(&req.entries).await {
                pf_warn!(self, "store_logs failed: {}", e);
                return AppendEntriesResponse {
                    term: req.term,
                    last_log_index: self.durable.last_log_index(),
                    success: false,
                };
            }
            let tail = req.entries.last().unwrap();
            self.durable.set_last_log(tail.index, tail.term);
        }

        if req.leader_commit > self.durable.commit_index() {
            let new_commit =
                req.leader_commit.min(self.durable.last_log_index());
            self.durable.set_commit_index(new_commit);
            if let Err(e) = self.process_logs(new_commit, Default::default()).await {
                pf_warn!(self, "process_logs failed: {}", e);
            }
        }

        self.volatile.touch_contact().await;
        AppendEntriesResponse {
            term: req.term,
            last_log_index: self.durable.last_log_index(),
            success: true,
        }
    }

    pub async fn request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        // A known current leader shields against disruption by a
        // partitioned-then-rejoining candidate whose own clock just timed
        // out — not a correctness requirement, but avoids needless
        // elections (matches the design's RequestVote step 1).
        if self.volatile.leader().await.is_some() {
            return RequestVoteResponse {
                term: self.durable.current_term(),
                granted: false,
            };
        }

        let current_term = self.durable.current_term();
        if req.term < current_term {
            return RequestVoteResponse {
                term: current_term,
                granted: false,
            };
        }
        if req.term > current_term {
            if let Err(e) = self.durable.set_current_term(req.term).await {
                pf_error!(self, "failed persisting adopted term: {}", e);
                panic!("raft: failed to persist currentTerm: {}", e);
            }
            self.become_follower(None).await;
        }

        if let Some(voted) = self.durable.voted_for(req.term).await {
            return RequestVoteResponse {
                term: req.term,
                granted: voted == req.candidate,
            };
        }

        let our_last_term = self.durable.last_log_term();
        let our_last_index = self.durable.last_log_index();
        let up_to_date = req.last_log_term > our_last_term
            || (req.last_log_term == our_last_term
                && req.last_log_index >= our_last_index);
        if !up_to_date {
            return RequestVoteResponse {
                term: req.term,
                granted: false,
            };
        }

        if let Err(e) = self.durable.set_vote(req.term, req.candidate).await {
            pf_error!(self, "failed persisting vote: {}", e);
            panic!("raft: failed to persist vote: {}", e);
        }
        RequestVoteResponse {
            term: req.term,
            granted: true,
        }
    }

    pub async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
        mut body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> InstallSnapshotResponse {
        let current_term = self.durable.current_term();
        if req.term < current_term {
            return InstallSnapshotResponse {
                term: current_term,
                success: false,
            };
        }
        if req.term > current_term {
            if let Err(e) = self.durable.set_current_term(req.term).await {
                pf_error!(self, "failed persisting adopted term: {}", e);
                panic!("raft: failed to persist currentTerm: {}", e);
            }
        }
        self.become_follower(Some(req.leader)).await;

        let sink = match self
            .snapshot_store
            .create(req.last_log_index, req.last_log_term, req.peers.clone())
            .await
        {
            Ok(s) => s,
            Err(e) => {
                pf_warn!(self, "failed creating snapshot sink: {}", e);
                return InstallSnapshotResponse {
                    term: req.term,
                    success: false,
                };
            }
        };
        let id = sink.id().to_string();
        if let Err(e) =
            copy_exact(&mut body, sink, req.size).await
        {
            pf_warn!(self, "snapshot stream copy failed: {}", e);
            return InstallSnapshotResponse {
                term: req.term,
                success: false,
            };
        }

        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        let meta = crate::snapshot::SnapshotMeta {
            id,
            index: req.last_log_index,
            term: req.last_log_term,
            peers: req.peers.clone(),
        };
        let reader = match self.snapshot_store.open(&meta.id).await {
            Ok((_, reader)) => reader,
            Err(e) => {
                pf_warn!(self, "failed reopening installed snapshot: {}", e);
                return InstallSnapshotResponse {
                    term: req.term,
                    success: false,
                };
            }
        };
        if self
            .fsm_tx
            .send(FsmWorkerMsg::Restore {
                meta: meta.clone(),
                reader,
                ack: ack_tx,
            })
            .is_err()
        {
            pf_warn!(self, "fsm worker channel closed during restore");
            return InstallSnapshotResponse {
                term: req.term,
                success: false,
            };
        }
        match ack_rx.await {
            Ok(Ok(())) => {}
            _ => {
                return InstallSnapshotResponse {
                    term: req.term,
                    success: false,
                };
            }
        }

        {
            let mut peers = self.peers.write().await;
            *peers = req
                .peers
                .iter()
                .copied()
                .filter(|&p| p != self.id)
                .collect();
            let snapshot = peers.clone();
            drop(peers);
            if let Err(e) = self.peer_store.set_peers(&snapshot).await {
                pf_warn!(self, "failed persisting peer set: {}", e);
            }
        }

        self.durable.set_commit_index(req.last_log_index);
        self.durable.set_last_log(req.last_log_index, req.last_log_term);
        if let Err(e) = self
            .log_store
            .delete_range(
                self.log_store.first_index().await.unwrap_or(1).max(1),
                req.last_log_index,
            )
            .await
        {
            pf_warn!(self, "log compaction after install failed: {}", e);
        }

        self.volatile.touch_contact().await;
        InstallSnapshotResponse {
            term: req.term,
            success: true,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }
}

async fn copy_exact(
    body: &mut (dyn AsyncRead + Send + Unpin),
    sink: Box<dyn crate::snapshot::SnapshotSink>,
    size: u64,
) -> Result<(), RaftError> {
    use tokio::io::AsyncWriteExt;

    let mut sink = sink;
    let mut remaining = size;
    let mut buf = [0u8; 64 * 1024];
    let writer = sink.as_async_write();
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = tokio::io::AsyncReadExt::read(body, &mut buf[..want]).await?;
        if n == 0 {
            let _ = sink.cancel().await;
            return Err(RaftError::msg(
                "snapshot stream ended before declared size",
            ));
        }
        AsyncWriteExt::write_all(writer, &buf[..n]).await?;
        remaining -= n as u64;
    }
    sink.close().await
}

#[async_trait]
impl RpcHandler for SharedCore {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        SharedCore::append_entries(self, req).await
    }

    async fn request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        SharedCore::request_vote(self, req).await
    }

    async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> InstallSnapshotResponse {
        SharedCore::install_snapshot(self, req, body).await
    }
}

// Satisfies `pf_*!`'s `$self_.id()` convention for a type that isn't itself
// a node handle.
impl std::fmt::Display for SharedCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Describes a peer's nominal RPC target for `Replication` to call through
/// `Transport`. Kept distinct from the `NodeId` type alias purely for
/// readability at call sites that pass both an id and a peer id.
pub(crate) type Peer = NodeId;
