//! The public [`Raft`] handle and the single role-loop task that backs it.
//!
//! Everything here is the "outer" half of the design: the follower /
//! candidate / leader sub-loops (§4.1), the leader's per-term bookkeeping
//! (inflight tracker, replication workers, pending verifies), and the
//! bridge between the public, future-returning API and the internal
//! channels the sub-loops actually wait on. `SharedCore` (the shared RPC
//! handlers and commit/log plumbing reachable from the heartbeat fast path)
//! lives in `core` instead, precisely so it can be called from outside this
//! task without a message round trip.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::RaftConfig;
use crate::core::SharedCore;
use crate::error::RaftError;
use crate::fsm::Fsm;
use crate::fsm_worker::FsmWorker;
use crate::future::{RaftFuture, RaftFutureSender};
use crate::inflight::InflightTracker;
use crate::log_entry::Log;
use crate::membership;
use crate::replication::{ReplicationHandle, ReplicationWorker, VerifyRequest};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::snapshot_worker::SnapshotWorker;
use crate::state::{RaftState, Volatile};
use crate::storage::{DurableState, LogStore, StableStore};
use crate::transport::{
    PeerStore, RequestVoteRequest, RequestVoteResponse, Rpc, Transport,
};
use crate::{LogIndex, NodeId, Term};

/// Floor on the leader lease recheck interval, so a cluster with a very
/// short `leader_lease_timeout` and a slow follower can't spin the lease
/// timer arm of the hot loop.
const MIN_LEASE_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// A point-in-time snapshot of a node's observable status, returned by
/// [`Raft::stats`].
#[derive(Debug, Clone)]
pub struct Stats {
    pub state: RaftState,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub num_peers: usize,
}

/// One client-submitted operation, handed from a `Raft` method to the role
/// loop over `op_tx`. `Apply`/`Barrier`/`AddPeer`/`RemovePeer` all resolve
/// through the same leader-side log-dispatch pipeline, so they share
/// `RaftFutureSender`'s default `Vec<u8>` type; `VerifyLeader`/`SetPeers`
/// never touch that pipeline and carry their own `()`-typed sender.
enum OpMsg {
    Apply(Vec<u8>, RaftFutureSender),
    Barrier(RaftFutureSender),
    VerifyLeader(RaftFutureSender<()>),
    AddPeer(NodeId, RaftFutureSender),
    RemovePeer(NodeId, RaftFutureSender),
    SetPeers(Vec<NodeId>, RaftFutureSender<()>),
}

/// The public handle to a running node. Cloning isn't offered; share a
/// `Raft` behind an `Arc` if multiple callers need it — every method here
/// only takes `&self`.
pub struct Raft {
    id: NodeId,
    durable: Arc<DurableState>,
    volatile: Arc<Volatile>,
    core: Arc<SharedCore>,
    op_tx: mpsc::UnboundedSender<OpMsg>,
    shutdown_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    leader_rx: watch::Receiver<bool>,
    snapshot_trigger_tx: mpsc::UnboundedSender<RaftFutureSender<()>>,
}

impl Raft {
    /// Starts a node: restores durable state, attempts to restore the
    /// newest local snapshot (falling back to older ones on failure),
    /// spawns the FSM worker, snapshot worker, and role loop, and returns
    /// once all of that is running.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        id: NodeId,
        config: RaftConfig,
        log_store: Arc<dyn LogStore>,
        stable_store: Arc<dyn StableStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
        peer_store: Arc<dyn PeerStore>,
        fsm: Box<dyn Fsm>,
    ) -> Result<Raft, RaftError> {
        config.validate()?;
        let config = Arc::new(config);

        let durable = Arc::new(DurableState::load(id, stable_store).await?);

        let last_index = log_store.last_index().await?;
        let last_term = if last_index > 0 {
            log_store
                .get_log(last_index)
                .await?
                .map(|l| l.term)
                .unwrap_or(0)
        } else {
            0
        };
        durable.set_last_log(last_index, last_term);

        let mut peers: Vec<NodeId> = peer_store
            .peers()
            .await?
            .into_iter()
            .filter(|&p| p != id)
            .collect();

        let mut fsm = fsm;
        let mut restored: Option<SnapshotMeta> = None;
        match snapshot_store.list().await {
            Ok(metas) => {
                for meta in metas {
                    match snapshot_store.open(&meta.id).await {
                        Ok((opened_meta, mut reader)) => {
                            match fsm.restore(&mut *reader).await {
                                Ok(()) => {
                                    restored = Some(opened_meta);
                                    break;
                                }
                                Err(e) => log::warn!(
                                    "<{}> snapshot {} restore failed, trying an older one: {}",
                                    id,
                                    meta.id,
                                    e
                                ),
                            }
                        }
                        Err(e) => log::warn!(
                            "<{}> failed opening snapshot {}: {}",
                            id,
                            meta.id,
                            e
                        ),
                    }
                }
            }
            Err(e) => log::warn!("<{}> failed listing snapshots at startup: {}", id, e),
        }

        let (initial_index, initial_term) = if let Some(meta) = &restored {
            durable.set_last_applied(meta.index);
            durable.set_commit_index(meta.index);
            peers = meta.peers.iter().copied().filter(|&p| p != id).collect();
            if let Err(e) = peer_store.set_peers(&peers).await {
                log::warn!(
                    "<{}> failed persisting peer set restored from snapshot: {}",
                    id,
                    e
                );
            }
            (meta.index, meta.term)
        } else {
            (0, 0)
        };

        let volatile = Arc::new(Volatile::new());
        let rpc_rx = transport.consumer();

        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let (leader_tx, leader_rx) = watch::channel(false);
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (snapshot_trigger_tx, snapshot_trigger_rx) = mpsc::unbounded_channel();

        let core = Arc::new(SharedCore {
            id,
            config: config.clone(),
            durable: durable.clone(),
            volatile: volatile.clone(),
            log_store: log_store.clone(),
            snapshot_store: snapshot_store.clone(),
            transport: transport.clone(),
            peer_store: peer_store.clone(),
            peers: Arc::new(RwLock::new(peers)),
            fsm_tx,
            single_node_allowed: std::sync::atomic::AtomicBool::new(true),
        });

        transport.set_heartbeat_handler(core.clone());

        let fsm_worker = FsmWorker::new(
            id,
            fsm,
            durable.clone(),
            core.peers.clone(),
            fsm_rx,
            shutdown_rx.clone(),
            initial_index,
            initial_term,
        );
        tokio::spawn(fsm_worker.run());

        let snapshot_worker = SnapshotWorker::new(
            id,
            config.clone(),
            durable.clone(),
            log_store,
            snapshot_store,
            core.fsm_tx.clone(),
            snapshot_trigger_rx,
            shutdown_rx.clone(),
            initial_index,
            initial_term,
        );
        tokio::spawn(snapshot_worker.run());

        let role_rx = volatile.subscribe_role();
        let role_loop = RoleLoop {
            core: core.clone(),
            rpc_rx,
            op_rx,
            role_rx,
            shutdown_rx,
            shutdown_tx: shutdown_tx.clone(),
            stopped_tx,
            leader_tx,
        };
        tokio::spawn(role_loop.run());

        Ok(Raft {
            id,
            durable,
            volatile,
            core,
            op_tx,
            shutdown_tx,
            stopped_rx,
            leader_rx,
            snapshot_trigger_tx,
        })
    }

    /// Submits a command for replication. Leader-only; a non-leader fails
    /// the future with [`RaftError::NotLeader`]. `timeout` bounds the
    /// entire wait for the future to resolve, not just enqueueing — this
    /// crate's internal channels are unbounded and never actually block on
    /// send, so the only meaningful thing left to time out is commitment
    /// itself. See `DESIGN.md` for the reasoning.
    pub fn apply(&self, data: Vec<u8>, timeout: Duration) -> RaftFuture<Vec<u8>> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(OpMsg::Apply(_, tx))) =
            self.op_tx.send(OpMsg::Apply(data, tx))
        {
            tx.fail(RaftError::RaftShutdown);
        }
        bound_with_timeout(future, timeout)
    }

    /// Resolves once every entry dispatched before this call has been
    /// applied to the FSM. Leader-only.
    pub fn barrier(&self, timeout: Duration) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(OpMsg::Barrier(tx))) =
            self.op_tx.send(OpMsg::Barrier(tx))
        {
            tx.fail(RaftError::RaftShutdown);
        }
        bound_with_timeout(bridge_to_unit(future), timeout)
    }

    /// Resolves successfully only once a current-term quorum heartbeat has
    /// been confirmed, ruling out a stale read from a leader that's already
    /// lost its lease without yet noticing. Leader-only.
    pub fn verify_leader(&self) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(OpMsg::VerifyLeader(tx))) =
            self.op_tx.send(OpMsg::VerifyLeader(tx))
        {
            tx.fail(RaftError::RaftShutdown);
        }
        future
    }

    /// Adds `peer` to the cluster via the normal log-replicated membership
    /// path. Leader-only; rejects with [`RaftError::KnownPeer`] if `peer`
    /// is already a member (or self).
    pub fn add_peer(&self, peer: NodeId) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(OpMsg::AddPeer(_, tx))) =
            self.op_tx.send(OpMsg::AddPeer(peer, tx))
        {
            tx.fail(RaftError::RaftShutdown);
        }
        bridge_to_unit(future)
    }

    /// Removes `peer` from the cluster. Leader-only; rejects with
    /// [`RaftError::UnknownPeer`] if `peer` isn't a current member. Removing
    /// the leader itself is allowed and triggers shutdown or a revert to
    /// follower per `config.shutdown_on_remove` once the entry commits.
    pub fn remove_peer(&self, peer: NodeId) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(OpMsg::RemovePeer(_, tx))) =
            self.op_tx.send(OpMsg::RemovePeer(peer, tx))
        {
            tx.fail(RaftError::RaftShutdown);
        }
        bridge_to_unit(future)
    }

    /// Forces the local peer set, bypassing consensus entirely. An unsafe
    /// recovery tool for a cluster that can no longer reach quorum through
    /// the normal membership-change path — never call this on a healthy
    /// cluster. Rejected with [`RaftError::Leader`] while this node is
    /// leader, since the normal path already owns membership changes there.
    pub fn set_peers(&self, peers: Vec<NodeId>) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(OpMsg::SetPeers(_, tx))) =
            self.op_tx.send(OpMsg::SetPeers(peers, tx))
        {
            tx.fail(RaftError::RaftShutdown);
        }
        future
    }

    /// Forces an off-cycle snapshot, regardless of `snapshot_threshold`.
    pub fn snapshot(&self) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        if let Err(mpsc::error::SendError(tx)) = self.snapshot_trigger_tx.send(tx) {
            tx.fail(RaftError::RaftShutdown);
        }
        future
    }

    /// Signals every task to stop and resolves once the role loop has
    /// confirmed it has. Idempotent; shutdown is one-way, no restart.
    pub fn shutdown(&self) -> RaftFuture<()> {
        let (tx, future) = RaftFuture::new_pair();
        let _ = self.shutdown_tx.send(true);
        let mut stopped_rx = self.stopped_rx.clone();
        tokio::spawn(async move {
            loop {
                if *stopped_rx.borrow() {
                    tx.respond(());
                    return;
                }
                if stopped_rx.changed().await.is_err() {
                    tx.respond(());
                    return;
                }
            }
        });
        future
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.volatile.leader().await
    }

    pub async fn state(&self) -> RaftState {
        self.volatile.role().await
    }

    pub async fn last_contact(&self) -> Instant {
        self.volatile.last_contact().await
    }

    pub fn last_index(&self) -> LogIndex {
        self.durable.last_log_index()
    }

    pub async fn stats(&self) -> Stats {
        Stats {
            state: self.volatile.role().await,
            term: self.durable.current_term(),
            last_log_index: self.durable.last_log_index(),
            commit_index: self.durable.commit_index(),
            last_applied: self.durable.last_applied(),
            num_peers: self.core.peers_snapshot().await.len(),
        }
    }

    /// Subscribes to leadership transitions: `true` while this node
    /// believes itself to be leader, `false` otherwise.
    pub fn leader_ch(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }
}

/// Wraps `future` so it resolves with [`RaftError::EnqueueTimeout`] if it
/// hasn't resolved within `timeout`.
fn bound_with_timeout<T: Send + 'static>(
    future: RaftFuture<T>,
    timeout: Duration,
) -> RaftFuture<T> {
    let (tx, bounded) = RaftFuture::new_pair();
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, future).await {
            Ok(Ok(v)) => tx.respond(v),
            Ok(Err(e)) => tx.fail(e),
            Err(_) => tx.fail(RaftError::EnqueueTimeout),
        }
    });
    bounded
}

/// Bridges a `RaftFuture<Vec<u8>>` from the internal apply/commit pipeline
/// to the `()`-typed future the public API contracts for operations whose
/// result the caller never needs (`Barrier`/`AddPeer`/`RemovePeer`).
fn bridge_to_unit(inner: RaftFuture<Vec<u8>>) -> RaftFuture<()> {
    let (tx, future) = RaftFuture::new_pair();
    tokio::spawn(async move {
        match inner.await {
            Ok(_) => tx.respond(()),
            Err(e) => tx.fail(e),
        }
    });
    future
}

/// A random duration in `[base, 2*base)`, used for the follower heartbeat
/// timer and the candidate election timer per §4.1.1/§4.1.2.
fn random_timeout(base: Duration) -> Duration {
    let extra_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64).max(1));
    base + Duration::from_millis(extra_ms)
}

/// Per-term leader-only state: the inflight tracker, one replication
/// handle per peer, outstanding `VerifyLeader` requests, and (if this
/// leader has removed itself) the index to watch for commitment before
/// acting on it.
struct LeaderState {
    term: Term,
    inflight: Arc<InflightTracker>,
    replicas: HashMap<NodeId, ReplicationHandle>,
    pending_verifies: Vec<Arc<StdMutex<VerifyRequest>>>,
    self_removal_index: Option<LogIndex>,
}

/// The single task that owns `state`, `commitIndex`, `leader`, `peers`, and
/// `leaderState` (per §5) and dispatches to one of the three sub-loops
/// keyed by the current role.
struct RoleLoop {
    core: Arc<SharedCore>,
    rpc_rx: mpsc::UnboundedReceiver<Rpc>,
    op_rx: mpsc::UnboundedReceiver<OpMsg>,
    role_rx: watch::Receiver<RaftState>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    leader_tx: watch::Sender<bool>,
}

impl RoleLoop {
    fn id(&self) -> NodeId {
        self.core.id()
    }

    async fn run(mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.core.volatile.role().await {
                RaftState::Follower => self.run_follower().await,
                RaftState::Candidate => self.run_candidate().await,
                RaftState::Leader => self.run_leader().await,
                RaftState::Shutdown => break,
            }
        }
        self.core.volatile.set_role(RaftState::Shutdown).await;
        let _ = self.stopped_tx.send(true);
        pf_info!(self, "role loop stopped");
    }

    /// Handles one inbound RPC the way every role needs to: both the
    /// follower/candidate/leader sub-loops just delegate here, since the
    /// RPC semantics themselves (§4.1.4) are entirely in `SharedCore` and
    /// don't depend on which sub-loop is currently running.
    async fn handle_rpc(&self, rpc: Rpc) {
        match rpc {
            Rpc::AppendEntries(req, tx) => {
                let resp = self.core.append_entries(req).await;
                let _ = tx.send(resp);
            }
            Rpc::RequestVote(req, tx) => {
                let resp = self.core.request_vote(req).await;
                let _ = tx.send(resp);
            }
            Rpc::InstallSnapshot(req, body, tx) => {
                let resp = self.core.install_snapshot(req, body).await;
                let _ = tx.send(resp);
            }
        }
    }

    /// §4.1.1: waits on RPCs, client operations (rejected except
    /// `SetPeers`), and the randomized heartbeat timer.
    async fn run_follower(&mut self) {
        loop {
            let timeout = random_timeout(self.core.config.heartbeat_timeout);
            let sleep = tokio::time::sleep(timeout);
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                }

                rpc = self.rpc_rx.recv() => {
                    match rpc {
                        Some(rpc) => self.handle_rpc(rpc).await,
                        None => return,
                    }
                    if self.core.volatile.role().await != RaftState::Follower {
                        return;
                    }
                }

                op = self.op_rx.recv() => {
                    match op {
                        Some(op) => self.handle_op_non_leader(op).await,
                        None => return,
                    }
                }

                _ = sleep => {
                    let last_contact = self.core.volatile.last_contact().await;
                    if last_contact.elapsed() < self.core.config.heartbeat_timeout {
                        continue;
                    }
                    self.core.volatile.set_leader(None).await;
                    let peers = self.core.peers_snapshot().await;
                    if !peers.is_empty() || self.core.allow_single_node() {
                        pf_debug!(self, "heartbeat timeout, becoming candidate");
                        self.core.volatile.set_role(RaftState::Candidate).await;
                        return;
                    }
                }
            }
        }
    }

    /// The reject-everything-but-`SetPeers` handling shared by the
    /// follower and candidate sub-loops.
    async fn handle_op_non_leader(&mut self, op: OpMsg) {
        let leader = self.core.volatile.leader().await;
        match op {
            OpMsg::Apply(_, future) => future.fail(RaftError::NotLeader(leader)),
            OpMsg::Barrier(future) => future.fail(RaftError::NotLeader(leader)),
            OpMsg::AddPeer(_, future) => future.fail(RaftError::NotLeader(leader)),
            OpMsg::RemovePeer(_, future) => future.fail(RaftError::NotLeader(leader)),
            OpMsg::VerifyLeader(future) => future.fail(RaftError::NotLeader(leader)),
            OpMsg::SetPeers(addrs, future) => self.apply_set_peers(addrs, future).await,
        }
    }

    async fn apply_set_peers(&self, addrs: Vec<NodeId>, future: RaftFutureSender<()>) {
        let filtered: Vec<NodeId> =
            addrs.into_iter().filter(|&p| p != self.core.id()).collect();
        {
            let mut peers = self.core.peers.write().await;
            *peers = filtered.clone();
        }
        match self.core.peer_store.set_peers(&filtered).await {
            Ok(()) => future.respond(()),
            Err(e) => future.fail(e),
        }
    }

    /// §4.1.2: runs exactly one election attempt in a freshly incremented
    /// term, returning (to the outer loop, which re-enters Candidate with a
    /// new term) on election timeout.
    async fn run_candidate(&mut self) {
        let new_term = self.core.durable.current_term() + 1;
        if let Err(e) = self.core.durable.set_current_term(new_term).await {
            pf_error!(self, "failed persisting new term: {}", e);
            panic!("raft: failed to persist currentTerm: {}", e);
        }
        if let Err(e) = self.core.durable.set_vote(new_term, self.core.id()).await {
            pf_error!(self, "failed persisting self vote: {}", e);
            panic!("raft: failed to persist vote: {}", e);
        }
        self.core.volatile.set_role(RaftState::Candidate).await;
        self.core.volatile.set_leader(None).await;
        pf_info!(self, "starting election for term {}", new_term);

        let peers = self.core.peers_snapshot().await;
        let quorum = self.core.quorum(peers.len());
        let mut granted = 1usize; // self's implicit vote

        let (vote_tx, mut vote_rx) = mpsc::unbounded_channel::<RequestVoteResponse>();
        let req = RequestVoteRequest {
            term: new_term,
            candidate: self.core.id(),
            last_log_index: self.core.durable.last_log_index(),
            last_log_term: self.core.durable.last_log_term(),
        };
        for peer in &peers {
            let core = self.core.clone();
            let tx = vote_tx.clone();
            let peer = *peer;
            tokio::spawn(async move {
                if let Ok(resp) = core.transport.request_vote(peer, req).await {
                    let _ = tx.send(resp);
                }
            });
        }
        drop(vote_tx);

        if granted >= quorum {
            self.win_election(new_term).await;
            return;
        }

        let timeout = random_timeout(self.core.config.election_timeout);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                }

                rpc = self.rpc_rx.recv() => {
                    match rpc {
                        Some(rpc) => self.handle_rpc(rpc).await,
                        None => return,
                    }
                    if self.core.volatile.role().await != RaftState::Candidate {
                        return;
                    }
                }

                op = self.op_rx.recv() => {
                    match op {
                        Some(op) => self.handle_op_non_leader(op).await,
                        None => return,
                    }
                }

                resp = vote_rx.recv() => {
                    if let Some(resp) = resp {
                        if resp.term > new_term {
                            let _ = self.core.observe_higher_term(resp.term).await;
                            return;
                        }
                        // A granting peer always echoes back our own
                        // `new_term`, per §4.1.4's RequestVote handler, so
                        // `resp.term == new_term` here is really just
                        // defending against a stale response from a
                        // superseded election attempt; kept as documented
                        // in §9 rather than simplified away.
                        if resp.granted && resp.term == new_term {
                            granted += 1;
                            if granted >= quorum {
                                self.win_election(new_term).await;
                                return;
                            }
                        }
                    }
                }

                _ = &mut sleep => {
                    pf_debug!(self, "election timeout in term {}", new_term);
                    return;
                }
            }
        }
    }

    async fn win_election(&self, term: Term) {
        pf_info!(self, "won election for term {}", term);
        self.core.volatile.set_role(RaftState::Leader).await;
        self.core.volatile.set_leader(Some(self.core.id())).await;
    }

    /// §4.1.3: leader setup, hot loop, and teardown guard.
    async fn run_leader(&mut self) {
        let term = self.core.durable.current_term();
        let peers = self.core.peers_snapshot().await;
        let last_log_index = self.core.durable.last_log_index();

        let (commit_tx, mut commit_rx) = watch::channel(());
        let inflight = Arc::new(InflightTracker::new(
            self.core.id(),
            self.core.quorum(peers.len()),
            last_log_index,
            commit_tx,
        ));

        let mut state = LeaderState {
            term,
            inflight,
            replicas: HashMap::new(),
            pending_verifies: Vec::new(),
            self_removal_index: None,
        };

        for peer in &peers {
            self.spawn_replication(&mut state, *peer, last_log_index + 1);
        }

        let mut bootstrap_peers = peers.clone();
        if !bootstrap_peers.contains(&self.core.id()) {
            bootstrap_peers.push(self.core.id());
        }
        let encoded = match membership::encode_peer_set(&bootstrap_peers) {
            Ok(e) => e,
            Err(e) => {
                pf_error!(self, "failed encoding bootstrap peer set: {}", e);
                self.core.become_follower(None).await;
                self.leader_teardown(state).await;
                return;
            }
        };
        if !self
            .dispatch_logs(&mut state, vec![(Log::new_noop(encoded), None)])
            .await
        {
            self.leader_teardown(state).await;
            return;
        }

        if self.core.config.disable_bootstrap_after_elect {
            self.core.disable_single_node();
        }

        let _ = self.leader_tx.send(true);
        self.leader_hot_loop(&mut state, &mut commit_rx).await;
        self.leader_teardown(state).await;
    }

    fn spawn_replication(&self, state: &mut LeaderState, peer: NodeId, next_index: LogIndex) {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (verify_tx, verify_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(None);
        let last_contact = Arc::new(RwLock::new(Instant::now()));

        let worker = ReplicationWorker::new(
            self.core.clone(),
            state.inflight.clone(),
            peer,
            state.term,
            next_index,
            last_contact.clone(),
            trigger_rx,
            verify_rx,
            stop_rx,
        );
        tokio::spawn(worker.run());

        state.replicas.insert(
            peer,
            ReplicationHandle {
                trigger_tx,
                verify_tx,
                stop_tx,
                last_contact,
            },
        );
    }

    /// Assigns contiguous indices starting at `lastLogIndex + 1`, tags the
    /// current term, stores the batch, and pulses every replication
    /// worker. On a store failure, fails every future in the batch and
    /// steps down to Follower (§7's asymmetric-log-failure rule). Returns
    /// whether the hot loop should keep running.
    async fn dispatch_logs(
        &self,
        state: &mut LeaderState,
        batch: Vec<(Log, Option<RaftFutureSender>)>,
    ) -> bool {
        if batch.is_empty() {
            return true;
        }
        let mut next_index = self.core.durable.last_log_index() + 1;
        let term = state.term;
        let mut entries = Vec::with_capacity(batch.len());
        let mut futures = Vec::with_capacity(batch.len());
        for (mut log, future) in batch {
            log.index = next_index;
            log.term = term;
            next_index += 1;
            futures.push((log.index, future));
            entries.push(log);
        }

        if let Err(e) = self.core.log_store.store_logs(&entries).await {
            pf_warn!(self, "store_logs failed, stepping down: {}", e);
            for (_, future) in futures {
                if let Some(future) = future {
                    future.fail(RaftError::msg(format!("store_logs failed: {}", e)));
                }
            }
            self.core.become_follower(None).await;
            return false;
        }

        let tail = entries.last().expect("batch checked non-empty above");
        self.core.durable.set_last_log(tail.index, tail.term);

        for (index, future) in futures {
            if let Some(future) = future {
                state.inflight.register(index, future);
            }
        }
        state.inflight.update_self(tail.index);

        for handle in state.replicas.values() {
            let _ = handle.trigger_tx.send(());
        }
        true
    }

    /// Leader-only op dispatch. `Apply` additionally batches: it drains up
    /// to `max_append_entries` more queued entries non-blockingly before
    /// dispatching, per §4.1.3's `applyCh` batching rule.
    async fn handle_leader_op(&mut self, state: &mut LeaderState, op: OpMsg) -> bool {
        match op {
            OpMsg::Apply(data, future) => {
                let mut batch = vec![(Log::new_command(data), Some(future))];
                let mut pending_other = None;
                while batch.len() < self.core.config.max_append_entries {
                    match self.op_rx.try_recv() {
                        Ok(OpMsg::Apply(data, future)) => {
                            batch.push((Log::new_command(data), Some(future)));
                        }
                        Ok(other) => {
                            pending_other = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if !self.dispatch_logs(state, batch).await {
                    return false;
                }
                match pending_other {
                    Some(other) => self.handle_non_apply_leader_op(state, other).await,
                    None => true,
                }
            }
            other => self.handle_non_apply_leader_op(state, other).await,
        }
    }

    async fn handle_non_apply_leader_op(&mut self, state: &mut LeaderState, op: OpMsg) -> bool {
        match op {
            OpMsg::Apply(..) => unreachable!("Apply batching handled in handle_leader_op"),
            OpMsg::Barrier(future) => {
                self.dispatch_logs(state, vec![(Log::new_barrier(), Some(future))])
                    .await
            }
            OpMsg::VerifyLeader(future) => {
                self.start_verify(state, future).await;
                true
            }
            OpMsg::AddPeer(peer, future) => self.handle_add_peer(state, peer, future).await,
            OpMsg::RemovePeer(peer, future) => self.handle_remove_peer(state, peer, future).await,
            OpMsg::SetPeers(_, future) => {
                future.fail(RaftError::Leader);
                true
            }
        }
    }

    /// §4.6 `AddPeer`: reject pre-existing members, otherwise start
    /// replication immediately (pre-commit) so the new peer can catch up
    /// and vote for this very entry, then dispatch the membership entry.
    async fn handle_add_peer(
        &mut self,
        state: &mut LeaderState,
        peer: NodeId,
        future: RaftFutureSender,
    ) -> bool {
        let current = self.core.peers_snapshot().await;
        if peer == self.core.id() || current.contains(&peer) {
            future.fail(RaftError::KnownPeer);
            return true;
        }
        let new_set = membership::add_peer_set(&current, self.core.id(), peer);
        let encoded = match membership::encode_peer_set(&new_set) {
            Ok(e) => e,
            Err(e) => {
                future.fail(e);
                return true;
            }
        };
        {
            let mut peers = self.core.peers.write().await;
            *peers = new_set.iter().copied().filter(|&p| p != self.core.id()).collect();
        }
        let snapshot = self.core.peers_snapshot().await;
        if let Err(e) = self.core.peer_store.set_peers(&snapshot).await {
            pf_warn!(self, "failed persisting peer set after AddPeer: {}", e);
        }
        if !state.replicas.contains_key(&peer) {
            let next_index = self.core.durable.last_log_index() + 1;
            self.spawn_replication(state, peer, next_index);
        }
        // The quorum threshold tracks the peer set pre-commit, in lockstep
        // with starting replication above — otherwise a 3->4 AddPeer would
        // keep committing entries on the old (smaller) majority until this
        // very entry happened to commit.
        state
            .inflight
            .set_quorum(self.core.quorum(state.replicas.len()));
        let mut entry = Log::new_add_peer(peer);
        entry.data = encoded;
        self.dispatch_logs(state, vec![(entry, Some(future))]).await
    }

    /// §4.6 `RemovePeer`: reject unknown members, apply the local peer-view
    /// change pre-commit (except when removing self, see below), and only
    /// tear down the removed peer's replication worker once it has been
    /// flushed through the removal entry itself.
    async fn handle_remove_peer(
        &mut self,
        state: &mut LeaderState,
        peer: NodeId,
        future: RaftFutureSender,
    ) -> bool {
        let current = self.core.peers_snapshot().await;
        if peer != self.core.id() && !current.contains(&peer) {
            future.fail(RaftError::UnknownPeer);
            return true;
        }
        let new_set = membership::remove_peer_set(&current, self.core.id(), peer);
        let encoded = match membership::encode_peer_set(&new_set) {
            Ok(e) => e,
            Err(e) => {
                future.fail(e);
                return true;
            }
        };
        let removing_self = peer == self.core.id();
        if !removing_self {
            let mut peers = self.core.peers.write().await;
            *peers = new_set.iter().copied().filter(|&p| p != self.core.id()).collect();
            let snapshot = peers.clone();
            drop(peers);
            if let Err(e) = self.core.peer_store.set_peers(&snapshot).await {
                pf_warn!(self, "failed persisting peer set after RemovePeer: {}", e);
            }
        }

        let mut entry = Log::new_remove_peer(peer);
        entry.data = encoded;
        if !self.dispatch_logs(state, vec![(entry, Some(future))]).await {
            return false;
        }

        if removing_self {
            state.self_removal_index = Some(self.core.durable.last_log_index());
        } else if let Some(handle) = state.replicas.remove(&peer) {
            // Drop the departed peer's matchIndex entry and shrink the
            // quorum threshold together, or a stale ack already on the
            // wire could keep counting toward commit forever.
            state.inflight.remove_peer(peer);
            state
                .inflight
                .set_quorum(self.core.quorum(state.replicas.len()));
            let final_index = self.core.durable.last_log_index();
            let _ = handle.stop_tx.send(Some(final_index));
        }
        true
    }

    async fn start_verify(&self, state: &mut LeaderState, future: RaftFutureSender<()>) {
        let needed = self.core.quorum(state.replicas.len());
        let verify = Arc::new(StdMutex::new(VerifyRequest {
            needed,
            contacted: HashSet::from([self.core.id()]),
            future: Some(future),
        }));
        {
            let mut guard = verify.lock().unwrap();
            if guard.contacted.len() >= guard.needed {
                if let Some(f) = guard.future.take() {
                    f.respond(());
                }
                return;
            }
        }
        for handle in state.replicas.values() {
            let _ = handle.verify_tx.send(verify.clone());
        }
        state.pending_verifies.push(verify);
    }

    /// §4.1.3's hot loop: RPCs, step-down via a forced role change, the
    /// commit channel, client ops, and the lease timer.
    async fn leader_hot_loop(&mut self, state: &mut LeaderState, commit_rx: &mut watch::Receiver<()>) {
        let mut lease_interval = self.core.config.leader_lease_timeout;
        loop {
            let lease_sleep = tokio::time::sleep(lease_interval);
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                }

                changed = self.role_rx.changed() => {
                    if changed.is_err() || self.core.volatile.role().await != RaftState::Leader {
                        return;
                    }
                }

                rpc = self.rpc_rx.recv() => {
                    match rpc {
                        Some(rpc) => self.handle_rpc(rpc).await,
                        None => return,
                    }
                    if self.core.volatile.role().await != RaftState::Leader {
                        return;
                    }
                }

                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let commit_index = state.inflight.commit_index();
                    if commit_index > self.core.durable.commit_index() {
                        self.core.durable.set_commit_index(commit_index);
                        let futures: BTreeMap<LogIndex, RaftFutureSender> = state
                            .inflight
                            .drain_committed()
                            .into_iter()
                            .filter_map(|(index, future)| future.map(|f| (index, f)))
                            .collect();
                        if let Err(e) = self.core.process_logs(commit_index, futures).await {
                            pf_warn!(self, "process_logs failed: {}", e);
                        }
                        if let Some(index) = state.self_removal_index {
                            if commit_index >= index {
                                state.self_removal_index = None;
                                if self.core.config.shutdown_on_remove {
                                    pf_info!(self, "removed self from cluster, shutting down");
                                    let _ = self.shutdown_tx.send(true);
                                } else {
                                    pf_info!(self, "removed self from cluster, reverting to follower");
                                    self.core.become_follower(None).await;
                                }
                                return;
                            }
                        }
                    }
                }

                op = self.op_rx.recv() => {
                    match op {
                        Some(op) => {
                            if !self.handle_leader_op(state, op).await {
                                return;
                            }
                        }
                        None => return,
                    }
                }

                _ = lease_sleep => {
                    let now = Instant::now();
                    let lease_timeout = self.core.config.leader_lease_timeout;
                    let mut contacted = 1usize; // self
                    let mut max_diff = Duration::ZERO;
                    for handle in state.replicas.values() {
                        let last = *handle.last_contact.read().await;
                        let diff = now.saturating_duration_since(last);
                        if diff <= lease_timeout {
                            contacted += 1;
                        }
                        if diff > max_diff {
                            max_diff = diff;
                        }
                    }
                    let quorum = self.core.quorum(state.replicas.len());
                    if contacted < quorum {
                        pf_warn!(
                            self,
                            "lost contact with a quorum of followers, stepping down ({}/{})",
                            contacted,
                            quorum
                        );
                        self.core.become_follower(None).await;
                        return;
                    }
                    lease_interval = lease_timeout.saturating_sub(max_diff).max(MIN_LEASE_CHECK_INTERVAL);
                }
            }
        }
    }

    async fn leader_teardown(&mut self, mut state: LeaderState) {
        for (_, handle) in state.replicas.drain() {
            // Dropping `stop_tx` without a send is itself the signal: the
            // worker's `changed()` resolves to an error and it exits.
            drop(handle.stop_tx);
        }
        state.inflight.cancel_all(RaftError::LeadershipLost);
        for verify in state.pending_verifies.drain(..) {
            verify.lock().unwrap().fail(RaftError::LeadershipLost);
        }
        if self.core.volatile.leader().await == Some(self.core.id()) {
            self.core.volatile.set_leader(None).await;
        }
        let _ = self.leader_tx.send(false);
        pf_info!(self, "leader teardown complete");
    }
}

impl std::fmt::Display for RoleLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.core.id())
    }
}
