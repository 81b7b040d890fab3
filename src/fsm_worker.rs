//! The single serial worker that owns every call into the user's [`Fsm`].
//!
//! Per §4.4/§5, the role loop never touches the FSM directly — it only
//! ever forwards committed logs, restore requests, and snapshot requests
//! over this worker's channel, so a slow `Fsm::apply`/`Fsm::snapshot`
//! cannot stall leader election or replication.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::RaftError;
use crate::fsm::{Fsm, FsmSnapshot};
use crate::future::RaftFutureSender;
use crate::log_entry::{Log, LogType};
use crate::snapshot::SnapshotMeta;
use crate::storage::DurableState;
use crate::{LogIndex, NodeId, Term};

/// The result of a successful `FsmWorkerMsg::Snapshot` request: a captured
/// FSM handle plus the metadata the snapshot worker needs to persist it.
pub struct FsmSnapshotResult {
    pub index: LogIndex,
    pub term: Term,
    pub peers: Vec<NodeId>,
    pub snapshot: Box<dyn FsmSnapshot>,
}

pub enum FsmWorkerMsg {
    /// A committed log entry, in commit order. `future` is `Some` only for
    /// the entry a client is actually waiting on (the last one in a
    /// batch); everything else rides through silently.
    Commit(Log, Option<RaftFutureSender>),

    /// Install a snapshot's state, replacing everything the FSM currently
    /// holds. Used both at startup (restoring the newest local snapshot)
    /// and after `InstallSnapshot` from a leader.
    Restore {
        meta: SnapshotMeta,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        ack: oneshot::Sender<Result<(), RaftError>>,
    },

    /// Capture a point-in-time snapshot handle for the snapshot worker to
    /// persist off the hot path.
    Snapshot {
        ack: oneshot::Sender<Result<FsmSnapshotResult, RaftError>>,
    },
}

pub(crate) struct FsmWorker {
    id: NodeId,
    fsm: Box<dyn Fsm>,
    durable: Arc<DurableState>,
    peers: Arc<tokio::sync::RwLock<Vec<NodeId>>>,
    rx: mpsc::UnboundedReceiver<FsmWorkerMsg>,
    shutdown: watch::Receiver<bool>,
    /// The worker's own cached view of what it has applied, independent of
    /// `DurableState::last_applied` (which this worker is also the sole
    /// writer of) — kept as a separate pair because the snapshot-metadata
    /// reply needs the *term*, which `DurableState` doesn't track.
    last_index: LogIndex,
    last_term: Term,
}

impl FsmWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        fsm: Box<dyn Fsm>,
        durable: Arc<DurableState>,
        peers: Arc<tokio::sync::RwLock<Vec<NodeId>>>,
        rx: mpsc::UnboundedReceiver<FsmWorkerMsg>,
        shutdown: watch::Receiver<bool>,
        initial_index: LogIndex,
        initial_term: Term,
    ) -> Self {
        FsmWorker {
            id,
            fsm,
            durable,
            peers,
            rx,
            shutdown,
            last_index: initial_index,
            last_term: initial_term,
        }
    }

    fn id(&self) -> NodeId {
        self.id
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        pf_debug!(self, "fsm worker shutting down");
                        return;
                    }
                }

                msg = self.rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: FsmWorkerMsg) {
        match msg {
            FsmWorkerMsg::Commit(log, future) => self.handle_commit(log, future).await,
            FsmWorkerMsg::Restore { meta, mut reader, ack } => {
                let result = self.fsm.restore(&mut *reader).await;
                if result.is_ok() {
                    self.last_index = meta.index;
                    self.last_term = meta.term;
                    self.durable.set_last_applied(meta.index);
                }
                let _ = ack.send(result);
            }
            FsmWorkerMsg::Snapshot { ack } => {
                let peers = self.peers.read().await.clone();
                let result = match self.fsm.snapshot().await {
                    Ok(snapshot) => Ok(FsmSnapshotResult {
                        index: self.last_index,
                        term: self.last_term,
                        peers,
                        snapshot,
                    }),
                    Err(e) => Err(e),
                };
                let _ = ack.send(result);
            }
        }
    }

    async fn handle_commit(&mut self, log: Log, future: Option<RaftFutureSender>) {
        // `Barrier`/`Noop`/`AddPeer`/`RemovePeer` still advance
        // `lastApplied` (this worker is the sole owner of that advance,
        // per §3) but never reach `Fsm::apply` — their side effects, if
        // any, already happened synchronously in the role loop / RPC
        // handler that committed them.
        let result: Result<Vec<u8>, RaftError> = if log.log_type == LogType::Command {
            self.fsm.apply(&log.data).await
        } else {
            Ok(Vec::new())
        };

        self.last_index = log.index;
        self.last_term = log.term;
        self.durable.set_last_applied(log.index);

        if let Some(future) = future {
            match result {
                Ok(v) => future.respond(v),
                Err(e) => future.fail(e),
            }
        } else if let Err(e) = result {
            pf_warn!(self, "fsm apply at index {} failed: {}", log.index, e);
        }
    }
}
