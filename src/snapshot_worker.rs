//! Periodic and user-triggered snapshots, and the log compaction that
//! follows a successful one.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::fsm_worker::FsmWorkerMsg;
use crate::future::RaftFutureSender;
use crate::storage::{DurableState, LogStore};
use crate::{LogIndex, NodeId, Term};

pub(crate) struct SnapshotWorker {
    id: NodeId,
    config: Arc<RaftConfig>,
    durable: Arc<DurableState>,
    log_store: Arc<dyn LogStore>,
    snapshot_store: Arc<dyn crate::snapshot::SnapshotStore>,
    fsm_tx: mpsc::UnboundedSender<FsmWorkerMsg>,
    trigger_rx: mpsc::UnboundedReceiver<RaftFutureSender<()>>,
    shutdown: watch::Receiver<bool>,
    last_snapshot_index: LogIndex,
    last_snapshot_term: Term,
}

impl SnapshotWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        config: Arc<RaftConfig>,
        durable: Arc<DurableState>,
        log_store: Arc<dyn LogStore>,
        snapshot_store: Arc<dyn crate::snapshot::SnapshotStore>,
        fsm_tx: mpsc::UnboundedSender<FsmWorkerMsg>,
        trigger_rx: mpsc::UnboundedReceiver<RaftFutureSender<()>>,
        shutdown: watch::Receiver<bool>,
        last_snapshot_index: LogIndex,
        last_snapshot_term: Term,
    ) -> Self {
        SnapshotWorker {
            id,
            config,
            durable,
            log_store,
            snapshot_store,
            fsm_tx,
            trigger_rx,
            shutdown,
            last_snapshot_index,
            last_snapshot_term,
        }
    }

    fn id(&self) -> NodeId {
        self.id
    }

    fn next_interval(&self) -> Duration {
        // A little jitter so that, in a cluster where every node started
        // at roughly the same instant, snapshot attempts don't all land on
        // the same tick.
        let base = self.config.snapshot_interval;
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 3).max(1));
        base + Duration::from_millis(jitter_ms)
    }

    pub async fn run(mut self) {
        loop {
            let sleep = tokio::time::sleep(self.next_interval());
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        pf_debug!(self, "snapshot worker shutting down");
                        return;
                    }
                }

                Some(future) = self.trigger_rx.recv() => {
                    let result = self.take_snapshot().await;
                    match result {
                        Ok(()) => future.respond(()),
                        Err(e) => future.fail(e),
                    }
                }

                _ = sleep => {
                    if self.should_snapshot() {
                        if let Err(e) = self.take_snapshot().await {
                            pf_warn!(self, "periodic snapshot failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn should_snapshot(&self) -> bool {
        self.durable.last_log_index()
            .saturating_sub(self.last_snapshot_index)
            >= self.config.snapshot_threshold
    }

    async fn take_snapshot(&mut self) -> Result<(), RaftError> {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        self.fsm_tx
            .send(FsmWorkerMsg::Snapshot { ack: ack_tx })
            .map_err(|_| RaftError::msg("fsm worker channel closed"))?;
        let captured = ack_rx.await.map_err(RaftError::from)??;

        if captured.index == 0 {
            // Nothing applied yet; nothing meaningful to snapshot.
            return Ok(());
        }

        let mut sink = self
            .snapshot_store
            .create(captured.index, captured.term, captured.peers.clone())
            .await?;
        captured
            .snapshot
            .persist(sink.as_async_write())
            .await?;
        sink.close().await?;

        self.last_snapshot_index = captured.index;
        self.last_snapshot_term = captured.term;
        pf_info!(
            self,
            "persisted snapshot through index {} term {}",
            captured.index,
            captured.term
        );

        self.compact_log(captured.index).await
    }

    async fn compact_log(&self, snapshot_index: LogIndex) -> Result<(), RaftError> {
        let first_index = self.log_store.first_index().await?;
        if first_index == 0 {
            return Ok(());
        }
        let last_index = self.log_store.last_index().await?;
        let trailing_floor = last_index.saturating_sub(self.config.trailing_logs);
        let delete_through = snapshot_index.min(trailing_floor);
        if delete_through < first_index {
            return Ok(());
        }
        self.log_store.delete_range(first_index, delete_through).await?;
        pf_debug!(
            self,
            "compacted log range [{}, {}]",
            first_index,
            delete_through
        );
        Ok(())
    }
}
