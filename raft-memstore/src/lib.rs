//! In-memory, non-durable reference implementations of every collaborator
//! trait the `raft` crate requires: [`MemLogStore`], [`MemStableStore`],
//! [`MemSnapshotStore`], [`ChannelTransport`], and [`MemPeerStore`]. None of
//! this is meant for production use — there is no disk I/O anywhere in this
//! crate — it exists so the core crate's own multi-node tests can spin up a
//! handful of `Raft` instances in a single process, and to document each
//! trait's contract by example.
//!
//! Also ships [`KvFsm`], a trivial key-value [`Fsm`] used by tests and demos.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use raft::{
    AppendEntriesRequest, AppendEntriesResponse, Fsm, FsmSnapshot, InstallSnapshotRequest,
    InstallSnapshotResponse, Log, LogStore, NodeId, PeerStore, RaftError, RequestVoteRequest,
    RequestVoteResponse, Rpc, RpcHandler, SnapshotMeta, SnapshotSink, SnapshotStore, StableStore,
    Transport,
};

/// `Mutex<BTreeMap<u64, Log>>`-backed [`LogStore`]. `first_index`/`last_index`
/// read the map's bounds directly; `delete_range` removes an inclusive index
/// range, covering both follower-side truncation and leader-side compaction.
#[derive(Default)]
pub struct MemLogStore {
    logs: Mutex<BTreeMap<u64, Log>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn first_index(&self) -> Result<u64, RaftError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .keys()
            .next()
            .copied()
            .unwrap_or(0))
    }

    async fn last_index(&self) -> Result<u64, RaftError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn get_log(&self, index: u64) -> Result<Option<Log>, RaftError> {
        Ok(self.logs.lock().unwrap().get(&index).cloned())
    }

    async fn store_logs(&self, entries: &[Log]) -> Result<(), RaftError> {
        let mut logs = self.logs.lock().unwrap();
        for entry in entries {
            logs.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    async fn delete_range(&self, lo: u64, hi: u64) -> Result<(), RaftError> {
        let mut logs = self.logs.lock().unwrap();
        let doomed: Vec<u64> = logs.range(lo..=hi).map(|(&i, _)| i).collect();
        for index in doomed {
            logs.remove(&index);
        }
        Ok(())
    }
}

/// `Mutex<HashMap<String, Vec<u8>>>` plus a dedicated `u64` namespace,
/// backing [`StableStore`]. A missing key surfaces as `Ok(None)`; nothing
/// here ever produces the literal string `"not found"` that the design's
/// open question warns some real collaborators rely on — callers that want
/// absence to be an error get [`RaftError::NotFound`] instead, per the
/// resolution this crate picked for that question.
#[derive(Default)]
pub struct MemStableStore {
    bytes: Mutex<HashMap<String, Vec<u8>>>,
    uints: Mutex<HashMap<String, u64>>,
}

impl MemStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StableStore for MemStableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RaftError> {
        Ok(self.bytes.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), RaftError> {
        self.bytes
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_u64(&self, key: &str) -> Result<Option<u64>, RaftError> {
        Ok(self.uints.lock().unwrap().get(key).copied())
    }

    async fn set_u64(&self, key: &str, value: u64) -> Result<(), RaftError> {
        self.uints.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

/// A snapshot body being assembled in memory. `close` hands the finished
/// bytes to the owning [`MemSnapshotStore`]; `cancel` just discards them.
pub struct MemSnapshotSink {
    id: String,
    meta: SnapshotMeta,
    buf: Vec<u8>,
    store: Arc<MemSnapshotStoreInner>,
}

impl AsyncWrite for MemSnapshotSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SnapshotSink for MemSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(self: Box<Self>) -> Result<(), RaftError> {
        self.store.finish(self.meta, self.buf);
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> Result<(), RaftError> {
        Ok(())
    }
}

struct MemSnapshotStoreInner {
    metas: Mutex<Vec<SnapshotMeta>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    next_id: Mutex<u64>,
}

impl MemSnapshotStoreInner {
    fn finish(&self, meta: SnapshotMeta, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(meta.id.clone(), body);
        let mut metas = self.metas.lock().unwrap();
        metas.retain(|m| m.id != meta.id);
        metas.push(meta);
        // Newest-first per `SnapshotStore::list`'s contract; snapshots are
        // only ever created with non-decreasing indices in practice, but
        // sort defensively rather than assume it.
        metas.sort_by(|a, b| b.index.cmp(&a.index));
    }
}

/// `Mutex<Vec<SnapshotMeta>>` plus `Mutex<HashMap<String, Vec<u8>>>` for
/// bodies, backing [`SnapshotStore`]. `create` hands back a
/// [`MemSnapshotSink`] that buffers into a `Vec<u8>` until `close`.
pub struct MemSnapshotStore {
    inner: Arc<MemSnapshotStoreInner>,
}

impl Default for MemSnapshotStore {
    fn default() -> Self {
        MemSnapshotStore {
            inner: Arc::new(MemSnapshotStoreInner {
                metas: Mutex::new(Vec::new()),
                bodies: Mutex::new(HashMap::new()),
                next_id: Mutex::new(1),
            }),
        }
    }
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    async fn list(&self) -> Result<Vec<SnapshotMeta>, RaftError> {
        Ok(self.inner.metas.lock().unwrap().clone())
    }

    async fn create(
        &self,
        index: u64,
        term: u64,
        peers: Vec<NodeId>,
    ) -> Result<Box<dyn SnapshotSink>, RaftError> {
        let id = {
            let mut next_id = self.inner.next_id.lock().unwrap();
            let id = format!("snap-{}-{}", index, *next_id);
            *next_id += 1;
            id
        };
        Ok(Box::new(MemSnapshotSink {
            id: id.clone(),
            meta: SnapshotMeta {
                id,
                index,
                term,
                peers,
            },
            buf: Vec::new(),
            store: self.inner.clone(),
        }))
    }

    async fn open(
        &self,
        id: &str,
    ) -> Result<(SnapshotMeta, Box<dyn AsyncRead + Send + Unpin>), RaftError> {
        let meta = self
            .inner
            .metas
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(RaftError::NotFound)?;
        let body = self
            .inner
            .bodies
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok((meta, Box::new(std::io::Cursor::new(body))))
    }
}

/// `Mutex<Vec<u64>>`-backed durable peer list, independent of
/// [`ChannelTransport`]'s in-memory address book.
#[derive(Default)]
pub struct MemPeerStore {
    peers: Mutex<Vec<NodeId>>,
}

impl MemPeerStore {
    pub fn new(initial: Vec<NodeId>) -> Self {
        MemPeerStore {
            peers: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl PeerStore for MemPeerStore {
    async fn peers(&self) -> Result<Vec<NodeId>, RaftError> {
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn set_peers(&self, peers: &[NodeId]) -> Result<(), RaftError> {
        *self.peers.lock().unwrap() = peers.to_vec();
        Ok(())
    }
}

/// The shared switchboard every [`ChannelTransport`] in a test cluster
/// registers with: a node id keyed map of inbound RPC queues plus an
/// optional heartbeat fast-path handler, mirroring the design's note that
/// the fast path is an in-process shortcut rather than a wire-level one.
#[derive(Default)]
pub struct ChannelHub {
    nodes: Mutex<HashMap<NodeId, NodeRoute>>,
    /// Nodes currently cut off from every other node on this hub, in both
    /// directions. A test-only stand-in for a network partition.
    partitioned: Mutex<HashSet<NodeId>>,
}

struct NodeRoute {
    rpc_tx: mpsc::UnboundedSender<Rpc>,
    heartbeat_handler: Option<Arc<dyn RpcHandler>>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cuts `node` off from every other node on this hub, in both
    /// directions: its outbound RPCs fail to send and inbound RPCs
    /// addressed to it never reach its queue, including the heartbeat
    /// fast path.
    pub fn partition(&self, node: NodeId) {
        self.partitioned.lock().unwrap().insert(node);
    }

    /// Restores `node`'s connectivity after [`ChannelHub::partition`].
    pub fn heal(&self, node: NodeId) {
        self.partitioned.lock().unwrap().remove(&node);
    }

    fn is_partitioned(&self, node: NodeId) -> bool {
        self.partitioned.lock().unwrap().contains(&node)
    }
}

/// An in-process [`Transport`] that routes RPCs over `tokio::sync::mpsc`
/// queues keyed by node id, so a test can run several `Raft` instances in
/// one process without sockets. A node's address is simply its `u64` id,
/// so `encode_peer`/`decode_peer` are the identity transform over a
/// fixed-width little-endian encoding — kept only to honor the trait
/// contract, since nothing here actually needs to resolve an address.
pub struct ChannelTransport {
    id: NodeId,
    hub: Arc<ChannelHub>,
    consumer_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Rpc>>>,
}

impl ChannelTransport {
    /// Registers `id` on `hub` and returns a transport for it. Call this
    /// once per node before starting `Raft::new`.
    pub fn new(id: NodeId, hub: Arc<ChannelHub>) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        hub.nodes.lock().unwrap().insert(
            id,
            NodeRoute {
                rpc_tx,
                heartbeat_handler: None,
            },
        );
        Arc::new(ChannelTransport {
            id,
            hub,
            consumer_rx: AsyncMutex::new(Some(rpc_rx)),
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn consumer(&self) -> mpsc::UnboundedReceiver<Rpc> {
        self.consumer_rx
            .try_lock()
            .expect("consumer() called concurrently")
            .take()
            .expect("consumer() called more than once for this node")
    }

    fn set_heartbeat_handler(&self, handler: Arc<dyn RpcHandler>) {
        if let Some(route) = self.hub.nodes.lock().unwrap().get_mut(&self.id) {
            route.heartbeat_handler = Some(handler);
        }
    }

    async fn request_vote(
        &self,
        target: NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        let tx = self.route_to(target)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Rpc::RequestVote(req, resp_tx))
            .map_err(|_| RaftError::msg(format!("peer {} unreachable", target)))?;
        resp_rx
            .await
            .map_err(|_| RaftError::msg(format!("peer {} dropped the request", target)))
    }

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        // This is the design's heartbeat fast path in its purest form: an
        // in-process call straight into the target's RPC handler, never
        // touching its consumer queue at all.
        if let Some(handler) = self.heartbeat_handler_of(target) {
            return Ok(handler.append_entries(req).await);
        }
        let tx = self.route_to(target)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Rpc::AppendEntries(req, resp_tx))
            .map_err(|_| RaftError::msg(format!("peer {} unreachable", target)))?;
        resp_rx
            .await
            .map_err(|_| RaftError::msg(format!("peer {} dropped the request", target)))
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotRequest,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        let tx = self.route_to(target)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Rpc::InstallSnapshot(req, body, resp_tx))
            .map_err(|_| RaftError::msg(format!("peer {} unreachable", target)))?;
        resp_rx
            .await
            .map_err(|_| RaftError::msg(format!("peer {} dropped the request", target)))
    }

    fn encode_peer(&self, id: NodeId) -> Vec<u8> {
        id.to_le_bytes().to_vec()
    }

    fn decode_peer(&self, bytes: &[u8]) -> Result<NodeId, RaftError> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| RaftError::msg("malformed peer id"))?;
        Ok(u64::from_le_bytes(arr))
    }
}

impl ChannelTransport {
    fn route_to(&self, target: NodeId) -> Result<mpsc::UnboundedSender<Rpc>, RaftError> {
        if self.hub.is_partitioned(self.id) || self.hub.is_partitioned(target) {
            return Err(RaftError::msg(format!("peer {} unreachable", target)));
        }
        self.hub
            .nodes
            .lock()
            .unwrap()
            .get(&target)
            .map(|r| r.rpc_tx.clone())
            .ok_or_else(|| RaftError::msg(format!("peer {} not registered", target)))
    }

    fn heartbeat_handler_of(&self, target: NodeId) -> Option<Arc<dyn RpcHandler>> {
        if self.hub.is_partitioned(self.id) || self.hub.is_partitioned(target) {
            return None;
        }
        self.hub
            .nodes
            .lock()
            .unwrap()
            .get(&target)
            .and_then(|r| r.heartbeat_handler.clone())
    }
}

/// A read-only window into a [`KvFsm`]'s state, cloneable and usable from
/// outside the `Raft` node that owns the FSM itself (which, per the
/// design, is moved into the FSM worker and never reachable again). Tests
/// hang onto the handle returned by [`KvFsm::new`] to observe what got
/// applied.
#[derive(Clone, Default)]
pub struct KvHandle(Arc<Mutex<HashMap<String, String>>>);

impl KvHandle {
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A trivial last-writer-wins key-value [`Fsm`], used by this crate's own
/// tests and available to downstream demos. `apply` expects `data` to be
/// `bincode`-encoded `(String, String)` and returns the previous value (if
/// any), also `bincode`-encoded. State lives behind a shared `Arc`, so
/// [`KvFsm::new`] hands back a [`KvHandle`] a caller can keep after the
/// `Fsm` itself is handed off to `Raft::new`.
pub struct KvFsm {
    state: Arc<Mutex<HashMap<String, String>>>,
}

impl KvFsm {
    pub fn new() -> (Self, KvHandle) {
        let state = Arc::new(Mutex::new(HashMap::new()));
        (
            KvFsm {
                state: state.clone(),
            },
            KvHandle(state),
        )
    }
}

struct KvSnapshot {
    map: HashMap<String, String>,
}

#[async_trait]
impl FsmSnapshot for KvSnapshot {
    async fn persist(
        &self,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), RaftError> {
        let bytes = bincode::serialize(&self.map)?;
        tokio::io::AsyncWriteExt::write_all(writer, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl Fsm for KvFsm {
    async fn apply(&mut self, data: &[u8]) -> Result<Vec<u8>, RaftError> {
        let (key, value): (String, String) = bincode::deserialize(data)?;
        let previous = self.state.lock().unwrap().insert(key, value);
        Ok(bincode::serialize(&previous)?)
    }

    async fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>, RaftError> {
        Ok(Box::new(KvSnapshot {
            map: self.state.lock().unwrap().clone(),
        }))
    }

    async fn restore(
        &mut self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RaftError> {
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(reader, &mut bytes).await?;
        let restored: HashMap<String, String> = if bytes.is_empty() {
            HashMap::new()
        } else {
            bincode::deserialize(&bytes)?
        };
        *self.state.lock().unwrap() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_store_round_trips_and_truncates() {
        let store = MemLogStore::new();
        assert_eq!(store.first_index().await.unwrap(), 0);
        assert_eq!(store.last_index().await.unwrap(), 0);

        let entries: Vec<Log> = (1..=3)
            .map(|i| Log {
                index: i,
                term: 1,
                log_type: raft::LogType::Command,
                data: vec![i as u8],
                peer: None,
            })
            .collect();
        store.store_logs(&entries).await.unwrap();
        assert_eq!(store.first_index().await.unwrap(), 1);
        assert_eq!(store.last_index().await.unwrap(), 3);

        store.delete_range(2, 3).await.unwrap();
        assert_eq!(store.last_index().await.unwrap(), 1);
        assert!(store.get_log(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stable_store_missing_key_is_none_not_an_error() {
        let store = MemStableStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert_eq!(store.get_u64("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn snapshot_store_create_list_open_round_trip() {
        let store = MemSnapshotStore::new();
        let mut sink = store.create(5, 2, vec![1, 2]).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut sink, b"hello")
            .await
            .unwrap();
        let id = sink.id().to_string();
        sink.close().await.unwrap();

        let metas = store.list().await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, id);

        let (meta, mut reader) = store.open(&id).await.unwrap();
        assert_eq!(meta.index, 5);
        let mut body = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut body)
            .await
            .unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn kv_fsm_apply_and_snapshot_round_trip() {
        let (mut fsm, handle) = KvFsm::new();
        let req = bincode::serialize(&("a".to_string(), "1".to_string())).unwrap();
        let prev: Option<String> = bincode::deserialize(&fsm.apply(&req).await.unwrap()).unwrap();
        assert_eq!(prev, None);
        assert_eq!(handle.get("a"), Some("1".to_string()));

        let snapshot = fsm.snapshot().await.unwrap();
        let mut body = Vec::new();
        snapshot.persist(&mut body).await.unwrap();

        let (mut restored, restored_handle) = KvFsm::new();
        restored
            .restore(&mut std::io::Cursor::new(body))
            .await
            .unwrap();
        assert_eq!(restored_handle.get("a"), Some("1".to_string()));
    }
}
