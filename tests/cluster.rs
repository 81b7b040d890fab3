//! Multi-node integration tests built on the in-memory reference
//! collaborators from `raft-memstore`. Each test runs several `Raft`
//! instances in one process, wired together through a single
//! [`ChannelHub`], and exercises one of the concrete scenarios from the
//! design: bootstrap, leader failure, log truncation on rejoin, and
//! membership change.

use std::sync::Arc;
use std::time::Duration;

use raft::{NodeId, Raft, RaftConfig, RaftError, RaftState};
use raft_memstore::{ChannelHub, ChannelTransport, KvFsm, KvHandle, MemLogStore, MemPeerStore, MemSnapshotStore, MemStableStore};

/// Short timeouts so elections and replication settle in well under a
/// second; still comfortably above the randomization window so flakiness
/// stays ping-pong rare rather than the default.
fn test_config() -> RaftConfig {
    RaftConfig {
        heartbeat_timeout: Duration::from_millis(60),
        election_timeout: Duration::from_millis(60),
        leader_lease_timeout: Duration::from_millis(50),
        max_append_entries: 64,
        snapshot_interval: Duration::from_secs(3600),
        snapshot_threshold: 1_000_000,
        trailing_logs: 1024,
        enable_single_node: false,
        disable_bootstrap_after_elect: true,
        shutdown_on_remove: true,
    }
}

struct Node {
    id: NodeId,
    raft: Raft,
    #[allow(dead_code)]
    kv: KvHandle,
}

async fn spawn_node(id: NodeId, peers: Vec<NodeId>, hub: &Arc<ChannelHub>, config: RaftConfig) -> Node {
    let log_store = Arc::new(MemLogStore::new());
    let stable_store = Arc::new(MemStableStore::new());
    let snapshot_store = Arc::new(MemSnapshotStore::new());
    let peer_store = Arc::new(MemPeerStore::new(peers));
    let transport = ChannelTransport::new(id, hub.clone());
    let (fsm, kv) = KvFsm::new();

    let raft = Raft::new(
        id,
        config,
        log_store,
        stable_store,
        snapshot_store,
        transport,
        peer_store,
        Box::new(fsm),
    )
    .await
    .expect("node startup should not fail");

    Node { id, raft, kv }
}

async fn spawn_cluster(ids: &[NodeId], config: RaftConfig) -> (Arc<ChannelHub>, Vec<Node>) {
    let hub = ChannelHub::new();
    let mut nodes = Vec::new();
    for &id in ids {
        let peers: Vec<NodeId> = ids.iter().copied().filter(|&p| p != id).collect();
        nodes.push(spawn_node(id, peers, &hub, config.clone()).await);
    }
    (hub, nodes)
}

/// Polls `nodes` until exactly one reports itself as leader, or panics
/// after `timeout`. Returns that node's index.
async fn wait_for_leader(nodes: &[Node], timeout: Duration) -> usize {
    tokio::time::timeout(timeout, async {
        loop {
            for (i, node) in nodes.iter().enumerate() {
                if node.raft.state().await == RaftState::Leader {
                    return i;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cluster failed to elect a leader in time")
}

async fn wait_for_commit_index(node: &Raft, index: u64, timeout: Duration) {
    tokio::time::timeout(timeout, async {
        loop {
            if node.stats().await.commit_index >= index {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("node never caught up to commit index {}", index));
}

/// Scenario 1: three-node bootstrap. A's election timer fires first (or
/// B's, or C's — the test doesn't control the race, only that exactly one
/// wins), wins a quorum, dispatches its bootstrap no-op, and every node
/// ends up with `lastApplied == 1`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_bootstrap_elects_a_leader_and_commits_the_bootstrap_entry() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    for node in &nodes {
        wait_for_commit_index(&node.raft, 1, Duration::from_secs(2)).await;
    }

    let leader_count = {
        let mut count = 0;
        for node in &nodes {
            if node.raft.state().await == RaftState::Leader {
                count += 1;
            }
        }
        count
    };
    assert_eq!(leader_count, 1, "exactly one node should hold leadership");
    assert_eq!(nodes[leader_idx].raft.stats().await.last_applied, 1);
}

/// Scenario: `Apply` on the leader commits and becomes visible (through
/// the FSM handle) on every node, not just the leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn apply_is_visible_on_every_node_once_committed() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    let payload = bincode::serialize(&("x".to_string(), "42".to_string())).unwrap();
    nodes[leader_idx]
        .raft
        .apply(payload, Duration::from_secs(1))
        .await
        .expect("apply should succeed on the leader");

    for node in &nodes {
        wait_for_commit_index(&node.raft, 2, Duration::from_secs(2)).await;
    }
    // Give the FSM worker a moment to drain the commit it was just handed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for node in &nodes {
        assert_eq!(node.kv.get("x"), Some("42".to_string()));
    }
}

/// A non-leader rejects `Apply` with `NotLeader`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn apply_on_a_follower_is_rejected() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let follower_idx = (0..nodes.len()).find(|&i| i != leader_idx).unwrap();

    let err = nodes[follower_idx]
        .raft
        .apply(vec![1, 2, 3], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::NotLeader(_)));
}

/// `Barrier` resolves only after every prior apply has reached the FSM.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_waits_for_prior_applies() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    let payload = bincode::serialize(&("y".to_string(), "7".to_string())).unwrap();
    let leader = &nodes[leader_idx].raft;
    leader
        .apply(payload, Duration::from_secs(1))
        .await
        .unwrap();
    leader.barrier(Duration::from_secs(1)).await.unwrap();

    assert_eq!(nodes[leader_idx].kv.get("y"), Some("7".to_string()));
}

/// `VerifyLeader` succeeds while a quorum is reachable.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verify_leader_succeeds_with_a_healthy_quorum() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    nodes[leader_idx]
        .raft
        .verify_leader()
        .await
        .expect("verify_leader should succeed while the quorum is up");
}

/// Scenario 4: membership add. A 3-node cluster commits `AddPeer(D)`; D
/// catches up via replication and the quorum size becomes `floor(4/2)+1 = 3`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_peer_grows_the_cluster_and_the_new_peer_catches_up() {
    let (hub, mut nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let leader_id = nodes[leader_idx].id;

    let payload = bincode::serialize(&("z".to_string(), "1".to_string())).unwrap();
    nodes[leader_idx]
        .raft
        .apply(payload, Duration::from_secs(1))
        .await
        .unwrap();

    nodes[leader_idx]
        .raft
        .add_peer(4)
        .await
        .expect("add_peer should commit");

    let new_node = spawn_node(4, vec![leader_id], &hub, test_config()).await;
    wait_for_commit_index(&new_node.raft, 3, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(new_node.kv.get("z"), Some("1".to_string()));

    let stats = nodes[leader_idx].raft.stats().await;
    assert_eq!(stats.num_peers, 3);

    nodes.push(new_node);
}

/// Regression: after a 3->4 `AddPeer`, committing a new entry must require
/// 3 acks, not the old cluster's 2. Partition two of the three non-leader
/// nodes away from the leader so only the leader and one follower can ack,
/// and assert the next `Apply` times out rather than committing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_peer_raises_the_quorum_so_two_acks_are_no_longer_enough() {
    let (hub, mut nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let leader_id = nodes[leader_idx].id;

    nodes[leader_idx]
        .raft
        .add_peer(4)
        .await
        .expect("add_peer should commit");

    let new_node = spawn_node(4, vec![leader_id], &hub, test_config()).await;
    wait_for_commit_index(&new_node.raft, 2, Duration::from_secs(2)).await;
    nodes.push(new_node);

    let commit_before = nodes[leader_idx].raft.stats().await.commit_index;

    // Leave the leader with exactly one reachable follower: quorum over
    // four members needs three acks, and 1 (leader) + 1 (survivor) is two.
    let partitioned: Vec<NodeId> = nodes
        .iter()
        .map(|n| n.id)
        .filter(|&id| id != leader_id)
        .take(2)
        .collect();
    for &id in &partitioned {
        hub.partition(id);
    }

    // Losing contact with two of three followers also trips the leader
    // lease's check-quorum, which can step the leader down mid-wait; either
    // outcome is an acceptable way for the entry to fail to commit.
    let payload = bincode::serialize(&("w".to_string(), "stuck".to_string())).unwrap();
    let err = nodes[leader_idx]
        .raft
        .apply(payload, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RaftError::EnqueueTimeout | RaftError::LeadershipLost | RaftError::NotLeader(_)
    ));

    assert_eq!(
        nodes[leader_idx].raft.stats().await.commit_index,
        commit_before,
        "an entry acked by only 2 of 4 members must not commit"
    );

    for &id in &partitioned {
        hub.heal(id);
    }
}

/// Re-adding an existing peer is rejected with `KnownPeer`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_peer_twice_is_rejected() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let other = (0..nodes.len()).find(|&i| i != leader_idx).unwrap();
    let other_id = nodes[other].id;

    let err = nodes[leader_idx]
        .raft
        .add_peer(other_id)
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::KnownPeer));
}

/// Removing a peer that isn't a member is rejected with `UnknownPeer`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_unknown_peer_is_rejected() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    let err = nodes[leader_idx]
        .raft
        .remove_peer(999)
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::UnknownPeer));
}

/// Scenario 5: self-removal with `shutdown_on_remove = true`. Once the
/// removal entry commits, the (former) leader shuts itself down, and a
/// survivor wins the next election.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_self_removal_shuts_it_down_and_a_survivor_takes_over() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let leader_id = nodes[leader_idx].id;

    // remove_peer's future resolves on commit, which can race the leader
    // tearing itself down right after — either outcome (Ok or a shutdown
    // error) is an acceptable resolution of that race.
    let _ = nodes[leader_idx].raft.remove_peer(leader_id).await;

    nodes[leader_idx]
        .raft
        .shutdown()
        .await
        .expect("shutdown should resolve even if already underway");

    let survivors: Vec<&Node> = nodes.iter().filter(|n| n.id != leader_id).collect();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            for node in &survivors {
                if node.raft.state().await == RaftState::Leader {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a surviving node should win the next election");
}

/// `shutdown` is idempotent and a shut-down node stops serving operations.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_is_idempotent() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    nodes[leader_idx].raft.shutdown().await.unwrap();
    nodes[leader_idx].raft.shutdown().await.unwrap();

    let err = nodes[leader_idx]
        .raft
        .apply(vec![1], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RaftError::RaftShutdown | RaftError::NotLeader(_) | RaftError::EnqueueTimeout
    ));
}

/// Scenario 2: leader failure. Once the first leader is gone, one of the
/// two survivors elects itself at a higher term and keeps serving `Apply`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_survives_leader_crash_and_elects_a_new_one() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;
    let first_term = nodes[leader_idx].raft.stats().await.term;

    nodes[leader_idx].raft.shutdown().await.unwrap();

    let survivors: Vec<&Node> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader_idx)
        .map(|(_, n)| n)
        .collect();

    let new_leader = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            for node in &survivors {
                if node.raft.state().await == RaftState::Leader {
                    return node;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a survivor should win a new election");

    assert!(new_leader.raft.stats().await.term > first_term);

    let payload = bincode::serialize(&("after_crash".to_string(), "ok".to_string())).unwrap();
    new_leader
        .raft
        .apply(payload, Duration::from_secs(1))
        .await
        .expect("the new leader should still be able to commit");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if survivors.iter().all(|n| n.kv.get("after_crash").is_some()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("every survivor should eventually apply the post-crash command");
    assert_eq!(new_leader.kv.get("after_crash"), Some("ok".to_string()));
}

/// A forced snapshot succeeds and compacts the log behind it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_snapshot_compacts_the_log() {
    let (_hub, nodes) = spawn_cluster(&[1, 2, 3], test_config()).await;
    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(2)).await;

    for i in 0..5 {
        let payload = bincode::serialize(&(format!("k{i}"), i.to_string())).unwrap();
        nodes[leader_idx]
            .raft
            .apply(payload, Duration::from_secs(1))
            .await
            .unwrap();
    }

    nodes[leader_idx]
        .raft
        .snapshot()
        .await
        .expect("forced snapshot should succeed");
}
