//! The node's role and the small bundle of volatile state every sub-loop
//! reads: current role, known leader, and last leader contact time.

use std::time::Instant;

use tokio::sync::{watch, RwLock};

use crate::NodeId;

/// Which role a node currently occupies. Distinct from the sub-loop
/// functions in `node::{follower, candidate, leader}` — this is just the
/// label the outer role loop switches on and that `Raft::state` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl std::fmt::Display for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RaftState::Follower => "Follower",
            RaftState::Candidate => "Candidate",
            RaftState::Leader => "Leader",
            RaftState::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Shared volatile state, read far more often (by observers and by the
/// heartbeat fast path) than it's written (by the role loop). Never held
/// across a `Transport`/`LogStore` await — callers copy what they need out
/// and drop the guard.
///
/// `role` rides a `watch` channel rather than the `RwLock` the other two
/// fields use: the candidate and leader sub-loops need to *wait* for a
/// role change forced by a concurrent heartbeat-fast-path RPC (see §5's
/// reentrancy note), and `watch` — unlike a bare `Notify` — remembers the
/// latest value, so a sub-loop that subscribes after the change already
/// happened still observes it instead of missing the wakeup.
pub struct Volatile {
    role_tx: watch::Sender<RaftState>,
    rest: RwLock<Rest>,
}

struct Rest {
    leader: Option<NodeId>,
    last_contact: Instant,
}

impl Volatile {
    pub fn new() -> Self {
        let (role_tx, _) = watch::channel(RaftState::Follower);
        Volatile {
            role_tx,
            rest: RwLock::new(Rest {
                leader: None,
                last_contact: Instant::now(),
            }),
        }
    }

    pub async fn role(&self) -> RaftState {
        *self.role_tx.borrow()
    }

    pub async fn set_role(&self, role: RaftState) {
        // `send_if_modified`-style dedup isn't needed: a `watch` send that
        // repeats the current value is harmless, just a spurious wakeup.
        let _ = self.role_tx.send(role);
    }

    /// Subscribes to role changes. Each subscriber gets an independent
    /// cursor; `changed()` resolves the first time the role differs from
    /// whatever this receiver has last observed, including a change that
    /// already happened before `subscribe` was called.
    pub fn subscribe_role(&self) -> watch::Receiver<RaftState> {
        self.role_tx.subscribe()
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.rest.read().await.leader
    }

    pub async fn set_leader(&self, leader: Option<NodeId>) {
        self.rest.write().await.leader = leader;
    }

    pub async fn last_contact(&self) -> Instant {
        self.rest.read().await.last_contact
    }

    pub async fn touch_contact(&self) {
        self.rest.write().await.last_contact = Instant::now();
    }
}

impl Default for Volatile {
    fn default() -> Self {
        Self::new()
    }
}
