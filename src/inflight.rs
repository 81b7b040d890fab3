//! The leader's per-index quorum-commit accounting.
//!
//! Follows the same "track each follower's replicated-through index, take
//! the median" shape as the design this core is modeled after: rather than
//! counting per-entry ballots, a single `matchIndex` per peer (plus the
//! leader's own `lastLogIndex` standing in for its implicit vote) is
//! enough, because `matchIndex` only ever advances and always covers a
//! contiguous prefix — quorum on index `i` therefore already implies
//! quorum on every index `< i`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use crate::future::RaftFutureSender;
use crate::{LogIndex, NodeId};

// The futures the inflight tracker deals in all resolve to the FSM's
// opaque apply result (`RaftFutureSender<Vec<u8>>`, `RaftFutureSender`'s
// default type parameter); membership/barrier entries simply respond with
// an empty vector.

struct Inner {
    match_index: HashMap<NodeId, LogIndex>,
    /// Futures for entries dispatched by this leadership term but not yet
    /// handed off to the FSM worker, keyed by index.
    futures: BTreeMap<LogIndex, RaftFutureSender>,
    /// Highest index known to have quorum, monotonic.
    commit_index: LogIndex,
    /// Highest index already returned by `drain_committed`.
    drained_through: LogIndex,
    /// Index of the first entry this leadership term will itself dispatch
    /// (`lastLogIndex + 1` as observed when this tracker was built, i.e.
    /// the bootstrap no-op's index). `commit_index` may not advance past
    /// this point until a report at or beyond it reaches quorum — until
    /// then any quorum found among `match_index` is entirely prior-term
    /// and must not be committed on its own (Raft figure-8).
    start_index: LogIndex,
}

/// A register of outstanding leader-side log futures, with majority-quorum
/// commitment bookkeeping. One instance per leadership term; discarded
/// (and its futures cancelled) on stepdown.
pub struct InflightTracker {
    self_id: NodeId,
    /// Majority threshold over the *current* peer set, including
    /// `self_id`. Mutable: a committed `AddPeer`/`RemovePeer` changes `N`,
    /// and the commit threshold must track it immediately, not just at
    /// leadership start — see `set_quorum`.
    quorum: AtomicUsize,
    inner: Mutex<Inner>,
    commit_tx: watch::Sender<()>,
}

impl InflightTracker {
    /// `quorum` is the majority threshold over the *full* peer set
    /// including `self_id` (`floor(N/2) + 1`). `last_log_index` seeds the
    /// leader's own implicit vote and fixes `start_index` (`last_log_index
    /// + 1`), the index below which quorum alone can never commit — only a
    /// report at or past this leadership term's own first dispatched entry
    /// can.
    pub fn new(
        self_id: NodeId,
        quorum: usize,
        last_log_index: LogIndex,
        commit_tx: watch::Sender<()>,
    ) -> Self {
        let mut match_index = HashMap::new();
        match_index.insert(self_id, last_log_index);
        InflightTracker {
            self_id,
            quorum: AtomicUsize::new(quorum),
            inner: Mutex::new(Inner {
                match_index,
                futures: BTreeMap::new(),
                commit_index: 0,
                drained_through: 0,
                start_index: last_log_index + 1,
            }),
            commit_tx,
        }
    }

    /// Registers a newly dispatched entry's future. Must be called before
    /// any replication acks for `index` can arrive (i.e. from the same
    /// critical section as the `StoreLogs` call that assigned `index`).
    pub fn register(&self, index: LogIndex, future: RaftFutureSender) {
        let mut inner = self.inner.lock().unwrap();
        inner.futures.insert(index, future);
    }

    /// Reports that `peer` has replicated through `match_index`, and
    /// recomputes the quorum commit point. Pulses the commit channel
    /// (coalesced — a burst of acks collapses to one wakeup) if the
    /// commit point advanced.
    ///
    /// A quorum found entirely below `start_index` is a quorum on
    /// prior-term entries only and is never committed on its own — that
    /// would let a new leader commit another term's entries before it has
    /// put anything of its own up for a vote (Raft figure-8). Once some
    /// report reaches `start_index` or beyond and that index itself has
    /// quorum, the jump to `new_commit` carries every prior-term entry up
    /// to it transitively, per the usual rule.
    pub fn commit(&self, peer: NodeId, match_index: LogIndex) {
        let advanced = {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner.match_index.entry(peer).or_insert(0);
            if match_index <= *slot {
                return; // stale/duplicate ack, never regresses
            }
            *slot = match_index;

            let mut indices: Vec<LogIndex> =
                inner.match_index.values().copied().collect();
            indices.sort_unstable();
            // The (quorum)-th largest value is replicated to at least
            // `quorum` members (ties broken toward the larger index).
            let quorum = self.quorum.load(Ordering::SeqCst);
            debug_assert!(quorum >= 1 && quorum <= indices.len());
            let new_commit = indices[indices.len() - quorum];

            if new_commit > inner.commit_index && new_commit >= inner.start_index {
                inner.commit_index = new_commit;
                true
            } else {
                false
            }
        };
        if advanced {
            // Coalesced: `watch::Sender::send` overwrites any value the
            // receiver hasn't observed yet rather than queueing.
            let _ = self.commit_tx.send(());
        }
    }

    /// Updates the leader's own `lastLogIndex` (its implicit vote) after a
    /// local dispatch, without waiting for a peer ack.
    pub fn update_self(&self, last_log_index: LogIndex) {
        self.commit(self.self_id, last_log_index);
    }

    /// Updates the majority threshold, called whenever a committed
    /// `AddPeer`/`RemovePeer` changes the size of the peer set this
    /// leader tracks. Takes effect on the next `commit()` call; does not
    /// retroactively revisit `commit_index` itself (it is monotonic and a
    /// quorum shrink/grow can only change what counts toward the *next*
    /// advance, never un-commit something already committed).
    pub fn set_quorum(&self, new_quorum: usize) {
        self.quorum.store(new_quorum, Ordering::SeqCst);
    }

    /// Drops a departed peer's `matchIndex` entry so it can no longer
    /// count toward quorum. Must be called once a `RemovePeer` entry for
    /// `peer` takes effect, in lockstep with `set_quorum` and with tearing
    /// down that peer's replication worker.
    pub fn remove_peer(&self, peer: NodeId) {
        self.inner.lock().unwrap().match_index.remove(&peer);
    }

    /// Returns the newly committed indices, in ascending order, together
    /// with their futures (if the future hasn't already been taken),
    /// since the last call. Advances the drain cursor to the current
    /// commit point.
    pub fn drain_committed(
        &self,
    ) -> Vec<(LogIndex, Option<RaftFutureSender>)> {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.drained_through + 1;
        let to = inner.commit_index;
        if from > to {
            return Vec::new();
        }
        let mut out = Vec::new();
        for index in from..=to {
            let future = inner.futures.remove(&index);
            out.push((index, future));
        }
        inner.drained_through = to;
        out
    }

    /// Highest index with confirmed quorum so far.
    pub fn commit_index(&self) -> LogIndex {
        self.inner.lock().unwrap().commit_index
    }

    /// Fails every future still outstanding (not yet drained), in no
    /// particular order, and clears them so a subsequent drain can't
    /// resolve them twice.
    pub fn cancel_all(&self, err: crate::RaftError) {
        let mut inner = self.inner.lock().unwrap();
        let mut pending: VecDeque<RaftFutureSender> =
            std::mem::take(&mut inner.futures).into_values().collect();
        drop(inner);
        while let Some(future) = pending.pop_front() {
            future.fail(err_clone(&err));
        }
    }
}

// `RaftError` doesn't implement `Clone` (it wraps `io::Error`); build a
// fresh equivalent for each failed future instead.
fn err_clone(err: &crate::RaftError) -> crate::RaftError {
    crate::RaftError::msg(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(quorum: usize) -> InflightTracker {
        let (tx, _rx) = watch::channel(());
        InflightTracker::new(1, quorum, 0, tx)
    }

    #[test]
    fn commit_needs_quorum_of_three() {
        let t = tracker(2); // N=3 (self + 2 peers), quorum = 2
        t.commit(2, 5);
        assert_eq!(t.commit_index(), 0); // only self(0) + peer2(5): median of [0,5] bottom-2 is 0
        t.commit(3, 5);
        // match_index now {1:0, 2:5, 3:5}; sorted [0,5,5]; quorum=2 -> index len-2=1 -> 5
        assert_eq!(t.commit_index(), 5);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let t = tracker(2);
        t.commit(2, 5);
        t.commit(2, 3); // regression, ignored
        let mut inner = t.inner.lock().unwrap();
        assert_eq!(*inner.match_index.get(&2).unwrap(), 5);
        drop(inner);
    }

    #[test]
    fn prior_term_quorum_alone_does_not_commit() {
        // Leader elected with a prior-term log already at index 5
        // (last_log_index = 5), so start_index = 6: nothing before that
        // may commit on quorum alone, even though acks for index 5 arrive
        // (e.g. from a replication worker's idle heartbeat firing before
        // the leader's own no-op has been dispatched).
        let (tx, _rx) = watch::channel(());
        let t = InflightTracker::new(1, 2, 5, tx); // N=3, quorum=2
        t.commit(2, 5);
        t.commit(3, 5);
        // match_index {1:5, 2:5, 3:5}; quorum found at 5, but 5 < start_index(6).
        assert_eq!(t.commit_index(), 0);

        // Now the current-term no-op at index 6 reaches quorum too.
        t.commit(2, 6);
        t.commit(3, 6);
        assert_eq!(t.commit_index(), 6);
    }

    #[test]
    fn drain_committed_is_ascending_and_one_shot() {
        let t = tracker(1); // single-node quorum
        let (tx1, _rx1) = tokio::sync::oneshot::channel();
        let (tx2, _rx2) = tokio::sync::oneshot::channel();
        t.register(1, RaftFutureSender::new(tx1));
        t.register(2, RaftFutureSender::new(tx2));
        t.update_self(2);
        let drained = t.drain_committed();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 1);
        assert_eq!(drained[1].0, 2);
        assert!(t.drain_committed().is_empty());
    }
}
