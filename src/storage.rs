//! `LogStore` and `StableStore` collaborator traits, plus the `DurableState`
//! cache that sits in front of them.
//!
//! Per §5 of the design, durable writes must precede any externally
//! observable action that depends on them, and volatile caches must never
//! be read stale. `DurableState` is the single accessor every other
//! component goes through for term, vote, commit index, and last-applied
//! index, so that invariant has exactly one place to hold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RaftError;
use crate::log_entry::Log;
use crate::{LogIndex, NodeId, Term};

/// Durable, index-addressable log entry storage.
///
/// Implementations must make `store_logs` and `delete_range` durable before
/// returning: the core relies on a `store_logs` success meaning the entries
/// will still be there after a crash.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Index of the oldest entry still in the store, or `0` if empty.
    async fn first_index(&self) -> Result<LogIndex, RaftError>;

    /// Index of the newest entry in the store, or `0` if empty.
    async fn last_index(&self) -> Result<LogIndex, RaftError>;

    /// Fetches the entry at `index`, if present.
    async fn get_log(&self, index: LogIndex) -> Result<Option<Log>, RaftError>;

    /// Appends `entries` contiguously. Implementations may assume `entries`
    /// is already ordered and index-contiguous with whatever follows
    /// `first_index()..=last_index()` after any truncation the caller
    /// performed via `delete_range` first.
    async fn store_logs(&self, entries: &[Log]) -> Result<(), RaftError>;

    /// Deletes all entries with index in `[lo, hi]` (inclusive on both
    /// ends). Used both for follower-side conflict truncation (a suffix)
    /// and for leader-side log compaction (a prefix).
    async fn delete_range(
        &self,
        lo: LogIndex,
        hi: LogIndex,
    ) -> Result<(), RaftError>;
}

/// Durable key-value storage for the term and vote, the only state that
/// must survive a crash strictly before the action it gates (casting a
/// vote, starting a new term) is allowed to have any external effect.
#[async_trait]
pub trait StableStore: Send + Sync {
    /// Fetches a byte-string value. Returns `Ok(None)` — never
    /// `Err(RaftError::NotFound)` — when the key is absent; `NotFound` is
    /// reserved for callers that specifically want an absent key to be an
    /// error (see §9's resolution of the sentinel-string open question).
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RaftError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), RaftError>;

    /// Convenience accessor for the common case of a little-endian `u64`.
    async fn get_u64(&self, key: &str) -> Result<Option<u64>, RaftError>;

    async fn set_u64(&self, key: &str, value: u64) -> Result<(), RaftError>;
}

const KEY_CURRENT_TERM: &str = "current_term";
const KEY_VOTE_TERM: &str = "last_vote_term";
const KEY_VOTE_CAND: &str = "last_vote_cand";

/// Single owner of `currentTerm`, the vote, the commit index, and the
/// last-applied index. Every read is served from an in-memory cache;
/// every write goes to the backing [`StableStore`] first and only updates
/// the cache once that write has returned successfully.
///
/// `commit_index`/`last_applied` are volatile (never written to
/// `StableStore`): they are reconstructed by replaying the log and any
/// installed snapshot at startup, exactly as the design's "Lifecycle"
/// section describes.
pub struct DurableState {
    id: NodeId,
    stable: Arc<dyn StableStore>,
    current_term: AtomicU64,
    vote: RwLock<(Term, Option<NodeId>)>,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    /// Cached `(lastLogIndex, lastLogTerm)`. `LogStore` remains the source
    /// of truth; this pair just saves a round trip through it on every RPC
    /// that needs to know the tail of the log. Kept in lockstep by every
    /// append/truncate path.
    last_log_index: AtomicU64,
    last_log_term: AtomicU64,
}

impl DurableState {
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    /// Restores cached state from `stable` at startup. A brand-new node
    /// (nothing yet written) starts at term 0 with no vote cast.
    pub async fn load(
        id: NodeId,
        stable: Arc<dyn StableStore>,
    ) -> Result<Self, RaftError> {
        let current_term = stable.get_u64(KEY_CURRENT_TERM).await?.unwrap_or(0);
        let vote_term = stable.get_u64(KEY_VOTE_TERM).await?.unwrap_or(0);
        let vote_cand = match stable.get(KEY_VOTE_CAND).await? {
            Some(bytes) if bytes.len() == 8 => {
                Some(u64::from_le_bytes(bytes.try_into().unwrap()))
            }
            _ => None,
        };
        Ok(DurableState {
            id,
            stable,
            current_term: AtomicU64::new(current_term),
            vote: RwLock::new((vote_term, vote_cand)),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            last_log_index: AtomicU64::new(0),
            last_log_term: AtomicU64::new(0),
        })
    }

    pub fn current_term(&self) -> Term {
        self.current_term.load(Ordering::SeqCst)
    }

    /// Persists `term` as the new `currentTerm` *before* returning, per the
    /// "durability before acknowledgment" invariant. Any externally
    /// observable effect of the term bump (e.g. broadcasting RequestVote)
    /// must happen only after this returns `Ok`.
    pub async fn set_current_term(&self, term: Term) -> Result<(), RaftError> {
        self.stable.set_u64(KEY_CURRENT_TERM, term).await?;
        self.current_term.store(term, Ordering::SeqCst);
        pf_trace!(self, "persisted current_term={}", term);
        Ok(())
    }

    /// The `(term, candidate)` this node voted for, if any this term.
    pub async fn voted_for(&self, term: Term) -> Option<NodeId> {
        let vote = self.vote.read().await;
        if vote.0 == term {
            vote.1
        } else {
            None
        }
    }

    /// Persists a vote for `candidate` in `term`, durably, before any
    /// RequestVote reply granting it is sent.
    pub async fn set_vote(
        &self,
        term: Term,
        candidate: NodeId,
    ) -> Result<(), RaftError> {
        self.stable.set_u64(KEY_VOTE_TERM, term).await?;
        self.stable
            .set(KEY_VOTE_CAND, &candidate.to_le_bytes())
            .await?;
        let mut vote = self.vote.write().await;
        *vote = (term, Some(candidate));
        pf_trace!(self, "persisted vote term={} cand={}", term, candidate);
        Ok(())
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::SeqCst)
    }

    /// `commitIndex` never decreases; enforced here rather than trusted at
    /// every call site.
    pub fn set_commit_index(&self, index: LogIndex) {
        let mut cur = self.commit_index.load(Ordering::SeqCst);
        while index > cur {
            match self.commit_index.compare_exchange_weak(
                cur,
                index,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Only the FSM worker (and the snapshot worker, restoring from a
    /// snapshot) should call this; the role loop never advances
    /// `lastApplied` itself.
    pub fn set_last_applied(&self, index: LogIndex) {
        self.last_applied.store(index, Ordering::SeqCst);
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.last_log_index.load(Ordering::SeqCst)
    }

    pub fn last_log_term(&self) -> Term {
        self.last_log_term.load(Ordering::SeqCst)
    }

    /// Updates the cached log tail. Called after every `store_logs`,
    /// `delete_range` (truncation), snapshot install, and at startup once
    /// the real tail has been read back from `LogStore`.
    pub fn set_last_log(&self, index: LogIndex, term: Term) {
        self.last_log_index.store(index, Ordering::SeqCst);
        self.last_log_term.store(term, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemStable(Mutex<HashMap<String, Vec<u8>>>);

    #[async_trait]
    impl StableStore for MemStable {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RaftError> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
        async fn set(&self, key: &str, value: &[u8]) -> Result<(), RaftError> {
            self.0
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }
        async fn get_u64(&self, key: &str) -> Result<Option<u64>, RaftError> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .get(key)
                .map(|b| u64::from_le_bytes(b.as_slice().try_into().unwrap())))
        }
        async fn set_u64(
            &self,
            key: &str,
            value: u64,
        ) -> Result<(), RaftError> {
            self.0
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_le_bytes().to_vec());
            Ok(())
        }
    }

    fn mem_stable() -> Arc<dyn StableStore> {
        Arc::new(MemStable(Mutex::new(HashMap::new())))
    }

    #[tokio::test]
    async fn fresh_state_starts_at_term_zero() {
        let state = DurableState::load(1, mem_stable()).await.unwrap();
        assert_eq!(state.current_term(), 0);
        assert_eq!(state.voted_for(0).await, None);
    }

    #[tokio::test]
    async fn term_and_vote_survive_reload() {
        let stable = mem_stable();
        {
            let state = DurableState::load(1, stable.clone()).await.unwrap();
            state.set_current_term(5).await.unwrap();
            state.set_vote(5, 42).await.unwrap();
        }
        let reloaded = DurableState::load(1, stable).await.unwrap();
        assert_eq!(reloaded.current_term(), 5);
        assert_eq!(reloaded.voted_for(5).await, Some(42));
        assert_eq!(reloaded.voted_for(6).await, None);
    }

    #[tokio::test]
    async fn commit_index_never_decreases() {
        let state = DurableState::load(1, mem_stable()).await.unwrap();
        state.set_commit_index(5);
        state.set_commit_index(3);
        assert_eq!(state.commit_index(), 5);
        state.set_commit_index(9);
        assert_eq!(state.commit_index(), 9);
    }
}
