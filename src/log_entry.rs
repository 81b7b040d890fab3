//! The durable log entry type and its variants.

use serde::{Deserialize, Serialize};

use crate::{LogIndex, NodeId, Term};

/// The kind of a [`Log`] entry. `Command` entries are opaque to the core
/// and handed to the [`Fsm`](crate::Fsm) verbatim; the rest drive the
/// consensus engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    /// A user-supplied command, opaque to the core.
    Command,

    /// The no-op a freshly elected leader dispatches as a current-term
    /// commit witness. Carries the same encoded peer set a membership
    /// entry would, so it doubles as the initial bootstrap of the shared
    /// peer view.
    Noop,

    /// A membership-change entry adding a peer. `data` holds the encoded
    /// resulting peer set.
    AddPeer,

    /// A membership-change entry removing a peer. `data` holds the
    /// encoded resulting peer set.
    RemovePeer,

    /// A marker entry used to implement `Raft::barrier`: it carries no
    /// data and is never handed to `Fsm::apply`, but its position in the
    /// commit order guarantees every entry before it has been applied.
    Barrier,
}

/// A single entry in the replicated log.
///
/// `index` is 1-based and strictly increasing; within an unbroken run at a
/// single term it is also contiguous (gaps only ever appear transiently
/// across a leader change, and are healed by truncation, never left in
/// place).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub index: LogIndex,
    pub term: Term,
    #[serde(rename = "type")]
    pub log_type: LogType,
    /// Opaque to the core except for `AddPeer`/`RemovePeer`/`Noop`, where
    /// it holds the bincode-encoded resulting peer set.
    pub data: Vec<u8>,
    /// Transient: set on a membership entry before its `data` has been
    /// encoded by the leader loop. Never serialized, never read back from
    /// `LogStore` — `data` is the durable representation.
    #[serde(skip)]
    pub peer: Option<NodeId>,
}

impl Log {
    /// Builds a `Command` entry. `index`/`term` are assigned by the leader
    /// loop at dispatch time, so placeholder zeros are fine here.
    pub fn new_command(data: Vec<u8>) -> Self {
        Log {
            index: 0,
            term: 0,
            log_type: LogType::Command,
            data,
            peer: None,
        }
    }

    /// Builds a `Barrier` marker entry.
    pub fn new_barrier() -> Self {
        Log {
            index: 0,
            term: 0,
            log_type: LogType::Barrier,
            data: Vec::new(),
            peer: None,
        }
    }

    /// Builds a `Noop` entry carrying the bootstrap peer set.
    pub fn new_noop(encoded_peers: Vec<u8>) -> Self {
        Log {
            index: 0,
            term: 0,
            log_type: LogType::Noop,
            data: encoded_peers,
            peer: None,
        }
    }

    /// Builds an `AddPeer` entry for `peer`; `data` is filled in by the
    /// leader loop once it has computed the resulting peer set.
    pub fn new_add_peer(peer: NodeId) -> Self {
        Log {
            index: 0,
            term: 0,
            log_type: LogType::AddPeer,
            data: Vec::new(),
            peer: Some(peer),
        }
    }

    /// Builds a `RemovePeer` entry for `peer`.
    pub fn new_remove_peer(peer: NodeId) -> Self {
        Log {
            index: 0,
            term: 0,
            log_type: LogType::RemovePeer,
            data: Vec::new(),
            peer: Some(peer),
        }
    }

    /// True for variants the core itself interprets the body of
    /// (membership entries and the bootstrap no-op).
    pub fn is_membership(&self) -> bool {
        matches!(
            self.log_type,
            LogType::Noop | LogType::AddPeer | LogType::RemovePeer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_expected_type() {
        assert_eq!(Log::new_command(vec![1]).log_type, LogType::Command);
        assert_eq!(Log::new_barrier().log_type, LogType::Barrier);
        assert!(Log::new_add_peer(7).is_membership());
        assert!(Log::new_remove_peer(7).is_membership());
        assert!(Log::new_noop(vec![]).is_membership());
        assert!(!Log::new_command(vec![]).is_membership());
    }

    #[test]
    fn round_trips_through_bincode() {
        let log = Log {
            index: 5,
            term: 2,
            log_type: LogType::Command,
            data: vec![1, 2, 3],
            peer: None,
        };
        let bytes = bincode::serialize(&log).unwrap();
        let back: Log = bincode::deserialize(&bytes).unwrap();
        assert_eq!(log, back);
    }
}
