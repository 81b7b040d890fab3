//! Crate-wide error type.

use std::fmt;
use std::io;

/// The single error type returned by every fallible operation in this
/// crate, surfaced to callers through the futures returned by [`Raft`](crate::Raft)'s
/// public API.
#[derive(Debug)]
pub enum RaftError {
    /// Rejected a leader-only operation because this node is not the
    /// leader. Carries the currently known leader, if any.
    NotLeader(Option<crate::NodeId>),

    /// Rejected an operation that requires *not* being the leader.
    /// `SetPeers` is the one public operation with this shape: it's a
    /// forced, unsafe override meant for recovering a stuck cluster from
    /// outside consensus, so the leader hot loop refuses it rather than
    /// risk racing the normal membership-change path.
    Leader,

    /// A command was accepted but leadership was lost before it committed.
    LeadershipLost,

    /// The node has been, or is being, shut down.
    RaftShutdown,

    /// `Apply`/`Barrier` could not be enqueued onto the role loop within
    /// the caller-supplied timeout.
    EnqueueTimeout,

    /// `AddPeer` rejected because the address is already a peer (or self).
    KnownPeer,

    /// `RemovePeer` rejected because the address is not a current peer.
    UnknownPeer,

    /// A `StableStore`/`SnapshotStore` lookup found no value for the key.
    NotFound,

    /// Opaque, human-readable failure with no more specific variant,
    /// typically produced by a collaborator implementation.
    Msg(String),

    /// A collaborator (`LogStore`, `StableStore`, `SnapshotStore`,
    /// `Transport`) reported an I/O failure.
    Io(io::Error),
}

impl RaftError {
    /// Builds an opaque [`RaftError::Msg`] from anything `Display`-able.
    /// Used at collaborator boundaries where a more specific variant isn't
    /// warranted.
    pub fn msg(s: impl fmt::Display) -> Self {
        RaftError::Msg(s.to_string())
    }
}

impl fmt::Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftError::NotLeader(Some(leader)) => {
                write!(f, "not the leader, known leader is {}", leader)
            }
            RaftError::NotLeader(None) => {
                write!(f, "not the leader, and no leader is known")
            }
            RaftError::Leader => write!(f, "operation requires non-leader"),
            RaftError::LeadershipLost => write!(f, "leadership lost"),
            RaftError::RaftShutdown => write!(f, "raft node is shut down"),
            RaftError::EnqueueTimeout => {
                write!(f, "timed out enqueuing operation")
            }
            RaftError::KnownPeer => write!(f, "peer is already known"),
            RaftError::UnknownPeer => write!(f, "peer is not known"),
            RaftError::NotFound => write!(f, "key not found"),
            RaftError::Msg(s) => write!(f, "{}", s),
            RaftError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for RaftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RaftError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RaftError {
    fn from(e: io::Error) -> Self {
        RaftError::Io(e)
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Msg(format!("encoding error: {}", e))
    }
}

// Futures carrying a `RaftError` are dropped silently when the receiving
// end goes away (e.g. the caller abandoned the future); model that as
// `RaftShutdown` rather than panicking the role loop.
impl From<tokio::sync::oneshot::error::RecvError> for RaftError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        RaftError::RaftShutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            RaftError::NotLeader(Some(3)).to_string(),
            "not the leader, known leader is 3"
        );
        assert_eq!(RaftError::KnownPeer.to_string(), "peer is already known");
    }

    #[test]
    fn msg_wraps_any_display() {
        let err = RaftError::msg("disk full");
        assert!(matches!(err, RaftError::Msg(ref s) if s == "disk full"));
    }
}
