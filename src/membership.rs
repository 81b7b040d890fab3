//! Peer-set encoding and the pure set-algebra behind `AddPeer`/`RemovePeer`.
//!
//! The actual pre-commit application (starting/stopping replication
//! workers, updating the leader's local peer view before the entry
//! commits) lives in `node::leader`; this module only has the parts that
//! don't need a running node to reason about, so they're easy to unit
//! test in isolation.

use crate::error::RaftError;
use crate::NodeId;

/// Encodes a peer set into the opaque bytes stored in a membership log
/// entry's `data` field.
pub fn encode_peer_set(peers: &[NodeId]) -> Result<Vec<u8>, RaftError> {
    Ok(bincode::serialize(peers)?)
}

/// Decodes a peer set previously encoded by [`encode_peer_set`].
pub fn decode_peer_set(data: &[u8]) -> Result<Vec<NodeId>, RaftError> {
    Ok(bincode::deserialize(data)?)
}

/// The resulting peer set after adding `new`, i.e. `{new, self} ∪ peers`.
/// `current` is the existing peer set (not including `self`).
pub fn add_peer_set(
    current: &[NodeId],
    self_id: NodeId,
    new: NodeId,
) -> Vec<NodeId> {
    let mut result: Vec<NodeId> = current.to_vec();
    if !result.contains(&self_id) {
        result.push(self_id);
    }
    if !result.contains(&new) {
        result.push(new);
    }
    result
}

/// The resulting peer set after removing `removed`, i.e.
/// `(peers \ {removed}) ∪ {self}`.
pub fn remove_peer_set(
    current: &[NodeId],
    self_id: NodeId,
    removed: NodeId,
) -> Vec<NodeId> {
    let mut result: Vec<NodeId> =
        current.iter().copied().filter(|&p| p != removed).collect();
    if !result.contains(&self_id) {
        result.push(self_id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let peers = vec![1, 2, 3];
        let bytes = encode_peer_set(&peers).unwrap();
        assert_eq!(decode_peer_set(&bytes).unwrap(), peers);
    }

    #[test]
    fn add_peer_set_includes_self_and_new() {
        let result = add_peer_set(&[2, 3], 1, 4);
        assert_eq!(result, vec![2, 3, 1, 4]);
    }

    #[test]
    fn add_peer_set_is_idempotent_for_existing_peer() {
        let result = add_peer_set(&[1, 2, 3], 1, 3);
        // self (1) and new (3) both already present; nothing duplicated
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn remove_peer_set_drops_removed_and_keeps_self() {
        let result = remove_peer_set(&[1, 2, 3], 1, 2);
        assert_eq!(result, vec![1, 3]);
    }
}
