//! Tunables recognized by the consensus core.
//!
//! A plain struct with `Default` plus a `validate()` pass run once at
//! construction, and a `parsed_config!`-style macro an embedding application
//! can use to overlay a TOML fragment of its own config file onto these
//! defaults. The core crate never reads a config file itself — that belongs
//! to whatever CLI or service embeds it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;

/// Tunables for a single [`Raft`](crate::Raft) node. Construct with
/// `RaftConfig::default()` and override only the fields that matter for the
/// deployment; `Raft::new` calls [`RaftConfig::validate`] before starting
/// any task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Followers become candidates after this long without leader contact.
    /// The actual wait is a random value in `[heartbeat_timeout,
    /// 2*heartbeat_timeout)`.
    pub heartbeat_timeout: Duration,

    /// Candidates give up and restart a new election after this long
    /// without a quorum of votes. The actual wait is a random value in
    /// `[election_timeout, 2*election_timeout)`.
    pub election_timeout: Duration,

    /// A leader that hasn't contacted a quorum within this long steps down.
    /// Must be `<= election_timeout` (checked by [`validate`](Self::validate)).
    pub leader_lease_timeout: Duration,

    /// Maximum number of log entries a single `AppendEntries` batch, or a
    /// single leader-loop dispatch, may carry.
    pub max_append_entries: usize,

    /// Target interval between periodic (non-forced) snapshots.
    pub snapshot_interval: Duration,

    /// Minimum number of uncompacted log entries since the last snapshot
    /// before a periodic snapshot actually triggers.
    pub snapshot_threshold: u64,

    /// Number of log entries to retain behind the snapshot point so a
    /// slightly-behind follower can catch up via replication rather than a
    /// full snapshot transfer.
    pub trailing_logs: u64,

    /// Allows a node with no known peers to elect itself leader of a
    /// single-node cluster. Needed to bootstrap the very first node.
    pub enable_single_node: bool,

    /// Once a node has been elected leader at least once,
    /// `enable_single_node` is cleared to prevent a partitioned minority
    /// from re-bootstrapping a split-brain single-node cluster.
    pub disable_bootstrap_after_elect: bool,

    /// If the leader removes itself via `RemovePeer`, shut down once the
    /// removal entry commits instead of reverting to follower.
    pub shutdown_on_remove: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_timeout: Duration::from_millis(1000),
            election_timeout: Duration::from_millis(1000),
            leader_lease_timeout: Duration::from_millis(500),
            max_append_entries: 64,
            snapshot_interval: Duration::from_secs(120),
            snapshot_threshold: 8192,
            trailing_logs: 10240,
            enable_single_node: false,
            disable_bootstrap_after_elect: true,
            shutdown_on_remove: true,
        }
    }
}

impl RaftConfig {
    /// Checks cross-field invariants at construction time rather than deep
    /// inside the role loop, so a misconfigured node fails fast instead of
    /// misbehaving subtly.
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.heartbeat_timeout.is_zero() {
            return Err(RaftError::msg("heartbeat_timeout must be non-zero"));
        }
        if self.election_timeout < self.heartbeat_timeout {
            return Err(RaftError::msg(
                "election_timeout must be >= heartbeat_timeout",
            ));
        }
        if self.leader_lease_timeout > self.election_timeout {
            return Err(RaftError::msg(
                "leader_lease_timeout must be <= election_timeout",
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::msg("max_append_entries must be non-zero"));
        }
        Ok(())
    }

    /// Interval at which a replication worker sends an idle heartbeat to a
    /// caught-up follower, bounding how quickly the leader notices it has
    /// lost contact.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_timeout / 10
    }
}

impl RaftConfig {
    /// Overlays a TOML fragment (as produced by an embedding application's
    /// own config file) onto `RaftConfig::default()`. `None` or an empty
    /// fragment yields the defaults unchanged; only type mismatches on
    /// recognized keys are rejected. Does *not* call
    /// [`validate`](Self::validate) — callers should do so before using the
    /// result.
    pub fn from_toml_str(config_str: Option<&str>) -> Result<Self, RaftError> {
        let default = RaftConfig::default();
        let s = match config_str {
            None => return Ok(default),
            Some(s) if s.trim().is_empty() => return Ok(default),
            Some(s) => s,
        };

        let overlay: toml::Value = toml::from_str(s).map_err(|e| {
            RaftError::msg(format!("failed parsing config TOML: {}", e))
        })?;
        let mut base = toml::Value::try_from(&default).map_err(|e| {
            RaftError::msg(format!("failed serializing default config: {}", e))
        })?;
        if let (Some(base_tbl), Some(overlay_tbl)) =
            (base.as_table_mut(), overlay.as_table())
        {
            for (k, v) in overlay_tbl {
                base_tbl.insert(k.clone(), v.clone());
            }
        }
        base.try_into().map_err(|e| {
            RaftError::msg(format!("failed applying config overlay: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passes_validation() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn lease_longer_than_election_rejected() {
        let mut cfg = RaftConfig::default();
        cfg.leader_lease_timeout = cfg.election_timeout + Duration::from_millis(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = RaftConfig::default();
        cfg.max_append_entries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn heartbeat_interval_is_a_tenth_of_timeout() {
        let cfg = RaftConfig::default();
        assert_eq!(
            cfg.heartbeat_interval(),
            cfg.heartbeat_timeout / 10
        );
    }
}
