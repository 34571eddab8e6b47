//! Configuration for the metadata Raft group.

use std::time::Duration;

use crate::constants::{
    DEFAULT_ELECTION_TIMEOUT_MAX_MS, DEFAULT_ELECTION_TIMEOUT_MIN_MS,
    DEFAULT_MAX_CONCURRENT_PROPOSALS, DEFAULT_RAFT_HEARTBEAT_MS, DEFAULT_SNAPSHOT_THRESHOLD,
};

/// Timing and backpressure settings for a Raft node.
///
/// Identity and addresses come from [`BrokerConfig`](crate::cluster::BrokerConfig);
/// the Raft node ID always equals the broker ID.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Heartbeat interval for the Raft leader.
    pub heartbeat_interval: Duration,

    /// Election timeout range (min). Each node picks a random timeout in
    /// `[election_timeout_min, election_timeout_max)`.
    pub election_timeout_min: Duration,

    /// Election timeout range (max).
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,

    /// Build a snapshot after this many log entries since the last one.
    pub snapshot_threshold: u64,

    /// Maximum number of in-flight proposals from this node.
    pub max_pending_proposals: usize,

    /// How long a proposal may wait for a free slot before failing.
    pub proposal_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_RAFT_HEARTBEAT_MS),
            election_timeout_min: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MIN_MS),
            election_timeout_max: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MAX_MS),
            max_payload_entries: 300,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            max_pending_proposals: DEFAULT_MAX_CONCURRENT_PROPOSALS,
            proposal_timeout: Duration::from_secs(10),
        }
    }
}

impl RaftConfig {
    /// Short timings for tests running several nodes in one process.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            proposal_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Read overrides from `RAFT_*` environment variables on top of `base`.
    pub fn from_env_with(base: Self) -> Result<Self, Box<dyn std::error::Error>> {
        let millis = |name: &str, default: Duration| -> Result<Duration, String> {
            match std::env::var(name) {
                Ok(v) => v
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| format!("Invalid {}: {}", name, e)),
                Err(_) => Ok(default),
            }
        };

        let snapshot_threshold = match std::env::var("RAFT_SNAPSHOT_THRESHOLD") {
            Ok(v) => v
                .parse()
                .map_err(|e| format!("Invalid RAFT_SNAPSHOT_THRESHOLD: {}", e))?,
            Err(_) => base.snapshot_threshold,
        };

        Ok(Self {
            heartbeat_interval: millis("RAFT_HEARTBEAT_MS", base.heartbeat_interval)?,
            election_timeout_min: millis("RAFT_ELECTION_TIMEOUT_MIN_MS", base.election_timeout_min)?,
            election_timeout_max: millis("RAFT_ELECTION_TIMEOUT_MAX_MS", base.election_timeout_max)?,
            snapshot_threshold,
            ..base
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) should be much less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.max_pending_proposals == 0 {
            errors.push("max_pending_proposals must be at least 1".to_string());
        }

        if self.snapshot_threshold == 0 {
            errors.push("snapshot_threshold must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get openraft Config from this RaftConfig.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "ledgerline-metadata".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RaftConfig::default().validate().is_ok());
        assert!(RaftConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_inverted_election_timeouts_rejected() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(500),
            ..RaftConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("election_timeout_min"));
    }

    #[test]
    fn test_heartbeat_must_be_below_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_secs(5),
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_openraft_config_carries_timings() {
        let config = RaftConfig::default().to_openraft_config();
        assert_eq!(config.heartbeat_interval, DEFAULT_RAFT_HEARTBEAT_MS);
        assert_eq!(config.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN_MS);
        assert!(config.validate().is_ok());
    }
}
