//! Default sizes, limits and timings.
//!
//! Everything here is a default. The values actually used at runtime come
//! from [`SegmentConfig`](crate::log::SegmentConfig) and
//! [`BrokerConfig`](crate::cluster::BrokerConfig).

// =============================================================================
// Storage Constants
// =============================================================================

/// Default size at which the active segment is rolled (512 MB).
///
/// Must stay below 4 GB: index entries store byte positions as `u32`.
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 512 * 1024 * 1024;

/// Default age at which a non-empty active segment is rolled (24 hours).
pub const DEFAULT_MAX_SEGMENT_AGE_SECS: u64 = 24 * 60 * 60;

/// Default spacing between sparse index entries (4 KB of log).
pub const DEFAULT_INDEX_INTERVAL_BYTES: u64 = 4096;

/// Default maximum payload size of a single record (1 MB).
pub const DEFAULT_MAX_RECORD_BYTES: u32 = 1024 * 1024;

/// Default byte budget for a fetch (1 MB).
pub const DEFAULT_MAX_FETCH_BYTES: usize = 1024 * 1024;

/// Suffix of the staging directory used while a follower resyncs a partition
/// from scratch.
pub const RESYNC_DIR_SUFFIX: &str = ".resync";

// =============================================================================
// Network Constants
// =============================================================================

/// Maximum size of a single length-prefixed RPC frame (64 MB).
///
/// Applies to both Raft and replication connections.
pub const MAX_RPC_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Maximum size of a gossip UDP datagram.
pub const MAX_GOSSIP_PACKET_BYTES: usize = 65_000;

/// Timeout for establishing an RPC connection.
pub const RPC_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Timeout for one RPC round trip.
pub const RPC_OPERATION_TIMEOUT_MS: u64 = 10_000;

/// Consecutive failures before a peer's circuit opens.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// How long an open circuit stays open before a probe is allowed.
pub const CIRCUIT_BREAKER_RESET_SECS: u64 = 30;

// =============================================================================
// Gossip Constants
// =============================================================================

/// Default interval between failure-detection probes.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1_000;

/// Default time to wait for a direct ack before indirect probing.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 500;

/// Default number of members asked to probe indirectly.
pub const DEFAULT_INDIRECT_CHECKS: usize = 3;

/// Default multiplier for the suspicion window: `suspicion_mult * log2(N+1) * probe_interval`.
pub const DEFAULT_SUSPICION_MULT: u32 = 4;

/// Default multiplier for piggyback retransmissions: `retransmit_mult * log2(N+1)`.
pub const DEFAULT_RETRANSMIT_MULT: u32 = 4;

/// Default interval between gossip-only rounds.
pub const DEFAULT_GOSSIP_INTERVAL_MS: u64 = 200;

/// Default number of random members contacted per gossip round.
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;

/// Default interval between full state push-pull exchanges.
pub const DEFAULT_PUSH_PULL_INTERVAL_SECS: u64 = 30;

/// Default maximum updates piggybacked on one message.
pub const DEFAULT_MAX_PIGGYBACK: usize = 8;

/// Default time a dead or departed member stays in the member list.
pub const DEFAULT_DEAD_NODE_RECLAIM_SECS: u64 = 60;

// =============================================================================
// Consensus Constants
// =============================================================================

/// Default Raft leader heartbeat interval.
pub const DEFAULT_RAFT_HEARTBEAT_MS: u64 = 250;

/// Default lower bound of the randomized election timeout.
pub const DEFAULT_ELECTION_TIMEOUT_MIN_MS: u64 = 1_000;

/// Default upper bound of the randomized election timeout.
pub const DEFAULT_ELECTION_TIMEOUT_MAX_MS: u64 = 2_000;

/// Default number of applied entries between snapshots.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1_000;

/// Default number of concurrent Raft proposals from one node.
pub const DEFAULT_MAX_CONCURRENT_PROPOSALS: usize = 256;

/// Maximum times a write is forwarded between nodes looking for the leader.
pub const MAX_FORWARD_HOPS: u8 = 3;

// =============================================================================
// Broker Constants
// =============================================================================

/// Default interval between broker heartbeats committed through Raft.
pub const DEFAULT_BROKER_HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// Default time without a committed heartbeat after which a broker is fenced.
pub const DEFAULT_BROKER_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Default interval of the controller's leadership check.
pub const DEFAULT_CONTROLLER_INTERVAL_MS: u64 = 1_000;

/// Default interval of the periodic full reconcile, on top of the per-commit one.
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5_000;

/// Default interval between retention passes.
pub const DEFAULT_RETENTION_CHECK_INTERVAL_SECS: u64 = 300;

/// Default time a replica-quorum append waits for acknowledgements.
pub const DEFAULT_REPLICATION_TIMEOUT_MS: u64 = 5_000;

/// Default delay between empty follower catch-up fetches.
pub const DEFAULT_CATCH_UP_POLL_MS: u64 = 100;

/// Default depth of each per-replica forwarding queue.
pub const DEFAULT_FORWARD_QUEUE_DEPTH: usize = 1024;

/// Default time allowed for in-flight work to finish on shutdown.
pub const DEFAULT_LEAVE_DRAIN_MS: u64 = 5_000;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_segment_size_fits_index_positions() {
        assert!(DEFAULT_MAX_SEGMENT_BYTES <= u32::MAX as u64);
        assert!(DEFAULT_INDEX_INTERVAL_BYTES < DEFAULT_MAX_SEGMENT_BYTES);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_timing_relationships() {
        assert!(DEFAULT_RAFT_HEARTBEAT_MS < DEFAULT_ELECTION_TIMEOUT_MIN_MS);
        assert!(DEFAULT_ELECTION_TIMEOUT_MIN_MS < DEFAULT_ELECTION_TIMEOUT_MAX_MS);
        assert!(DEFAULT_PROBE_TIMEOUT_MS < DEFAULT_PROBE_INTERVAL_MS);
        assert!(DEFAULT_BROKER_HEARTBEAT_INTERVAL_MS * 2 < DEFAULT_BROKER_SESSION_TIMEOUT_MS);
    }
}
