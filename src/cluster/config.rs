//! Broker configuration.
//!
//! # Configuration Profiles
//!
//! Start from a profile and override what you need:
//!
//! ```rust,no_run
//! use ledgerline::cluster::{BrokerConfig, BrokerProfile};
//!
//! // Short timeouts, no fsync, single-node friendly
//! let dev = BrokerConfig::from_profile(BrokerProfile::Development);
//!
//! // Quorum acks, periodic fsync, conservative failure detection
//! let prod = BrokerConfig::from_profile(BrokerProfile::Production);
//! ```
//!
//! [`BrokerConfig::from_env`] reads `PROFILE` first and layers the other
//! environment variables on top of it.

use std::path::PathBuf;
use std::time::Duration;

use super::membership::GossipConfig;
use super::partition_log::AckPolicy;
use super::raft::RaftConfig;
use crate::constants::{
    DEFAULT_BROKER_HEARTBEAT_INTERVAL_MS, DEFAULT_BROKER_SESSION_TIMEOUT_MS,
    DEFAULT_CATCH_UP_POLL_MS, DEFAULT_CONTROLLER_INTERVAL_MS, DEFAULT_FORWARD_QUEUE_DEPTH,
    DEFAULT_LEAVE_DRAIN_MS, DEFAULT_MAX_FETCH_BYTES, DEFAULT_RECONCILE_INTERVAL_MS,
    DEFAULT_REPLICATION_TIMEOUT_MS, DEFAULT_RETENTION_CHECK_INTERVAL_SECS,
};
use crate::log::{FlushPolicy, SegmentConfig};
use crate::types::BrokerId;

/// Validated starting points for a broker configuration.
///
/// | Profile | Use Case | Ack Policy | Flush | Failure Detection |
/// |---------|----------|------------|-------|-------------------|
/// | Development | Local testing | Leader only | OS | Fast |
/// | Production | Real clusters | Replica quorum | Every 1000 | Conservative |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerProfile {
    /// Short timeouts and no explicit fsync. **Not suitable for production use.**
    #[default]
    Development,

    /// Quorum acknowledgements and longer session timeouts.
    Production,
}

impl BrokerProfile {
    /// Get a human-readable description of the profile.
    pub fn description(&self) -> &'static str {
        match self {
            BrokerProfile::Development => "Local development and testing",
            BrokerProfile::Production => "Durable production clusters",
        }
    }

    /// Get all available profiles.
    pub fn all() -> &'static [BrokerProfile] {
        &[BrokerProfile::Development, BrokerProfile::Production]
    }
}

impl std::fmt::Display for BrokerProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerProfile::Development => write!(f, "development"),
            BrokerProfile::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for BrokerProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(BrokerProfile::Development),
            "production" | "prod" => Ok(BrokerProfile::Production),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production",
                s
            )),
        }
    }
}

/// Everything a broker needs to start.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Unique broker ID. Also used as the Raft node ID.
    pub broker_id: BrokerId,

    /// Root of all on-disk state: `partitions/` and `raft/` live below it.
    pub data_dir: PathBuf,

    /// Client address advertised in leader hints. The client protocol server
    /// itself lives outside this crate.
    pub client_addr: String,

    /// Bind address for replication RPCs. Port 0 picks a free port.
    pub replication_addr: String,

    /// Bind address for Raft RPCs. Port 0 picks a free port.
    pub raft_addr: String,

    /// Bind address for gossip UDP. Port 0 picks a free port.
    pub gossip_addr: String,

    /// Host other brokers use to reach this one. Combined with each bound port.
    pub advertised_host: String,

    /// Join the metadata group as a voter rather than a learner.
    pub voter: bool,

    /// Initialize a new metadata group with this broker as its only voter.
    /// Exactly one broker of a new cluster should set this.
    pub bootstrap: bool,

    /// Brokers the bootstrap broker waits to see alive through gossip,
    /// itself included, before it initializes the metadata group. Zero and
    /// one do not wait.
    pub bootstrap_expect: usize,

    /// Gossip addresses of existing brokers to join through.
    pub seeds: Vec<String>,

    /// Default acknowledgement policy for produce.
    pub ack_policy: AckPolicy,

    pub segment: SegmentConfig,
    pub gossip: GossipConfig,
    pub raft: RaftConfig,

    /// How often this broker commits a heartbeat through Raft.
    pub broker_heartbeat_interval: Duration,

    /// How long the controller waits without a committed heartbeat before
    /// fencing a broker.
    pub broker_session_timeout: Duration,

    /// How often the controller re-plans leadership.
    pub controller_interval: Duration,

    /// Full reconcile period, on top of the reconcile after every commit.
    pub reconcile_interval: Duration,

    pub retention_check_interval: Duration,

    /// How long a replica-quorum produce waits for acknowledgements.
    pub replication_timeout: Duration,

    /// Delay between catch-up fetches that returned nothing.
    pub catch_up_poll_interval: Duration,

    /// Capacity of each leader-to-replica forwarding queue.
    pub forward_queue_depth: usize,

    /// Byte budget of one catch-up fetch.
    pub max_fetch_bytes: usize,

    /// Delete the local copy of a partition when it is reassigned away from
    /// this broker. When false the files stay until the topic is deleted.
    pub delete_unassigned: bool,

    /// Time allowed for in-flight appends on shutdown.
    pub leave_drain_timeout: Duration,

    /// How long startup waits to reach a metadata leader.
    pub join_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_profile(BrokerProfile::Development)
    }
}

impl BrokerConfig {
    /// Build the configuration for `profile` with local default addresses.
    pub fn from_profile(profile: BrokerProfile) -> Self {
        let base = Self {
            broker_id: 0,
            data_dir: PathBuf::from("/tmp/ledgerline-data"),
            client_addr: "127.0.0.1:9092".to_string(),
            replication_addr: "0.0.0.0:9093".to_string(),
            raft_addr: "0.0.0.0:9094".to_string(),
            gossip_addr: "0.0.0.0:9095".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            voter: true,
            bootstrap: false,
            bootstrap_expect: 0,
            seeds: Vec::new(),
            ack_policy: AckPolicy::LeaderOnly,
            segment: SegmentConfig::default(),
            gossip: GossipConfig::default(),
            raft: RaftConfig::default(),
            broker_heartbeat_interval: Duration::from_millis(DEFAULT_BROKER_HEARTBEAT_INTERVAL_MS),
            broker_session_timeout: Duration::from_millis(DEFAULT_BROKER_SESSION_TIMEOUT_MS),
            controller_interval: Duration::from_millis(DEFAULT_CONTROLLER_INTERVAL_MS),
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            retention_check_interval: Duration::from_secs(DEFAULT_RETENTION_CHECK_INTERVAL_SECS),
            replication_timeout: Duration::from_millis(DEFAULT_REPLICATION_TIMEOUT_MS),
            catch_up_poll_interval: Duration::from_millis(DEFAULT_CATCH_UP_POLL_MS),
            forward_queue_depth: DEFAULT_FORWARD_QUEUE_DEPTH,
            max_fetch_bytes: DEFAULT_MAX_FETCH_BYTES,
            delete_unassigned: false,
            leave_drain_timeout: Duration::from_millis(DEFAULT_LEAVE_DRAIN_MS),
            join_timeout: Duration::from_secs(30),
        };

        match profile {
            BrokerProfile::Development => base,
            BrokerProfile::Production => Self {
                ack_policy: AckPolicy::ReplicaQuorum,
                segment: SegmentConfig {
                    flush_policy: FlushPolicy::EveryN(1000),
                    ..SegmentConfig::default()
                },
                broker_session_timeout: Duration::from_secs(20),
                broker_heartbeat_interval: Duration::from_secs(3),
                join_timeout: Duration::from_secs(120),
                ..base
            },
        }
    }

    /// A single-node-capable config on loopback with ephemeral ports and
    /// fast timings.
    pub fn for_testing(broker_id: BrokerId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            broker_id,
            data_dir: data_dir.into(),
            client_addr: format!("127.0.0.1:{}", 19092 + broker_id),
            replication_addr: "127.0.0.1:0".to_string(),
            raft_addr: "127.0.0.1:0".to_string(),
            gossip_addr: "127.0.0.1:0".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            bootstrap: broker_id == 0,
            segment: SegmentConfig {
                max_segment_bytes: 64 * 1024,
                ..SegmentConfig::default()
            },
            gossip: GossipConfig::for_testing(),
            raft: RaftConfig::for_testing(),
            broker_heartbeat_interval: Duration::from_millis(200),
            broker_session_timeout: Duration::from_millis(1500),
            controller_interval: Duration::from_millis(100),
            reconcile_interval: Duration::from_millis(500),
            retention_check_interval: Duration::from_secs(60),
            replication_timeout: Duration::from_secs(2),
            catch_up_poll_interval: Duration::from_millis(20),
            leave_drain_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(15),
            ..Self::from_profile(BrokerProfile::Development)
        }
    }

    /// Directory holding one subdirectory per hosted partition.
    pub fn partitions_dir(&self) -> PathBuf {
        self.data_dir.join("partitions")
    }

    /// Directory holding Raft vote, log and snapshots.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Address peers use for a listener bound to `port`.
    pub fn advertise(&self, port: u16) -> String {
        format!("{}:{}", self.advertised_host, port)
    }

    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker_id < 0 {
            errors.push(format!("broker_id ({}) must be non-negative", self.broker_id));
        }

        if self.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must be set".to_string());
        }

        if self.advertised_host.is_empty() || self.advertised_host == "0.0.0.0" {
            errors.push(format!(
                "advertised_host ({:?}) must be an address peers can reach",
                self.advertised_host
            ));
        }

        if self.bootstrap && !self.voter {
            errors.push("a bootstrap broker must be a voter".to_string());
        }

        if self.bootstrap_expect > 1 && !self.bootstrap {
            errors.push(format!(
                "bootstrap_expect ({}) is only honored by the bootstrap broker",
                self.bootstrap_expect
            ));
        }

        if !self.bootstrap && self.seeds.is_empty() {
            errors.push("a broker that does not bootstrap needs at least one seed".to_string());
        }

        // Two missed heartbeats must not be enough to fence a broker.
        if self.broker_heartbeat_interval * 2 >= self.broker_session_timeout {
            errors.push(format!(
                "broker_heartbeat_interval ({:?}) must be less than half of broker_session_timeout ({:?})",
                self.broker_heartbeat_interval, self.broker_session_timeout
            ));
        }

        if self.controller_interval.is_zero() {
            errors.push("controller_interval must be non-zero".to_string());
        }

        if self.reconcile_interval.is_zero() {
            errors.push("reconcile_interval must be non-zero".to_string());
        }

        if self.replication_timeout.is_zero() {
            errors.push("replication_timeout must be non-zero".to_string());
        }

        if self.forward_queue_depth == 0 {
            errors.push("forward_queue_depth must be at least 1".to_string());
        }

        if self.max_fetch_bytes < self.segment.max_record_bytes as usize {
            errors.push(format!(
                "max_fetch_bytes ({}) must be at least max_record_bytes ({})",
                self.max_fetch_bytes, self.segment.max_record_bytes
            ));
        }

        for (prefix, result) in [
            ("segment", self.segment.validate()),
            ("gossip", self.gossip.validate()),
            ("raft", self.raft.validate()),
        ] {
            if let Err(sub) = result {
                errors.extend(sub.into_iter().map(|e| format!("{}: {}", prefix, e)));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PROFILE`: `development` or `production` (default: development)
    /// - `BROKER_ID`: Broker ID (default: 0)
    /// - `DATA_DIR`: Root data directory (default: /tmp/ledgerline-data)
    /// - `HOST`: Bind host for all listeners (default: 0.0.0.0)
    /// - `ADVERTISED_HOST`: Host peers connect back to (default: HOST, or
    ///   127.0.0.1 when HOST is 0.0.0.0)
    /// - `CLIENT_PORT`, `REPLICATION_PORT`, `RAFT_PORT`, `GOSSIP_PORT`
    ///   (default: 9092, 9093, 9094, 9095)
    /// - `VOTER`: "true" or "false" (default: true)
    /// - `BOOTSTRAP`: "true" to initialize a new metadata group (default: false)
    /// - `BOOTSTRAP_EXPECT`: Brokers to wait for before bootstrapping (default: 0)
    /// - `SEEDS`: Comma-separated gossip addresses of existing brokers
    /// - `ACK_POLICY`: `leader` or `quorum`
    /// - `FLUSH_POLICY`: `os-default`, `every-append` or `every-<n>`
    /// - `MAX_SEGMENT_BYTES`, `RETENTION_BYTES`, `RETENTION_HOURS`
    /// - `BROKER_HEARTBEAT_MS`, `BROKER_SESSION_TIMEOUT_MS`, `REPLICATION_TIMEOUT_MS`
    /// - `DELETE_UNASSIGNED`: "true" to drop local copies of reassigned partitions
    /// - `RAFT_*`: see [`RaftConfig::from_env_with`]
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let profile: BrokerProfile = match std::env::var("PROFILE") {
            Ok(v) => v.parse()?,
            Err(_) => BrokerProfile::default(),
        };
        let defaults = Self::from_profile(profile);

        let broker_id: i32 = std::env::var("BROKER_ID")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| format!("Invalid BROKER_ID: {}", e))?;

        if broker_id < 0 {
            return Err("BROKER_ID must be non-negative".into());
        }

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir.clone());

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        // ADVERTISED_HOST is what other brokers and clients use to connect back.
        // Defaults to HOST, but if HOST is 0.0.0.0, default to 127.0.0.1 for local dev.
        let advertised_host = std::env::var("ADVERTISED_HOST").unwrap_or_else(|_| {
            if host == "0.0.0.0" {
                "127.0.0.1".to_string()
            } else {
                host.clone()
            }
        });

        let port = |name: &str, default: u16| -> Result<u16, String> {
            match std::env::var(name) {
                Ok(v) => v.parse().map_err(|e| format!("Invalid {}: {}", name, e)),
                Err(_) => Ok(default),
            }
        };
        let client_port = port("CLIENT_PORT", 9092)?;
        let replication_port = port("REPLICATION_PORT", 9093)?;
        let raft_port = port("RAFT_PORT", 9094)?;
        let gossip_port = port("GOSSIP_PORT", 9095)?;

        let flag = |name: &str, default: bool| -> bool {
            std::env::var(name)
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default)
        };

        let seeds: Vec<String> = std::env::var("SEEDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let bootstrap_expect: usize = match std::env::var("BOOTSTRAP_EXPECT") {
            Ok(v) => v
                .parse()
                .map_err(|e| format!("Invalid BOOTSTRAP_EXPECT: {}", e))?,
            Err(_) => defaults.bootstrap_expect,
        };

        let ack_policy = match std::env::var("ACK_POLICY") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.ack_policy,
        };

        let millis = |name: &str, default: Duration| -> Result<Duration, String> {
            match std::env::var(name) {
                Ok(v) => v
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| format!("Invalid {}: {}", name, e)),
                Err(_) => Ok(default),
            }
        };

        let mut segment = defaults.segment.clone();
        if let Ok(v) = std::env::var("FLUSH_POLICY") {
            segment.flush_policy = v.parse()?;
        }
        if let Ok(v) = std::env::var("MAX_SEGMENT_BYTES") {
            segment.max_segment_bytes = v
                .parse()
                .map_err(|e| format!("Invalid MAX_SEGMENT_BYTES: {}", e))?;
        }
        if let Ok(v) = std::env::var("RETENTION_BYTES") {
            segment.retention_bytes = Some(
                v.parse()
                    .map_err(|e| format!("Invalid RETENTION_BYTES: {}", e))?,
            );
        }
        if let Ok(v) = std::env::var("RETENTION_HOURS") {
            let hours: u64 = v
                .parse()
                .map_err(|e| format!("Invalid RETENTION_HOURS: {}", e))?;
            segment.retention_age = Some(Duration::from_secs(hours * 3600));
        }

        let config = Self {
            broker_id,
            data_dir,
            client_addr: format!("{}:{}", advertised_host, client_port),
            replication_addr: format!("{}:{}", host, replication_port),
            raft_addr: format!("{}:{}", host, raft_port),
            gossip_addr: format!("{}:{}", host, gossip_port),
            voter: flag("VOTER", defaults.voter),
            bootstrap: flag("BOOTSTRAP", defaults.bootstrap),
            bootstrap_expect,
            seeds,
            ack_policy,
            segment,
            raft: RaftConfig::from_env_with(defaults.raft.clone())?,
            broker_heartbeat_interval: millis("BROKER_HEARTBEAT_MS", defaults.broker_heartbeat_interval)?,
            broker_session_timeout: millis(
                "BROKER_SESSION_TIMEOUT_MS",
                defaults.broker_session_timeout,
            )?,
            replication_timeout: millis("REPLICATION_TIMEOUT_MS", defaults.replication_timeout)?,
            delete_unassigned: flag("DELETE_UNASSIGNED", defaults.delete_unassigned),
            advertised_host,
            ..defaults
        };

        tracing::info!(
            %profile,
            broker_id = config.broker_id,
            data_dir = %config.data_dir.display(),
            advertised_host = %config.advertised_host,
            voter = config.voter,
            bootstrap = config.bootstrap,
            bootstrap_expect = config.bootstrap_expect,
            seeds = ?config.seeds,
            ack_policy = %config.ack_policy,
            "Loaded broker configuration"
        );

        if let Err(errors) = config.validate() {
            return Err(format!("Configuration validation failed: {}", errors.join("; ")).into());
        }

        Ok(config)
    }
}
