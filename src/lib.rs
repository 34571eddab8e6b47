//! # Ledgerline
//! A replicated, partitioned commit-log broker.
//!
//! Producers append opaque records to named, partitioned logs; consumers read
//! them back by offset. A cluster of brokers replicates each partition and
//! agrees on who leads it through a Raft-replicated metadata log, discovering
//! each other through SWIM-style gossip.
//!
//! # Layers
//!
//! - [`log`]: the on-disk, segmented, offset-addressed log of one partition
//!   ([`SegmentStore`](log::SegmentStore) behind the [`CommitLog`](log::CommitLog) trait).
//! - [`cluster`]: everything above a single log. Gossip membership, the Raft
//!   metadata group, replication between brokers, and the [`Broker`](cluster::Broker)
//!   that ties them together.
//!
//! The client wire protocol is not part of this crate. A server calls
//! [`Broker::produce`](cluster::Broker::produce) and
//! [`Broker::fetch`](cluster::Broker::fetch) and redirects on
//! [`BrokerError::NotLeaderForPartition`](cluster::BrokerError::NotLeaderForPartition).
//!
//! ```rust,no_run
//! use ledgerline::cluster::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::from_env()?;
//!     let broker = Broker::start(config).await?;
//!
//!     broker.create_topic("orders", 3, 1).await?;
//!     let offset = broker.produce("orders", 0, b"hello".to_vec()).await?;
//!     let records = broker.fetch("orders", 0, offset, 1024).await?;
//!     assert_eq!(&records[0].value[..], b"hello");
//!
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod error;
pub mod log;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for embedding a broker.
    pub use crate::cluster::{AckPolicy, Broker, BrokerConfig, BrokerError, BrokerResult};
    pub use crate::error::{LogError, LogResult};
    pub use crate::log::{CommitLog, SegmentConfig, SegmentStore};
    pub use crate::types::{BrokerId, LeaderEpoch, Offset, PartitionIndex, Record, TopicPartition};

    pub use bytes;
}
