//! Broker failure detection from committed heartbeats.
//!
//! Brokers commit a heartbeat through Raft every heartbeat interval, which
//! bumps their `heartbeat_seq` in the metadata. The controller feeds every
//! snapshot it sees into this detector. A broker whose sequence has not
//! advanced for a full session timeout, measured on the controller's own
//! clock, is declared failed. No wall-clock comparison across brokers is
//! involved.
//!
//! 1. **Healthy** - sequence advanced recently
//! 2. **Suspected** - no progress for half the session timeout
//! 3. **Failed** - no progress for the whole session timeout

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::BrokerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerHealthState {
    Healthy,
    Suspected,
    Failed,
}

impl std::fmt::Display for BrokerHealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerHealthState::Healthy => write!(f, "healthy"),
            BrokerHealthState::Suspected => write!(f, "suspected"),
            BrokerHealthState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug)]
struct BrokerHealth {
    heartbeat_seq: u64,
    last_progress: Instant,
    state: BrokerHealthState,
}

/// Emitted when a broker's health state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStateChange {
    pub broker_id: BrokerId,
    pub previous_state: BrokerHealthState,
    pub new_state: BrokerHealthState,
    pub time_since_progress: Duration,
}

pub struct FailureDetector {
    session_timeout: Duration,
    brokers: DashMap<BrokerId, BrokerHealth>,
    failures_detected: AtomicU64,
}

impl FailureDetector {
    pub fn new(session_timeout: Duration) -> Self {
        info!(
            session_timeout_ms = session_timeout.as_millis() as u64,
            "Creating failure detector"
        );
        Self {
            session_timeout,
            brokers: DashMap::new(),
            failures_detected: AtomicU64::new(0),
        }
    }

    /// Record the committed heartbeat sequence of a broker.
    ///
    /// A broker seen for the first time starts with a full session of grace.
    pub fn observe(&self, broker_id: BrokerId, heartbeat_seq: u64, now: Instant) {
        self.brokers
            .entry(broker_id)
            .and_modify(|health| {
                if heartbeat_seq != health.heartbeat_seq {
                    health.heartbeat_seq = heartbeat_seq;
                    health.last_progress = now;
                    if health.state != BrokerHealthState::Healthy {
                        debug!(broker_id, previous = %health.state, "Broker heartbeats resumed");
                    }
                    health.state = BrokerHealthState::Healthy;
                }
            })
            .or_insert_with(|| BrokerHealth {
                heartbeat_seq,
                last_progress: now,
                state: BrokerHealthState::Healthy,
            });
    }

    /// Stop tracking a broker (resigned or removed).
    pub fn forget(&self, broker_id: BrokerId) {
        self.brokers.remove(&broker_id);
    }

    /// Forget all history. Called when this node becomes controller so that
    /// brokers are not judged on progress observed in an earlier term.
    pub fn reset(&self) {
        self.brokers.clear();
    }

    /// Re-evaluate every tracked broker and return the state changes.
    pub fn check(&self, now: Instant) -> Vec<HealthStateChange> {
        let mut changes = Vec::new();
        for mut entry in self.brokers.iter_mut() {
            let broker_id = *entry.key();
            let health = entry.value_mut();
            let elapsed = now.saturating_duration_since(health.last_progress);

            let new_state = if elapsed >= self.session_timeout {
                BrokerHealthState::Failed
            } else if elapsed >= self.session_timeout / 2 {
                BrokerHealthState::Suspected
            } else {
                BrokerHealthState::Healthy
            };
            if new_state == health.state {
                continue;
            }

            match new_state {
                BrokerHealthState::Failed => {
                    warn!(
                        broker_id,
                        since_progress_ms = elapsed.as_millis() as u64,
                        "Broker declared failed"
                    );
                    self.failures_detected.fetch_add(1, Ordering::Relaxed);
                }
                BrokerHealthState::Suspected => {
                    info!(
                        broker_id,
                        since_progress_ms = elapsed.as_millis() as u64,
                        "Broker suspected"
                    );
                }
                BrokerHealthState::Healthy => debug!(broker_id, "Broker healthy"),
            }

            changes.push(HealthStateChange {
                broker_id,
                previous_state: health.state,
                new_state,
                time_since_progress: elapsed,
            });
            health.state = new_state;
        }
        changes
    }

    pub fn state(&self, broker_id: BrokerId) -> Option<BrokerHealthState> {
        self.brokers.get(&broker_id).map(|h| h.state)
    }

    /// Whether the broker is tracked and not failed.
    pub fn is_live(&self, broker_id: BrokerId) -> bool {
        self.state(broker_id)
            .is_some_and(|s| s != BrokerHealthState::Failed)
    }

    pub fn brokers_in_state(&self, state: BrokerHealthState) -> Vec<BrokerId> {
        let mut ids: Vec<_> = self
            .brokers
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn total_failures_detected(&self) -> u64 {
        self.failures_detected.load(Ordering::Relaxed)
    }
}
