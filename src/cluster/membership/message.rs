//! Gossip datagrams and the piggyback queue.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::member::MemberUpdate;
use crate::constants::MAX_GOSSIP_PACKET_BYTES;
use crate::types::BrokerId;

/// One UDP datagram. Every variant except `Sync` carries piggybacked updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        seq: u64,
        from: BrokerId,
        updates: Vec<MemberUpdate>,
    },
    Ack {
        seq: u64,
        from: BrokerId,
        updates: Vec<MemberUpdate>,
    },
    /// Ask the receiver to ping `target` and relay its ack under `seq`.
    PingReq {
        seq: u64,
        from: BrokerId,
        target: BrokerId,
        target_addr: String,
        updates: Vec<MemberUpdate>,
    },
    Gossip {
        from: BrokerId,
        updates: Vec<MemberUpdate>,
    },
    /// Full state exchange. A sync that is not a reply is answered with the
    /// receiver's own state under the same `seq`.
    Sync {
        seq: u64,
        from: BrokerId,
        states: Vec<MemberUpdate>,
        is_reply: bool,
    },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Ping { .. } => "ping",
            GossipMessage::Ack { .. } => "ack",
            GossipMessage::PingReq { .. } => "ping_req",
            GossipMessage::Gossip { .. } => "gossip",
            GossipMessage::Sync { .. } => "sync",
        }
    }

    pub fn from(&self) -> BrokerId {
        match self {
            GossipMessage::Ping { from, .. }
            | GossipMessage::Ack { from, .. }
            | GossipMessage::PingReq { from, .. }
            | GossipMessage::Gossip { from, .. }
            | GossipMessage::Sync { from, .. } => *from,
        }
    }

    /// Consume the message and return every member update it carries.
    pub fn into_updates(self) -> Vec<MemberUpdate> {
        match self {
            GossipMessage::Ping { updates, .. }
            | GossipMessage::Ack { updates, .. }
            | GossipMessage::PingReq { updates, .. }
            | GossipMessage::Gossip { updates, .. } => updates,
            GossipMessage::Sync { states, .. } => states,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_GOSSIP_PACKET_BYTES {
            return Err(Box::new(bincode::ErrorKind::SizeLimit));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

struct QueuedUpdate {
    update: MemberUpdate,
    transmits_left: u32,
}

/// Updates waiting to be piggybacked, at most one per member.
///
/// A newer update about a member replaces the queued one. Each update is sent
/// `retransmit_mult * ceil(log2(N + 1))` times and then dropped.
pub struct BroadcastQueue {
    retransmit_mult: u32,
    queue: VecDeque<QueuedUpdate>,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            retransmit_mult,
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `update`, replacing anything queued about the same member.
    pub fn push(&mut self, update: MemberUpdate, cluster_size: usize) {
        let broker_id = update.meta.broker_id;
        self.queue.retain(|q| q.update.meta.broker_id != broker_id);
        self.queue.push_front(QueuedUpdate {
            update,
            transmits_left: self.retransmit_mult * log2_ceil(cluster_size + 1),
        });
    }

    /// Take up to `max` updates for one outgoing message, newest first.
    pub fn take(&mut self, max: usize) -> Vec<MemberUpdate> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        for queued in self.queue.iter_mut().take(max) {
            out.push(queued.update.clone());
            queued.transmits_left = queued.transmits_left.saturating_sub(1);
        }
        self.queue.retain(|q| q.transmits_left > 0);
        out
    }
}

/// `ceil(log2(n))`, at least 1.
pub(crate) fn log2_ceil(n: usize) -> u32 {
    if n <= 2 {
        return 1;
    }
    usize::BITS - (n - 1).leading_zeros()
}
