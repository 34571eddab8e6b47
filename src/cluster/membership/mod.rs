//! SWIM-style cluster membership over UDP.
//!
//! Each node probes one peer per `probe_interval`, round-robin over a shuffled
//! list. A peer that misses its direct ack is probed indirectly through
//! `indirect_checks` other members; a peer that misses both is suspected and,
//! unless it refutes within the suspicion window, declared dead. Member
//! updates ride on every ping and ack, and a periodic push-pull sync with one
//! random member repairs anything the piggybacking missed.
//!
//! Membership is advisory. Partition leadership never changes because of a
//! gossip event alone; the controller only uses `Failed` as a reason to look
//! at committed heartbeats early.

mod member;
mod message;

pub use member::{
    Applied, Member, MemberList, MemberState, MemberUpdate, MembershipEvent, NodeMeta,
    PROTOCOL_VERSION,
};
pub use message::{BroadcastQueue, GossipMessage};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::background_tasks::BackgroundTaskRegistry;
use super::error::{BrokerError, BrokerResult};
use super::metrics::{GOSSIP_MEMBERS, GOSSIP_PROBE_FAILURES, record_gossip_message};
use crate::constants::{
    DEFAULT_DEAD_NODE_RECLAIM_SECS, DEFAULT_GOSSIP_FANOUT, DEFAULT_GOSSIP_INTERVAL_MS,
    DEFAULT_INDIRECT_CHECKS, DEFAULT_MAX_PIGGYBACK, DEFAULT_PROBE_INTERVAL_MS,
    DEFAULT_PROBE_TIMEOUT_MS, DEFAULT_PUSH_PULL_INTERVAL_SECS, DEFAULT_RETRANSMIT_MULT,
    DEFAULT_SUSPICION_MULT,
};
use crate::types::BrokerId;
use message::log2_ceil;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const RECV_BUFFER_BYTES: usize = 65_536;

/// Gossip timing and fan-out.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub suspicion_mult: u32,
    pub retransmit_mult: u32,
    pub gossip_interval: Duration,
    pub fanout: usize,
    pub push_pull_interval: Duration,
    pub max_piggyback: usize,
    pub dead_node_reclaim: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            indirect_checks: DEFAULT_INDIRECT_CHECKS,
            suspicion_mult: DEFAULT_SUSPICION_MULT,
            retransmit_mult: DEFAULT_RETRANSMIT_MULT,
            gossip_interval: Duration::from_millis(DEFAULT_GOSSIP_INTERVAL_MS),
            fanout: DEFAULT_GOSSIP_FANOUT,
            push_pull_interval: Duration::from_secs(DEFAULT_PUSH_PULL_INTERVAL_SECS),
            max_piggyback: DEFAULT_MAX_PIGGYBACK,
            dead_node_reclaim: Duration::from_secs(DEFAULT_DEAD_NODE_RECLAIM_SECS),
        }
    }
}

impl GossipConfig {
    /// Fast timings for tests on loopback.
    pub fn for_testing() -> Self {
        Self {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(50),
            indirect_checks: 2,
            suspicion_mult: 3,
            retransmit_mult: 3,
            gossip_interval: Duration::from_millis(20),
            fanout: 3,
            push_pull_interval: Duration::from_millis(500),
            max_piggyback: 8,
            dead_node_reclaim: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.probe_timeout >= self.probe_interval {
            errors.push(format!(
                "gossip probe_timeout ({:?}) must be less than probe_interval ({:?})",
                self.probe_timeout, self.probe_interval
            ));
        }
        if self.gossip_interval.is_zero() {
            errors.push("gossip_interval must be non-zero".to_string());
        }
        if self.push_pull_interval.is_zero() {
            errors.push("push_pull_interval must be non-zero".to_string());
        }
        if self.suspicion_mult == 0 {
            errors.push("suspicion_mult must be at least 1".to_string());
        }
        if self.retransmit_mult == 0 {
            errors.push("retransmit_mult must be at least 1".to_string());
        }
        if self.fanout == 0 {
            errors.push("gossip fanout must be at least 1".to_string());
        }
        if self.max_piggyback == 0 {
            errors.push("max_piggyback must be at least 1".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// `suspicion_mult * max(1, ceil(log2(N + 1))) * probe_interval`.
    pub fn suspicion_timeout(&self, cluster_size: usize) -> Duration {
        self.probe_interval * self.suspicion_mult * log2_ceil(cluster_size + 1)
    }
}

struct State {
    members: MemberList,
    broadcasts: BroadcastQueue,
    probe_order: Vec<BrokerId>,
    probe_index: usize,
}

/// A running gossip node.
///
/// Background loops hold an `Arc` to the node, so [`Membership::shutdown`]
/// must be called to stop them.
pub struct Membership {
    config: GossipConfig,
    local_id: BrokerId,
    socket: UdpSocket,
    state: Mutex<State>,
    next_seq: AtomicU64,
    pending_acks: DashMap<u64, oneshot::Sender<()>>,
    events: broadcast::Sender<MembershipEvent>,
    tasks: BackgroundTaskRegistry,
}

impl Membership {
    /// Start gossiping on `socket`. `meta.gossip_addr` must be the address
    /// peers can reach `socket` at.
    pub fn start(config: GossipConfig, meta: NodeMeta, socket: UdpSocket) -> Arc<Self> {
        let local_id = meta.broker_id;
        let now = Instant::now();
        let members = MemberList::new(meta, now);
        let mut broadcasts = BroadcastQueue::new(config.retransmit_mult);
        if let Some(local) = members.local() {
            broadcasts.push(local.to_update(), 1);
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let membership = Arc::new(Self {
            config,
            local_id,
            socket,
            state: Mutex::new(State {
                members,
                broadcasts,
                probe_order: Vec::new(),
                probe_index: 0,
            }),
            next_seq: AtomicU64::new(1),
            pending_acks: DashMap::new(),
            events,
            tasks: BackgroundTaskRegistry::new(),
        });

        let this = Arc::clone(&membership);
        membership.tasks.spawn("gossip-recv", async move {
            this.receive_loop().await;
        });

        let this = Arc::clone(&membership);
        membership
            .tasks
            .spawn_periodic("gossip-probe", membership.config.probe_interval, move || {
                let this = Arc::clone(&this);
                async move { this.probe_round().await }
            });

        let this = Arc::clone(&membership);
        membership
            .tasks
            .spawn_periodic("gossip-spread", membership.config.gossip_interval, move || {
                let this = Arc::clone(&this);
                async move { this.gossip_round().await }
            });

        let this = Arc::clone(&membership);
        membership.tasks.spawn_periodic(
            "gossip-push-pull",
            membership.config.push_pull_interval,
            move || {
                let this = Arc::clone(&this);
                async move { this.push_pull_round().await }
            },
        );

        info!(
            broker_id = local_id,
            addr = ?membership.socket.local_addr().ok(),
            "Gossip membership started"
        );
        membership
    }

    pub fn local_id(&self) -> BrokerId {
        self.local_id
    }

    pub fn local(&self) -> Option<NodeMeta> {
        self.state.lock().members.local().map(|m| m.meta.clone())
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Every known member, the local node included.
    pub fn members(&self) -> Vec<Member> {
        self.state.lock().members.iter().cloned().collect()
    }

    /// Members currently believed alive, the local node included.
    pub fn alive_members(&self) -> Vec<NodeMeta> {
        self.state
            .lock()
            .members
            .iter()
            .filter(|m| m.state == MemberState::Alive)
            .map(|m| m.meta.clone())
            .collect()
    }

    pub fn member_state(&self, broker_id: BrokerId) -> Option<MemberState> {
        self.state.lock().members.get(broker_id).map(|m| m.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Push-pull with each seed. Returns how many seeds answered; fails only
    /// if there were seeds and none of them did.
    pub async fn join(&self, seeds: &[String]) -> BrokerResult<usize> {
        let own_addr = self.state.lock().members.local().map(|m| m.meta.gossip_addr.clone());
        let seeds: Vec<&String> = seeds
            .iter()
            .filter(|s| Some(s.as_str()) != own_addr.as_deref())
            .collect();
        if seeds.is_empty() {
            return Ok(0);
        }

        let states = self.state.lock().members.snapshot();
        let waits = seeds.iter().map(|seed| {
            let (seq, rx) = self.register_ack();
            let msg = GossipMessage::Sync {
                seq,
                from: self.local_id,
                states: states.clone(),
                is_reply: false,
            };
            async move {
                self.send(&msg, seed.as_str()).await;
                let answered = tokio::time::timeout(self.config.probe_interval, rx).await;
                self.pending_acks.remove(&seq);
                matches!(answered, Ok(Ok(())))
            }
        });
        let answered = futures::future::join_all(waits)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        if answered == 0 {
            return Err(BrokerError::Rpc(format!(
                "no gossip seed answered out of {}",
                seeds.len()
            )));
        }
        info!(answered, seeds = seeds.len(), "Joined gossip cluster");
        Ok(answered)
    }

    /// Announce departure to every live member.
    pub async fn leave(&self) {
        let (update, targets) = {
            let mut state = self.state.lock();
            let Some(update) = state.members.leave(Instant::now()) else {
                return;
            };
            let size = state.members.len();
            state.broadcasts.push(update.clone(), size);
            let targets: Vec<String> = state
                .members
                .iter()
                .filter(|m| m.meta.broker_id != self.local_id && !m.state.is_gone())
                .map(|m| m.meta.gossip_addr.clone())
                .collect();
            (update, targets)
        };

        let msg = GossipMessage::Gossip {
            from: self.local_id,
            updates: vec![update],
        };
        for addr in &targets {
            self.send(&msg, addr).await;
        }
        info!(notified = targets.len(), "Left gossip cluster");
    }

    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown(timeout).await;
        self.pending_acks.clear();
        debug!(broker_id = self.local_id, "Gossip membership stopped");
    }

    fn register_ack(&self) -> (u64, oneshot::Receiver<()>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_acks.insert(seq, tx);
        (seq, rx)
    }

    fn take_piggyback(&self) -> Vec<MemberUpdate> {
        self.state.lock().broadcasts.take(self.config.max_piggyback)
    }

    async fn send(&self, msg: &GossipMessage, addr: &str) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "Dropping gossip message that cannot be encoded");
                return;
            }
        };
        match self.socket.send_to(&bytes, addr).await {
            Ok(_) => record_gossip_message(msg.kind(), "out"),
            Err(e) => debug!(kind = msg.kind(), addr, error = %e, "Gossip send failed"),
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            let (len, from_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "Gossip receive failed");
                    continue;
                }
            };
            let msg = match GossipMessage::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(from = %from_addr, error = %e, "Dropping undecodable gossip packet");
                    continue;
                }
            };
            record_gossip_message(msg.kind(), "in");
            if msg.from() == self.local_id {
                continue;
            }
            self.handle(msg, from_addr.to_string()).await;
        }
    }

    async fn handle(self: &Arc<Self>, msg: GossipMessage, from_addr: String) {
        match msg {
            GossipMessage::Ping { seq, updates, .. } => {
                self.merge(updates);
                let ack = GossipMessage::Ack {
                    seq,
                    from: self.local_id,
                    updates: self.take_piggyback(),
                };
                self.send(&ack, &from_addr).await;
            }
            GossipMessage::Ack { seq, updates, .. } => {
                self.merge(updates);
                if let Some((_, tx)) = self.pending_acks.remove(&seq) {
                    let _ = tx.send(());
                }
            }
            GossipMessage::PingReq {
                seq,
                target,
                target_addr,
                updates,
                ..
            } => {
                self.merge(updates);
                let this = Arc::clone(self);
                self.tasks.spawn_transient("gossip-ping-req", async move {
                    if this.ping(&target_addr).await {
                        let relay = GossipMessage::Ack {
                            seq,
                            from: this.local_id,
                            updates: this.take_piggyback(),
                        };
                        this.send(&relay, &from_addr).await;
                    } else {
                        debug!(target, "Indirect probe got no ack");
                    }
                });
            }
            GossipMessage::Gossip { updates, .. } => self.merge(updates),
            GossipMessage::Sync {
                seq,
                states,
                is_reply,
                ..
            } => {
                self.merge(states);
                if is_reply {
                    if let Some((_, tx)) = self.pending_acks.remove(&seq) {
                        let _ = tx.send(());
                    }
                } else {
                    let reply = GossipMessage::Sync {
                        seq,
                        from: self.local_id,
                        states: self.state.lock().members.snapshot(),
                        is_reply: true,
                    };
                    self.send(&reply, &from_addr).await;
                }
            }
        }
    }

    /// Apply received updates, queue accepted ones for re-gossip and publish
    /// resulting events.
    fn merge(&self, updates: Vec<MemberUpdate>) {
        if updates.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for update in updates {
                match state.members.apply(update.clone(), now) {
                    Applied::Ignored => {}
                    Applied::Accepted(event) => {
                        let size = state.members.len();
                        state.broadcasts.push(update, size);
                        events.extend(event);
                    }
                    Applied::Refute { incarnation } => {
                        if let Some(alive) = state.members.refute(incarnation) {
                            debug!(incarnation = alive.incarnation, "Refuting suspicion about self");
                            let size = state.members.len();
                            state.broadcasts.push(alive, size);
                        }
                    }
                }
            }
            update_member_gauges(&state.members);
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<MembershipEvent>) {
        for event in events {
            match &event {
                MembershipEvent::Joined(meta) => {
                    info!(broker_id = meta.broker_id, addr = %meta.gossip_addr, "Member joined")
                }
                MembershipEvent::Updated(meta) => debug!(broker_id = meta.broker_id, "Member updated"),
                MembershipEvent::Suspected(id) => info!(broker_id = id, "Member suspected"),
                MembershipEvent::Failed(id) => warn!(broker_id = id, "Member failed"),
                MembershipEvent::Left(id) => info!(broker_id = id, "Member left"),
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Direct ping. True if the target acked within `probe_timeout`.
    async fn ping(&self, addr: &str) -> bool {
        let (seq, rx) = self.register_ack();
        let msg = GossipMessage::Ping {
            seq,
            from: self.local_id,
            updates: self.take_piggyback(),
        };
        self.send(&msg, addr).await;
        let acked = tokio::time::timeout(self.config.probe_timeout, rx).await;
        self.pending_acks.remove(&seq);
        matches!(acked, Ok(Ok(())))
    }

    fn next_probe_target(&self) -> Option<(BrokerId, String)> {
        let mut state = self.state.lock();
        for _ in 0..2 {
            while state.probe_index < state.probe_order.len() {
                let id = state.probe_order[state.probe_index];
                state.probe_index += 1;
                if let Some(member) = state.members.get(id)
                    && !member.state.is_gone()
                {
                    return Some((id, member.meta.gossip_addr.clone()));
                }
            }
            let mut order = state.members.probe_candidates();
            fastrand::shuffle(&mut order);
            state.probe_order = order;
            state.probe_index = 0;
        }
        None
    }

    async fn probe_round(self: &Arc<Self>) {
        self.expire_members();

        let Some((target, addr)) = self.next_probe_target() else {
            return;
        };
        if self.ping(&addr).await {
            return;
        }

        let helpers: Vec<String> = {
            let state = self.state.lock();
            let mut candidates: Vec<String> = state
                .members
                .iter()
                .filter(|m| {
                    m.meta.broker_id != self.local_id
                        && m.meta.broker_id != target
                        && m.state == MemberState::Alive
                })
                .map(|m| m.meta.gossip_addr.clone())
                .collect();
            fastrand::shuffle(&mut candidates);
            candidates.truncate(self.config.indirect_checks);
            candidates
        };

        if !helpers.is_empty() {
            let (seq, rx) = self.register_ack();
            let updates = self.take_piggyback();
            for helper in &helpers {
                let req = GossipMessage::PingReq {
                    seq,
                    from: self.local_id,
                    target,
                    target_addr: addr.clone(),
                    updates: updates.clone(),
                };
                self.send(&req, helper).await;
            }
            // Helpers need a full probe timeout of their own before relaying.
            let acked = tokio::time::timeout(self.config.probe_timeout * 2, rx).await;
            self.pending_acks.remove(&seq);
            if matches!(acked, Ok(Ok(()))) {
                return;
            }
        }

        GOSSIP_PROBE_FAILURES.inc();
        let suspected = {
            let mut state = self.state.lock();
            let suspected = state.members.suspect(target, Instant::now());
            if let Some((update, _)) = &suspected {
                let size = state.members.len();
                state.broadcasts.push(update.clone(), size);
            }
            update_member_gauges(&state.members);
            suspected
        };
        if let Some((_, event)) = suspected {
            self.publish(vec![event]);
        }
    }

    fn expire_members(&self) {
        let now = Instant::now();
        let events = {
            let mut state = self.state.lock();
            let timeout = self.config.suspicion_timeout(state.members.live_count());
            let expired = state.members.expire_suspects(timeout, now);
            let size = state.members.len();
            let mut events = Vec::with_capacity(expired.len());
            for (update, event) in expired {
                state.broadcasts.push(update, size);
                events.push(event);
            }
            for id in state.members.reap(self.config.dead_node_reclaim, now) {
                debug!(broker_id = id, "Reaped departed member");
            }
            update_member_gauges(&state.members);
            events
        };
        self.publish(events);
    }

    async fn gossip_round(&self) {
        let targets: Vec<String> = {
            let state = self.state.lock();
            if state.broadcasts.is_empty() {
                return;
            }
            let mut targets: Vec<String> = state
                .members
                .iter()
                .filter(|m| m.meta.broker_id != self.local_id && !m.state.is_gone())
                .map(|m| m.meta.gossip_addr.clone())
                .collect();
            fastrand::shuffle(&mut targets);
            targets.truncate(self.config.fanout);
            targets
        };

        for addr in targets {
            let updates = self.take_piggyback();
            if updates.is_empty() {
                break;
            }
            let msg = GossipMessage::Gossip {
                from: self.local_id,
                updates,
            };
            self.send(&msg, &addr).await;
        }
    }

    async fn push_pull_round(&self) {
        let (addr, states) = {
            let state = self.state.lock();
            let candidates = state.members.probe_candidates();
            let Some(member) = fastrand::choice(&candidates).and_then(|id| state.members.get(*id))
            else {
                return;
            };
            (member.meta.gossip_addr.clone(), state.members.snapshot())
        };
        // The reply is merged by the receive loop; nobody waits on it.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let msg = GossipMessage::Sync {
            seq,
            from: self.local_id,
            states,
            is_reply: false,
        };
        self.send(&msg, &addr).await;
    }
}

fn update_member_gauges(members: &MemberList) {
    for (state, count) in members.counts() {
        GOSSIP_MEMBERS
            .with_label_values(&[state.as_str()])
            .set(count as i64);
    }
}
