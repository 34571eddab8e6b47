//! Member table and the SWIM precedence rules.
//!
//! An update about a member carries an incarnation number that only the member
//! itself may raise. For the same incarnation `Dead`/`Left` beat `Suspect`,
//! which beats `Alive`. A higher incarnation wins outright, which is how a
//! member refutes a suspicion about itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::BrokerId;

/// Gossip wire format version carried in every [`NodeMeta`].
pub const PROTOCOL_VERSION: u16 = 1;

/// What a broker advertises about itself through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub broker_id: BrokerId,
    pub client_addr: String,
    pub replication_addr: String,
    pub raft_addr: String,
    pub gossip_addr: String,
    /// Whether the broker wants to be a Raft voter.
    pub voter: bool,
    pub protocol_version: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberState {
    fn rank(self) -> u8 {
        match self {
            MemberState::Alive => 0,
            MemberState::Suspect => 1,
            MemberState::Dead | MemberState::Left => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Alive => "alive",
            MemberState::Suspect => "suspect",
            MemberState::Dead => "dead",
            MemberState::Left => "left",
        }
    }

    /// Dead or departed members are not probed or gossiped to.
    pub fn is_gone(self) -> bool {
        matches!(self, MemberState::Dead | MemberState::Left)
    }
}

/// One member's state as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub meta: NodeMeta,
    pub incarnation: u64,
    pub state: MemberState,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub meta: NodeMeta,
    pub incarnation: u64,
    pub state: MemberState,
    /// When `state` last changed, on the local clock.
    pub state_changed: Instant,
}

impl Member {
    pub fn to_update(&self) -> MemberUpdate {
        MemberUpdate {
            meta: self.meta.clone(),
            incarnation: self.incarnation,
            state: self.state,
        }
    }
}

/// Observable outcome of accepting an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A member appeared, or came back after being dead or departed.
    Joined(NodeMeta),
    /// A member's metadata changed or it refuted a suspicion.
    Updated(NodeMeta),
    Suspected(BrokerId),
    Failed(BrokerId),
    Left(BrokerId),
}

/// Result of [`MemberList::apply`].
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    /// Stale or duplicate information.
    Ignored,
    /// Accepted and worth re-gossiping.
    Accepted(Option<MembershipEvent>),
    /// Someone claims the local node is suspect or dead at this incarnation.
    /// The caller must bump its incarnation and announce itself alive.
    Refute { incarnation: u64 },
}

/// All known members, including the local node.
#[derive(Debug)]
pub struct MemberList {
    local_id: BrokerId,
    members: BTreeMap<BrokerId, Member>,
}

impl MemberList {
    pub fn new(local: NodeMeta, now: Instant) -> Self {
        let local_id = local.broker_id;
        let mut members = BTreeMap::new();
        members.insert(
            local_id,
            Member {
                meta: local,
                incarnation: 0,
                state: MemberState::Alive,
                state_changed: now,
            },
        );
        Self { local_id, members }
    }

    pub fn local_id(&self) -> BrokerId {
        self.local_id
    }

    pub fn local(&self) -> Option<&Member> {
        self.members.get(&self.local_id)
    }

    pub fn get(&self, broker_id: BrokerId) -> Option<&Member> {
        self.members.get(&broker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members that are neither dead nor departed.
    pub fn live_count(&self) -> usize {
        self.members.values().filter(|m| !m.state.is_gone()).count()
    }

    /// Peers other than the local node that are worth probing.
    pub fn probe_candidates(&self) -> Vec<BrokerId> {
        self.members
            .values()
            .filter(|m| m.meta.broker_id != self.local_id && !m.state.is_gone())
            .map(|m| m.meta.broker_id)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<MemberUpdate> {
        self.members.values().map(Member::to_update).collect()
    }

    /// Apply an update under the SWIM precedence rules.
    pub fn apply(&mut self, update: MemberUpdate, now: Instant) -> Applied {
        let id = update.meta.broker_id;

        if id == self.local_id {
            return self.apply_about_self(update);
        }

        let Some(current) = self.members.get_mut(&id) else {
            let event = match update.state {
                MemberState::Alive | MemberState::Suspect => {
                    Some(MembershipEvent::Joined(update.meta.clone()))
                }
                // Learning about an already-gone node still records it so
                // older alive rumours cannot resurrect it.
                MemberState::Dead | MemberState::Left => None,
            };
            self.members.insert(
                id,
                Member {
                    meta: update.meta,
                    incarnation: update.incarnation,
                    state: update.state,
                    state_changed: now,
                },
            );
            return Applied::Accepted(event);
        };

        let newer = update.incarnation > current.incarnation;
        let same = update.incarnation == current.incarnation;
        let accept = match update.state {
            MemberState::Alive => newer,
            _ => newer || (same && update.state.rank() > current.state.rank()),
        };
        if !accept {
            return Applied::Ignored;
        }

        let previous = current.state;
        let meta_changed = current.meta != update.meta;
        current.incarnation = update.incarnation;
        current.meta = update.meta;
        if current.state != update.state {
            current.state = update.state;
            current.state_changed = now;
        }

        let event = match (previous, update.state) {
            (MemberState::Dead | MemberState::Left, MemberState::Alive | MemberState::Suspect) => {
                Some(MembershipEvent::Joined(current.meta.clone()))
            }
            (_, MemberState::Alive) if previous == MemberState::Suspect || meta_changed => {
                Some(MembershipEvent::Updated(current.meta.clone()))
            }
            (MemberState::Alive, MemberState::Suspect) => Some(MembershipEvent::Suspected(id)),
            (prev, MemberState::Dead) if prev != MemberState::Dead => {
                Some(MembershipEvent::Failed(id))
            }
            (prev, MemberState::Left) if prev != MemberState::Left => {
                Some(MembershipEvent::Left(id))
            }
            _ => None,
        };
        Applied::Accepted(event)
    }

    fn apply_about_self(&mut self, update: MemberUpdate) -> Applied {
        let Some(local) = self.members.get_mut(&self.local_id) else {
            return Applied::Ignored;
        };
        match update.state {
            // A restarted node hears about its own earlier departure.
            MemberState::Suspect | MemberState::Dead | MemberState::Left
                if local.state == MemberState::Alive
                    && update.incarnation >= local.incarnation =>
            {
                Applied::Refute {
                    incarnation: update.incarnation,
                }
            }
            _ => Applied::Ignored,
        }
    }

    /// Raise the local incarnation past `at_least` and return the update
    /// announcing it.
    pub fn refute(&mut self, at_least: u64) -> Option<MemberUpdate> {
        let local = self.members.get_mut(&self.local_id)?;
        local.incarnation = local.incarnation.max(at_least) + 1;
        Some(local.to_update())
    }

    /// Mark the local node as departed and return the announcement.
    pub fn leave(&mut self, now: Instant) -> Option<MemberUpdate> {
        let local = self.members.get_mut(&self.local_id)?;
        local.incarnation += 1;
        local.state = MemberState::Left;
        local.state_changed = now;
        Some(local.to_update())
    }

    /// Suspect a peer that failed its probe. Returns the update to spread.
    pub fn suspect(&mut self, broker_id: BrokerId, now: Instant) -> Option<(MemberUpdate, MembershipEvent)> {
        let member = self.members.get_mut(&broker_id)?;
        if member.state != MemberState::Alive || broker_id == self.local_id {
            return None;
        }
        member.state = MemberState::Suspect;
        member.state_changed = now;
        Some((member.to_update(), MembershipEvent::Suspected(broker_id)))
    }

    /// Declare dead every suspect whose suspicion window has expired.
    pub fn expire_suspects(
        &mut self,
        timeout: std::time::Duration,
        now: Instant,
    ) -> Vec<(MemberUpdate, MembershipEvent)> {
        let mut out = Vec::new();
        for member in self.members.values_mut() {
            if member.state == MemberState::Suspect
                && now.saturating_duration_since(member.state_changed) >= timeout
            {
                member.state = MemberState::Dead;
                member.state_changed = now;
                out.push((
                    member.to_update(),
                    MembershipEvent::Failed(member.meta.broker_id),
                ));
            }
        }
        out
    }

    /// Drop dead or departed members older than `reclaim`.
    pub fn reap(&mut self, reclaim: std::time::Duration, now: Instant) -> Vec<BrokerId> {
        let local_id = self.local_id;
        let expired: Vec<BrokerId> = self
            .members
            .values()
            .filter(|m| {
                m.meta.broker_id != local_id
                    && m.state.is_gone()
                    && now.saturating_duration_since(m.state_changed) >= reclaim
            })
            .map(|m| m.meta.broker_id)
            .collect();
        for id in &expired {
            self.members.remove(id);
        }
        expired
    }

    /// Member counts by state, for metrics.
    pub fn counts(&self) -> [(MemberState, usize); 4] {
        let count = |s: MemberState| self.members.values().filter(|m| m.state == s).count();
        [
            (MemberState::Alive, count(MemberState::Alive)),
            (MemberState::Suspect, count(MemberState::Suspect)),
            (MemberState::Dead, count(MemberState::Dead)),
            (MemberState::Left, count(MemberState::Left)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) fn meta(id: BrokerId) -> NodeMeta {
        NodeMeta {
            broker_id: id,
            client_addr: format!("127.0.0.1:{}", 9000 + id),
            replication_addr: String::new(),
            raft_addr: String::new(),
            gossip_addr: format!("127.0.0.1:{}", 7000 + id),
            voter: true,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn update(id: BrokerId, incarnation: u64, state: MemberState) -> MemberUpdate {
        MemberUpdate {
            meta: meta(id),
            incarnation,
            state,
        }
    }

    #[test]
    fn test_new_member_joins() {
        let now = Instant::now();
        let mut list = MemberList::new(meta(1), now);
        let applied = list.apply(update(2, 0, MemberState::Alive), now);
        assert_eq!(applied, Applied::Accepted(Some(MembershipEvent::Joined(meta(2)))));
        assert_eq!(list.probe_candidates(), vec![2]);

        assert_eq!(list.apply(update(2, 0, MemberState::Alive), now), Applied::Ignored);
    }

    #[test]
    fn test_suspect_overrides_alive_at_same_incarnation() {
        let now = Instant::now();
        let mut list = MemberList::new(meta(1), now);
        list.apply(update(2, 3, MemberState::Alive), now);

        assert_eq!(
            list.apply(update(2, 3, MemberState::Suspect), now),
            Applied::Accepted(Some(MembershipEvent::Suspected(2)))
        );
        // Alive at the same incarnation cannot clear the suspicion.
        assert_eq!(list.apply(update(2, 3, MemberState::Alive), now), Applied::Ignored);
        // A refutation with a higher incarnation does.
        assert_eq!(
            list.apply(update(2, 4, MemberState::Alive), now),
            Applied::Accepted(Some(MembershipEvent::Updated(meta(2))))
        );
    }

    #[test]
    fn test_stale_suspect_ignored() {
        let now = Instant::now();
        let mut list = MemberList::new(meta(1), now);
        list.apply(update(2, 5, MemberState::Alive), now);
        assert_eq!(list.apply(update(2, 4, MemberState::Suspect), now), Applied::Ignored);
    }

    #[test]
    fn test_dead_member_revives_only_with_newer_incarnation() {
        let now = Instant::now();
        let mut list = MemberList::new(meta(1), now);
        list.apply(update(2, 1, MemberState::Alive), now);
        assert_eq!(
            list.apply(update(2, 1, MemberState::Dead), now),
            Applied::Accepted(Some(MembershipEvent::Failed(2)))
        );
        assert_eq!(list.apply(update(2, 1, MemberState::Alive), now), Applied::Ignored);
        assert_eq!(
            list.apply(update(2, 2, MemberState::Alive), now),
            Applied::Accepted(Some(MembershipEvent::Joined(meta(2))))
        );
    }

    #[test]
    fn test_rumour_about_self_triggers_refutation() {
        let now = Instant::now();
        let mut list = MemberList::new(meta(1), now);
        assert_eq!(
            list.apply(update(1, 0, MemberState::Suspect), now),
            Applied::Refute { incarnation: 0 }
        );
        let announce = list.refute(0).unwrap();
        assert_eq!(announce.incarnation, 1);
        assert_eq!(announce.state, MemberState::Alive);

        // An older rumour no longer needs refuting.
        assert_eq!(list.apply(update(1, 0, MemberState::Dead), now), Applied::Ignored);

        // A departure recorded by a previous run of this node.
        assert_eq!(
            list.apply(update(1, 3, MemberState::Left), now),
            Applied::Refute { incarnation: 3 }
        );
    }

    #[test]
    fn test_suspicion_expires_then_reaped() {
        let t0 = Instant::now();
        let mut list = MemberList::new(meta(1), t0);
        list.apply(update(2, 0, MemberState::Alive), t0);
        let (upd, event) = list.suspect(2, t0).unwrap();
        assert_eq!(upd.state, MemberState::Suspect);
        assert_eq!(event, MembershipEvent::Suspected(2));

        assert!(list.expire_suspects(Duration::from_secs(5), t0 + Duration::from_secs(1)).is_empty());
        let expired = list.expire_suspects(Duration::from_secs(5), t0 + Duration::from_secs(6));
        assert_eq!(expired[0].1, MembershipEvent::Failed(2));
        assert!(list.probe_candidates().is_empty());

        assert!(list.reap(Duration::from_secs(60), t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(list.reap(Duration::from_secs(60), t0 + Duration::from_secs(70)), vec![2]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_leave_announcement() {
        let now = Instant::now();
        let mut list = MemberList::new(meta(1), now);
        list.apply(update(2, 0, MemberState::Alive), now);
        let left = list.leave(now).unwrap();
        assert_eq!(left.state, MemberState::Left);
        assert_eq!(left.incarnation, 1);

        let mut other = MemberList::new(meta(2), now);
        other.apply(update(1, 0, MemberState::Alive), now);
        assert_eq!(
            other.apply(left, now),
            Applied::Accepted(Some(MembershipEvent::Left(1)))
        );
    }
}
