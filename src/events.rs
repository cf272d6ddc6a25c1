//! Drainable event feed for state changes observable by embedders.

use crate::roles::Role;
use log::info;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A vote was granted to `candidate` in `term` (self-votes included).
    VoteCast { term: u64, candidate: String },
    LeaderChange { term: u64, leader: Option<String> },
    RoleChange { term: u64, role: Role },
    MembershipChange { members: BTreeSet<String> },
}

impl ReplicaEvent {
    fn label(&self) -> &'static str {
        match self {
            ReplicaEvent::VoteCast { .. } => "vote_cast",
            ReplicaEvent::LeaderChange { .. } => "leader_change",
            ReplicaEvent::RoleChange { .. } => "role_change",
            ReplicaEvent::MembershipChange { .. } => "membership_change",
        }
    }
}

/// Events accumulate until drained; the engine never blocks on a consumer.
#[derive(Debug, Default)]
pub struct EventBus {
    events: VecDeque<ReplicaEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, event: ReplicaEvent) {
        info!("event=replica_{} detail={:?}", event.label(), event);
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<ReplicaEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_the_bus_in_order() {
        let mut bus = EventBus::new();
        bus.publish(ReplicaEvent::VoteCast {
            term: 3,
            candidate: "a".into(),
        });
        bus.publish(ReplicaEvent::LeaderChange {
            term: 3,
            leader: Some("a".into()),
        });
        assert_eq!(bus.len(), 2);
        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], ReplicaEvent::VoteCast { term: 3, .. }));
        assert!(bus.is_empty());
    }
}
