//! Local view of cluster membership. Mutated only by applied configuration
//! entries and installed snapshots.

use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct ClusterView {
    local: String,
    remotes: BTreeSet<String>,
    leader: Option<String>,
}

impl ClusterView {
    pub fn new(local: impl Into<String>, remotes: impl IntoIterator<Item = String>) -> Self {
        let local = local.into();
        let remotes = remotes
            .into_iter()
            .filter(|member| *member != local)
            .collect();
        Self {
            local,
            remotes,
            leader: None,
        }
    }

    pub fn local_member(&self) -> &str {
        &self.local
    }

    pub fn remote_members(&self) -> &BTreeSet<String> {
        &self.remotes
    }

    /// Full member set, local included.
    pub fn members(&self) -> BTreeSet<String> {
        let mut members = self.remotes.clone();
        members.insert(self.local.clone());
        members
    }

    pub fn contains(&self, member: &str) -> bool {
        member == self.local || self.remotes.contains(member)
    }

    /// Replaces the remote set; the local member is filtered out if present.
    pub fn set_remote_members(&mut self, members: impl IntoIterator<Item = String>) {
        self.remotes = members
            .into_iter()
            .filter(|member| *member != self.local)
            .collect();
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn set_leader(&mut self, leader: Option<String>) {
        self.leader = leader;
    }

    /// Strict majority of the configured membership.
    pub fn quorum(&self) -> usize {
        (self.remotes.len() + 1) / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_include_local_and_quorum_is_majority() {
        let view = ClusterView::new("a", ["b".to_string(), "c".to_string()]);
        assert!(view.contains("a"));
        assert!(view.contains("c"));
        assert!(!view.contains("d"));
        assert_eq!(view.members().len(), 3);
        assert_eq!(view.quorum(), 2);

        let single = ClusterView::new("a", []);
        assert_eq!(single.quorum(), 1);
    }

    #[test]
    fn set_remote_members_filters_local() {
        let mut view = ClusterView::new("a", ["b".to_string()]);
        view.set_remote_members(["a".to_string(), "c".to_string(), "d".to_string()]);
        assert_eq!(view.remote_members().len(), 2);
        assert!(!view.remote_members().contains("a"));
    }
}
