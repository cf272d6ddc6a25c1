//! Per-follower replication cursors for the leader: where to send next and
//! how far each follower is known to match. Match indices only move forward.

use log::{info, warn};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerCursor {
    pub next_index: u64,
    pub match_index: u64,
}

#[derive(Debug, Default)]
pub struct ReplicationCursors {
    cursors: HashMap<String, FollowerCursor>,
}

impl ReplicationCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-seeds the cursor set at leader assumption.
    pub fn reset(&mut self, members: impl IntoIterator<Item = String>, next_index: u64) {
        self.cursors = members
            .into_iter()
            .map(|member| {
                (
                    member,
                    FollowerCursor {
                        next_index: next_index.max(1),
                        match_index: 0,
                    },
                )
            })
            .collect();
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn cursor(&self, member: &str) -> Option<FollowerCursor> {
        self.cursors.get(member).copied()
    }

    pub fn members(&self) -> impl Iterator<Item = &String> {
        self.cursors.keys()
    }

    /// Records an accepted append. The follower reported its whole-log last
    /// index; it is clamped to the leader's, since a follower may retain a
    /// longer non-conflicting tail. Regressions are ignored.
    pub fn record_success(&mut self, member: &str, follower_last: u64, leader_last: u64) -> u64 {
        let Some(cursor) = self.cursors.get_mut(member) else {
            warn!("event=replica_cursor_unknown member={}", member);
            return 0;
        };
        let matched = follower_last.min(leader_last);
        if matched < cursor.match_index {
            warn!(
                "event=replica_cursor_regression member={} current={} attempted={}",
                member, cursor.match_index, matched
            );
            return cursor.match_index;
        }
        cursor.match_index = matched;
        cursor.next_index = matched + 1;
        cursor.match_index
    }

    /// Records a rejected append: back the cursor off by one, bounded below
    /// by the follower's reported log end and by what already matched.
    pub fn record_conflict(&mut self, member: &str, follower_last: u64) -> u64 {
        let Some(cursor) = self.cursors.get_mut(member) else {
            warn!("event=replica_cursor_unknown member={}", member);
            return 1;
        };
        let backed_off = cursor.next_index.saturating_sub(1).min(follower_last + 1);
        cursor.next_index = backed_off.max(cursor.match_index + 1).max(1);
        info!(
            "event=replica_cursor_backoff member={} next_index={}",
            member, cursor.next_index
        );
        cursor.next_index
    }

    /// Highest index replicated on a quorum, counting the leader itself.
    /// The caller must still verify the entry's term before committing.
    pub fn quorum_commit(&self, leader_last: u64, quorum: usize) -> u64 {
        let mut indices: Vec<u64> = self
            .cursors
            .values()
            .map(|cursor| cursor.match_index)
            .collect();
        indices.push(leader_last);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.get(quorum - 1).copied().unwrap_or(0)
    }
}
