//! The apply loop: moves `last_applied` toward `commit_index`, dispatching
//! each entry by kind. Command failures are reported and swallowed so the
//! log never wedges; ordering violations are fatal.

use crate::context::ReplicaContext;
use crate::events::ReplicaEvent;
use crate::storage::EntryKind;
use crate::snapshot;
use log::warn;
use std::sync::Arc;

/// Outcome of one applied `Command` entry, for completing pending
/// submissions on the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCommand {
    pub index: u64,
    pub term: u64,
    pub outcome: Result<Vec<u8>, String>,
}

/// Applies entries in strict index order until `last_applied` reaches
/// `commit_index`.
pub fn apply_committed(ctx: &mut ReplicaContext) -> Vec<AppliedCommand> {
    // A log that begins above the apply cursor had its prefix replaced by
    // a snapshot run; those indices are covered by the snapshot that
    // installs when its End entry applies. Skip to the log's start.
    let first = ctx.log.lock().first_index();
    if first > 0 {
        let target = (first - 1).min(ctx.commit_index);
        if ctx.last_applied < target {
            ctx.set_last_applied(target);
        }
    }

    let mut applied = Vec::new();
    while ctx.last_applied < ctx.commit_index {
        if let Some(result) = apply_entry(ctx, ctx.last_applied + 1) {
            applied.push(result);
        }
    }
    applied
}

fn apply_entry(ctx: &mut ReplicaContext, index: u64) -> Option<AppliedCommand> {
    assert_eq!(
        ctx.last_applied,
        index - 1,
        "entry at index {index} applied out of order"
    );
    let entry = {
        let log = Arc::clone(&ctx.log);
        let guard = log.lock();
        guard.entry(index).cloned()
    };
    let entry = entry.unwrap_or_else(|| panic!("no entry at applied index {index}"));

    match entry.kind {
        EntryKind::Command { name, args } => {
            let outcome = match ctx.machine.apply_command(&name, &args) {
                Ok(bytes) => Ok(bytes),
                Err(err) => {
                    warn!(
                        "event=replica_apply_error index={} command={} error={}",
                        index, name, err
                    );
                    Err(err.to_string())
                }
            };
            ctx.set_last_applied(index);
            return Some(AppliedCommand {
                index,
                term: entry.term,
                outcome,
            });
        }
        EntryKind::Configuration { members } => {
            ctx.cluster.set_remote_members(members.into_iter());
            ctx.events.publish(ReplicaEvent::MembershipChange {
                members: ctx.cluster.members(),
            });
            ctx.set_last_applied(index);
        }
        // Meaningless alone; the end entry drives reassembly.
        EntryKind::SnapshotStart { .. } | EntryKind::SnapshotChunk { .. } => {
            ctx.set_last_applied(index);
        }
        EntryKind::SnapshotEnd { .. } => {
            snapshot::install_from_log(ctx, index);
        }
        EntryKind::NoOp => {
            ctx.set_last_applied(index);
        }
    }
    None
}
